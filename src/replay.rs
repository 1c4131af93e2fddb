//! # Leakage trace replay
//!
//! A recorded leakage trace stands in for the isolated decoder: the
//! [`TraceReplay`] proxy accepts the trace as its "image" and delivers the
//! recorded signals through the hooks when asked to decompress.
//!
//! Trace text format, whitespace separated tokens, `#` comments to end of line:
//!
//! * `a` - one activity signal
//! * `b` - one block boundary
//! * `<n>` - `n` activity signals followed by one block boundary

use std::fmt;
use std::str::FromStr;

use log::{debug, error, warn};

use crate::geometry::Geometry;
use crate::proxy::{DecodeProxy, LeakageHooks, Status, INVALID_SIZE};

/// Tokens written per line when printing a trace
const TOKENS_PER_LINE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeakEvent {
    /// Run of consecutive activity signals
    Activity(u32),
    Boundary,
}

/// Ordered sequence of leakage signals, activity stored run-length encoded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventTrace {
    events: Vec<LeakEvent>,
}

impl EventTrace {
    /// Parse the textual trace format
    pub fn parse(text: &str) -> Result<Self, String> {
        let mut trace = Self::default();
        for (line_number, line) in text.lines().enumerate() {
            let content = line.split('#').next().unwrap_or("");
            for token in content.split_whitespace() {
                match token {
                    "a" => trace.push(LeakEvent::Activity(1)),
                    "b" => trace.push(LeakEvent::Boundary),
                    _ => {
                        // Block scores are u32, larger counts cannot come from a decoder
                        let count: u32 = token.parse().map_err(|_| {
                            format!("line {}: invalid trace token {:?}", line_number + 1, token)
                        })?;
                        trace.push(LeakEvent::Activity(count));
                        trace.push(LeakEvent::Boundary);
                    }
                }
            }
        }
        Ok(trace)
    }

    /// Trace of consecutive blocks with the given activity counts
    pub fn from_block_counts(counts: impl IntoIterator<Item = u32>) -> Self {
        let mut trace = Self::default();
        for count in counts {
            trace.push(LeakEvent::Activity(count));
            trace.push(LeakEvent::Boundary);
        }
        trace
    }

    /// Append an event, merging adjacent activity runs
    pub fn push(&mut self, event: LeakEvent) {
        if let LeakEvent::Activity(count) = event {
            if count == 0 {
                return;
            }
            if let Some(LeakEvent::Activity(run)) = self.events.last_mut() {
                if let Some(total) = run.checked_add(count) {
                    *run = total;
                    return;
                }
            }
        }
        self.events.push(event);
    }

    pub fn events(&self) -> &[LeakEvent] {
        &self.events
    }

    /// Number of block boundaries in the trace
    pub fn boundaries(&self) -> usize {
        self.events
            .iter()
            .filter(|&&event| event == LeakEvent::Boundary)
            .count()
    }

    /// Number of activity signals in the trace
    pub fn activities(&self) -> u64 {
        self.events
            .iter()
            .map(|event| match event {
                LeakEvent::Activity(count) => u64::from(*count),
                LeakEvent::Boundary => 0,
            })
            .sum()
    }

    /// Deliver every event to `hooks` in recorded order
    pub fn replay(&self, hooks: &mut dyn LeakageHooks) {
        for event in &self.events {
            match *event {
                LeakEvent::Activity(count) => {
                    for _ in 0..count {
                        hooks.on_activity();
                    }
                }
                LeakEvent::Boundary => hooks.on_block_boundary(),
            }
        }
    }
}

impl FromStr for EventTrace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for EventTrace {
    /// Prints each completed block as its activity count, trailing activity as `a`
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let mut tokens = Vec::new();
        let mut pending = 0u64;
        for event in &self.events {
            match event {
                LeakEvent::Activity(count) => pending += u64::from(*count),
                LeakEvent::Boundary => {
                    tokens.push(pending.to_string());
                    pending = 0;
                }
            }
        }
        tokens.extend(std::iter::repeat("a".to_string()).take(pending as usize));

        for line in tokens.chunks(TOKENS_PER_LINE) {
            writeln!(f, "{}", line.join(" "))?;
        }
        Ok(())
    }
}

/// Decode proxy replaying a recorded leakage trace.
#[derive(Debug)]
pub struct TraceReplay {
    geometry: Geometry,
    trace: Option<EventTrace>,
    max_output_size: usize,
}

impl TraceReplay {
    pub fn new(geometry: Geometry) -> Self {
        Self {
            geometry,
            trace: None,
            max_output_size: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.trace.is_some()
    }
}

impl DecodeProxy for TraceReplay {
    fn load(&mut self, image: &[u8], max_output_size: usize) -> Result<(), Status> {
        let text = std::str::from_utf8(image).map_err(|err| {
            error!("Leakage trace is not valid UTF-8: {err}");
            Status::INVALID_PARAMETER
        })?;
        let trace = EventTrace::parse(text).map_err(|err| {
            error!("Malformed leakage trace: {err}");
            Status::INVALID_PARAMETER
        })?;

        debug!(
            "Loaded trace with {} activity signals, {} block boundaries",
            trace.activities(),
            trace.boundaries()
        );
        self.trace = Some(trace);
        self.max_output_size = max_output_size;
        Ok(())
    }

    fn decompress(&mut self, hooks: &mut dyn LeakageHooks) -> Result<usize, Status> {
        let Some(trace) = &self.trace else {
            error!("Decompress called without a loaded trace");
            return Err(Status::UNEXPECTED);
        };

        let size = self.geometry.output_size();
        if self.max_output_size < size {
            warn!(
                "Output buffer of {} bytes too small for {} bytes of pixels",
                self.max_output_size, size
            );
            return Ok(INVALID_SIZE);
        }

        trace.replay(hooks);
        Ok(size)
    }

    fn free(&mut self) -> Result<(), Status> {
        self.trace = None;
        self.max_output_size = 0;
        Ok(())
    }
}
