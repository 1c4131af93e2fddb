//! # Page access trace replay
//!
//! Offline reconstruction from a recorded page access trace (VCD, one 1-bit
//! wire `_<page>` per code or data page inside the `trace` module). A small
//! state machine follows the decoder through its code pages. Each access to a
//! coefficient data page while inside the IDCT counts as one activity signal,
//! and leaving the data pages again closes the block.

use std::collections::HashMap;
use std::io::BufReader;
use std::ops::Range;

use log::{debug, error, trace, warn};
use serde::Deserialize;

use crate::geometry::Geometry;
use crate::proxy::{DecodeProxy, LeakageHooks, Status, INVALID_SIZE};

/// VCD module holding the page wires
const TRACE_SCOPE: &str = "trace";

/// Page ranges identifying the decoder's phases.
///
/// The defaults match the page layout of the instrumented libjpeg build.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct PageMap {
    pub start: Range<usize>,
    pub next_row: Range<usize>,
    pub start_row: Range<usize>,
    pub pre_idct: Range<usize>,
    pub idct: Range<usize>,
    pub data: Range<usize>,
}

impl Default for PageMap {
    fn default() -> Self {
        Self {
            start: 54..55,
            next_row: 44..46,
            start_row: 58..59,
            pre_idct: 59..60,
            idct: 63..65,
            data: 150..4340,
        }
    }
}

impl PageMap {
    /// Layout when AEX-Notify is enabled, the mitigation's own pages end the data range early
    pub fn aex_notify() -> Self {
        Self {
            data: 150..4335,
            ..Self::default()
        }
    }

    fn pages(&self, state: PageState) -> Range<usize> {
        match state {
            PageState::Start => self.start.clone(),
            PageState::NextRow => self.next_row.clone(),
            PageState::StartRow => self.start_row.clone(),
            PageState::PreIdct => self.pre_idct.clone(),
            PageState::Idct => self.idct.clone(),
            PageState::DataCount(_) => self.data.clone(),
            PageState::PreStart => 0..0,
        }
    }

    /// One past the highest page any state reacts to
    pub fn page_limit(&self) -> usize {
        [
            &self.start,
            &self.next_row,
            &self.start_row,
            &self.pre_idct,
            &self.idct,
            &self.data,
        ]
        .iter()
        .map(|range| range.end)
        .max()
        .unwrap_or(0)
    }
}

/// Decoder phase inferred from the page access sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PageState {
    #[default]
    PreStart,
    Start,
    NextRow,
    StartRow,
    PreIdct,
    Idct,
    /// Inside the IDCT data pages, with the number of accesses so far
    DataCount(u32),
}

impl PageState {
    /// States reachable from `self`, in order of precedence
    fn successors(self) -> Vec<Self> {
        match self {
            Self::PreStart => vec![Self::Start],
            Self::Start | Self::NextRow => vec![Self::StartRow],
            Self::StartRow => vec![Self::Idct],
            Self::PreIdct => vec![Self::Idct, Self::NextRow],
            Self::Idct => vec![Self::DataCount(1)],
            Self::DataCount(count) => vec![
                Self::DataCount(count.saturating_add(1)),
                Self::PreIdct,
                Self::NextRow,
            ],
        }
    }

    /// State after an access to `page`; pages no successor claims are ignored
    pub fn next(self, page: usize, map: &PageMap) -> Self {
        self.successors()
            .into_iter()
            .find(|&state| map.pages(state).contains(&page))
            .unwrap_or(self)
    }
}

/// Walks page accesses through [`PageState`] and emits leakage signals.
#[derive(Debug, Clone)]
pub struct PageWalker {
    map: PageMap,
    state: PageState,
    rows: usize,
}

impl PageWalker {
    pub fn new(map: PageMap) -> Self {
        Self {
            map,
            state: PageState::PreStart,
            rows: 0,
        }
    }

    pub fn state(&self) -> PageState {
        self.state
    }

    /// Block rows the decoder moved on from
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Feed one page access
    pub fn access(&mut self, page: usize, hooks: &mut dyn LeakageHooks) {
        let previous = self.state;
        let next = previous.next(page, &self.map);
        if next == previous {
            return;
        }
        trace!("Page {page}: {previous:?} -> {next:?}");

        match (previous, next) {
            (_, PageState::DataCount(_)) => hooks.on_activity(),
            (PageState::DataCount(count), _) => {
                trace!("Block closed after {count} data accesses");
                hooks.on_block_boundary();
            }
            _ => {}
        }
        if previous == PageState::NextRow && next == PageState::StartRow {
            self.rows += 1;
            debug!("Decoder entered block row {}", self.rows);
        }
        self.state = next;
    }
}

/// Page access sequence read from a VCD trace
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageTrace {
    accesses: Vec<usize>,
}

impl PageTrace {
    pub fn new(accesses: Vec<usize>) -> Self {
        Self { accesses }
    }

    /// Read rising edges of the `_<page>` wires below `page_limit`
    pub fn from_vcd(data: &[u8], page_limit: usize) -> Result<Self, String> {
        let mut parser = vcd::Parser::new(BufReader::new(data));
        let header = parser
            .parse_header()
            .map_err(|e| format!("Failed to parse VCD header: {}", e))?;

        let wires: HashMap<vcd::IdCode, usize> = (0..page_limit)
            .filter_map(|page| {
                let name = format!("_{page}");
                header
                    .find_var(&[TRACE_SCOPE, name.as_str()])
                    .map(|var| (var.code, page))
            })
            .collect();
        if wires.is_empty() {
            warn!("VCD trace has no page wires in module `{TRACE_SCOPE}`");
        }

        let mut accesses = Vec::new();
        for command in parser {
            let command = command.map_err(|e| format!("Failed to parse VCD body: {}", e))?;
            if let vcd::Command::ChangeScalar(code, vcd::Value::V1) = command {
                if let Some(&page) = wires.get(&code) {
                    accesses.push(page);
                }
            }
        }
        Ok(Self { accesses })
    }

    pub fn accesses(&self) -> &[usize] {
        &self.accesses
    }

    /// Walk the whole sequence, returning the walker's final position
    pub fn replay(&self, map: &PageMap, hooks: &mut dyn LeakageHooks) -> PageWalker {
        let mut walker = PageWalker::new(map.clone());
        for &page in &self.accesses {
            walker.access(page, hooks);
        }
        walker
    }
}

/// Decode proxy replaying a recorded page access trace.
#[derive(Debug)]
pub struct PageReplay {
    geometry: Geometry,
    map: PageMap,
    trace: Option<PageTrace>,
    max_output_size: usize,
}

impl PageReplay {
    pub fn new(geometry: Geometry, map: PageMap) -> Self {
        Self {
            geometry,
            map,
            trace: None,
            max_output_size: 0,
        }
    }

    pub fn is_loaded(&self) -> bool {
        self.trace.is_some()
    }
}

impl DecodeProxy for PageReplay {
    fn load(&mut self, image: &[u8], max_output_size: usize) -> Result<(), Status> {
        let trace = PageTrace::from_vcd(image, self.map.page_limit()).map_err(|err| {
            error!("Malformed page trace: {err}");
            Status::INVALID_PARAMETER
        })?;
        debug!("Loaded {} page accesses", trace.accesses().len());
        self.trace = Some(trace);
        self.max_output_size = max_output_size;
        Ok(())
    }

    fn decompress(&mut self, hooks: &mut dyn LeakageHooks) -> Result<usize, Status> {
        let Some(trace) = &self.trace else {
            error!("Decompress called without a loaded page trace");
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

        let walker = trace.replay(&self.map, hooks);
        debug!(
            "Page walk ended in {:?} after {} block rows",
            walker.state(),
            walker.rows()
        );
        Ok(size)
    }

    fn free(&mut self) -> Result<(), Status> {
        self.trace = None;
        self.max_output_size = 0;
        Ok(())
    }
}
