//! # Block complexity tracking
//!
//! Turns the stream of leakage signals into one complexity score per block and
//! channel. The tracker is created fresh for every decode invocation, receives
//! the signals through [`LeakageHooks`] and is consumed by [`BlockTracker::finish`]
//! once the decode returned.

use indicatif::ProgressBar;
use log::{debug, error, trace};

use crate::error::CaptureError;
use crate::geometry::{BlockGrid, ChannelOrder, Geometry};
use crate::proxy::LeakageHooks;

const COMPONENT: &str = "aggregator";

/// Position of the tracker within the decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunState {
    /// Channel the next block boundary is accounted to
    pub channel: usize,
    /// Index of the current block within that channel
    pub block: usize,
    /// Position of the current block within its block row
    pub row_position: usize,
    /// Largest score stored so far
    pub max_score: u32,
}

/// Accumulates per-block complexity scores from leakage signals.
#[derive(Debug)]
pub struct BlockTracker {
    geometry: Geometry,
    grid: BlockGrid,
    state: RunState,
    score: u32,
    consumed: Vec<usize>,
    buffers: Vec<Vec<u32>>,
    boundaries: usize,
    activities: u64,
    error: Option<CaptureError>,
    progress: Option<ProgressBar>,
}

impl BlockTracker {
    pub fn new(geometry: Geometry) -> Self {
        let grid = geometry.grid();
        Self {
            geometry,
            grid,
            state: RunState::default(),
            score: 0,
            consumed: vec![0; geometry.channels],
            buffers: vec![vec![0; grid.block_count()]; geometry.channels],
            boundaries: 0,
            activities: 0,
            error: None,
            progress: None,
        }
    }

    /// Advance `bar` by one for every stored block
    pub fn with_progress(mut self, bar: ProgressBar) -> Self {
        self.progress = Some(bar);
        self
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Score collected for the block currently being decoded
    pub fn pending_score(&self) -> u32 {
        self.score
    }

    /// Number of block boundaries accounted so far
    pub fn boundaries(&self) -> usize {
        self.boundaries
    }

    /// Number of activity signals accounted so far
    pub fn activities(&self) -> u64 {
        self.activities
    }

    /// All blocks of all channels have been stored
    pub fn is_complete(&self) -> bool {
        self.boundaries == self.geometry.total_blocks()
    }

    /// First bookkeeping error detected during the decode, if any
    pub fn error(&self) -> Option<&CaptureError> {
        self.error.as_ref()
    }

    /// Freeze the tracker and hand the scores over for rendering.
    ///
    /// # Returns
    ///
    /// * `Ok(Reconstruction)` - Every channel received exactly its block count.
    /// * `Err(CaptureError::Consistency)` - A latched signal error, or a decode
    ///   that ended with a boundary count differing from the expected total.
    pub fn finish(self) -> Result<Reconstruction, CaptureError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let expected = self.grid.block_count();
        if let Some((channel, &consumed)) = self
            .consumed
            .iter()
            .enumerate()
            .find(|&(_, &consumed)| consumed != expected)
        {
            let err = CaptureError::consistency(
                COMPONENT,
                channel,
                consumed,
                format!(
                    "decode ended after {} of {} block boundaries",
                    self.boundaries,
                    self.geometry.total_blocks()
                ),
            );
            error!("{err}");
            return Err(err);
        }

        debug!(
            "Captured {} blocks, {} activity signals, max score {}",
            self.boundaries, self.activities, self.state.max_score
        );

        Ok(Reconstruction {
            grid: self.grid,
            channels: self.buffers,
            max_score: self.state.max_score,
        })
    }

    /// Keep only the first error, later signals are ignored
    fn latch(&mut self, err: CaptureError) {
        error!("{err}");
        self.error = Some(err);
    }

    /// Apply the channel rollover rule after a block of `channel` was stored
    fn advance(&mut self, channel: usize) {
        let stored = self.consumed[channel];
        let row_done = stored % self.grid.blocks_wide == 0;
        let next_channel = match self.geometry.order {
            ChannelOrder::RowInterleaved => true,
            ChannelOrder::RowSequential => row_done,
            ChannelOrder::OnePass => stored == self.grid.block_count(),
        };

        if row_done {
            debug!(
                "Channel {} finished block row {}",
                channel,
                stored / self.grid.blocks_wide - 1
            );
        }

        if next_channel {
            self.state.channel = (channel + 1) % self.geometry.channels;
        }
        self.state.block = self.consumed[self.state.channel];
        self.state.row_position = self.state.block % self.grid.blocks_wide;
    }
}

impl LeakageHooks for BlockTracker {
    fn on_activity(&mut self) {
        if self.error.is_some() {
            return;
        }
        if self.is_complete() {
            let err = CaptureError::consistency(
                COMPONENT,
                self.state.channel,
                self.state.block,
                "activity signal after the final block boundary",
            );
            self.latch(err);
            return;
        }
        self.score = self.score.saturating_add(1);
        self.activities += 1;
    }

    fn on_block_boundary(&mut self) {
        if self.error.is_some() {
            return;
        }

        let channel = self.state.channel;
        let block = self.consumed[channel];
        if block >= self.grid.block_count() {
            let err = CaptureError::consistency(
                COMPONENT,
                channel,
                block,
                format!(
                    "block boundary beyond the channel's {} blocks",
                    self.grid.block_count()
                ),
            );
            self.latch(err);
            return;
        }

        trace!("Block {block} of channel {channel}: complexity = {}", self.score);
        self.buffers[channel][block] = self.score;
        self.state.max_score = self.state.max_score.max(self.score);
        self.score = 0;
        self.consumed[channel] += 1;
        self.boundaries += 1;
        if let Some(bar) = &self.progress {
            bar.inc(1);
        }

        self.advance(channel);
    }
}

/// Per-channel block scores of a finished decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reconstruction {
    pub grid: BlockGrid,
    /// One buffer per channel, block scores in row-major grid order
    pub channels: Vec<Vec<u32>>,
    pub max_score: u32,
}

impl Reconstruction {
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Block rows of one channel
    pub fn rows(&self, channel: usize) -> impl Iterator<Item = &[u32]> {
        self.channels[channel].chunks(self.grid.blocks_wide.max(1))
    }

    pub fn min_score(&self) -> u32 {
        self.channels
            .iter()
            .flatten()
            .copied()
            .min()
            .unwrap_or(0)
    }

    /// Upper median over the scores of all channels
    pub fn median_score(&self) -> u32 {
        let mut scores: Vec<u32> = self.channels.iter().flatten().copied().collect();
        if scores.is_empty() {
            return 0;
        }
        let middle = scores.len() / 2;
        *scores.select_nth_unstable(middle).1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(width: usize, height: usize, channels: usize, order: ChannelOrder) -> BlockTracker {
        BlockTracker::new(Geometry::new(width, height, channels, order).unwrap())
    }

    fn feed(tracker: &mut BlockTracker, counts: &[u32]) {
        for &count in counts {
            for _ in 0..count {
                tracker.on_activity();
            }
            tracker.on_block_boundary();
        }
    }

    #[test]
    fn single_channel_without_activity_is_all_zero() {
        let mut tracker = tracker(227, 149, 1, ChannelOrder::RowInterleaved);
        feed(&mut tracker, &[0; 551]);
        assert!(tracker.is_complete());

        let reconstruction = tracker.finish().unwrap();
        assert_eq!(reconstruction.channels.len(), 1);
        assert_eq!(reconstruction.channels[0].len(), 551);
        assert!(reconstruction.channels[0].iter().all(|&score| score == 0));
        assert_eq!(reconstruction.max_score, 0);
    }

    #[test]
    fn row_interleaved_rotates_channel_every_block() {
        let mut tracker = tracker(16, 16, 3, ChannelOrder::RowInterleaved);
        let mut seen = Vec::new();
        for step in 0..12u32 {
            let state = tracker.state();
            seen.push((state.channel, state.block));
            for _ in 0..step {
                tracker.on_activity();
            }
            tracker.on_block_boundary();
        }
        // (channel, block) visited in c0b0, c1b0, c2b0, c0b1, ... order
        let expected: Vec<(usize, usize)> = (0..12).map(|i| (i % 3, i / 3)).collect();
        assert_eq!(seen, expected);

        let reconstruction = tracker.finish().unwrap();
        assert_eq!(reconstruction.channels[0], vec![0, 3, 6, 9]);
        assert_eq!(reconstruction.channels[1], vec![1, 4, 7, 10]);
        assert_eq!(reconstruction.channels[2], vec![2, 5, 8, 11]);
        assert_eq!(reconstruction.max_score, 11);
    }

    #[test]
    fn row_sequential_advances_after_full_row() {
        let mut tracker = tracker(16, 16, 3, ChannelOrder::RowSequential);
        feed(&mut tracker, &[1, 2, 10, 20, 100, 200, 3, 4, 30, 40, 150, 250]);
        let reconstruction = tracker.finish().unwrap();
        assert_eq!(reconstruction.channels[0], vec![1, 2, 3, 4]);
        assert_eq!(reconstruction.channels[1], vec![10, 20, 30, 40]);
        assert_eq!(reconstruction.channels[2], vec![100, 200, 150, 250]);
        assert_eq!(reconstruction.max_score, 250);
    }

    #[test]
    fn one_pass_consumes_whole_channel_first() {
        let mut tracker = tracker(16, 8, 3, ChannelOrder::OnePass);
        feed(&mut tracker, &[1, 2]);
        assert_eq!(tracker.state().channel, 1);
        assert_eq!(tracker.state().block, 0);
        feed(&mut tracker, &[3, 4, 5, 6]);
        let reconstruction = tracker.finish().unwrap();
        assert_eq!(reconstruction.channels, vec![vec![1, 2], vec![3, 4], vec![5, 6]]);
    }

    #[test]
    fn row_position_wraps_at_row_width() {
        let mut tracker = tracker(24, 16, 1, ChannelOrder::RowInterleaved);
        feed(&mut tracker, &[0, 0]);
        assert_eq!(tracker.state().row_position, 2);
        feed(&mut tracker, &[0]);
        assert_eq!(tracker.state().row_position, 0);
        assert_eq!(tracker.state().block, 3);
    }

    #[test]
    fn extra_boundary_is_consistency_error() {
        let mut tracker = tracker(8, 8, 1, ChannelOrder::OnePass);
        feed(&mut tracker, &[1, 1]);
        match tracker.finish() {
            Err(CaptureError::Consistency { channel, block, .. }) => {
                assert_eq!(channel, 0);
                assert_eq!(block, 1);
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn activity_after_completion_is_reported() {
        let mut tracker = tracker(8, 8, 1, ChannelOrder::RowInterleaved);
        feed(&mut tracker, &[4]);
        tracker.on_activity();
        assert!(tracker.error().is_some());
        assert!(matches!(
            tracker.finish(),
            Err(CaptureError::Consistency { component: "aggregator", .. })
        ));
    }

    #[test]
    fn missing_boundaries_detected_at_finish() {
        let mut tracker = tracker(16, 16, 1, ChannelOrder::RowInterleaved);
        feed(&mut tracker, &[1, 2, 3]);
        match tracker.finish() {
            Err(CaptureError::Consistency { channel, block, detail, .. }) => {
                assert_eq!((channel, block), (0, 3));
                assert!(detail.contains("3 of 4"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }

    #[test]
    fn first_error_wins() {
        let mut tracker = tracker(8, 8, 1, ChannelOrder::RowInterleaved);
        feed(&mut tracker, &[0]);
        tracker.on_activity();
        tracker.on_block_boundary();
        match tracker.error() {
            Some(CaptureError::Consistency { detail, .. }) => {
                assert!(detail.contains("activity signal"))
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn scores_never_exceed_delivered_activity() {
        let counts = [5, 0, 17, 2, 9, 1];
        let mut tracker = tracker(24, 16, 1, ChannelOrder::RowInterleaved);
        feed(&mut tracker, &counts);
        assert_eq!(tracker.activities(), counts.iter().map(|&c| c as u64).sum::<u64>());
        let reconstruction = tracker.finish().unwrap();
        assert_eq!(reconstruction.channels[0], counts.to_vec());
        assert_eq!(reconstruction.rows(0).count(), 2);
        assert_eq!(reconstruction.min_score(), 0);
    }

    #[test]
    fn progress_counts_stored_blocks() {
        let bar = ProgressBar::hidden();
        let mut tracker = tracker(16, 16, 3, ChannelOrder::RowInterleaved).with_progress(bar.clone());
        feed(&mut tracker, &[1; 12]);
        // Rejected boundaries do not advance the bar
        tracker.on_block_boundary();
        assert_eq!(bar.position(), 12);
    }

    #[test]
    fn median_over_all_channels() {
        let mut tracker = tracker(16, 8, 3, ChannelOrder::OnePass);
        feed(&mut tracker, &[9, 1, 4, 4, 7, 2]);
        let reconstruction = tracker.finish().unwrap();
        assert_eq!(reconstruction.min_score(), 1);
        assert_eq!(reconstruction.median_score(), 4);
        assert_eq!(reconstruction.max_score, 9);
    }
}
