//! # Image and block grid geometry
//!
//! The leaked signal is block granular: every 8x8 pixel block of every color
//! channel produces exactly one block boundary. This module derives the block
//! grid from the image dimensions and holds the channel rollover rule.

use clap::ValueEnum;
use serde::Deserialize;

use crate::error::CaptureError;

/// Edge length of a decode block in source pixels.
pub const BLOCK_SIZE: usize = 8;

/// Order in which the decode routine walks blocks across color channels.
///
/// The rule depends on the traversal of the observed decoder and cannot be
/// inferred from the leakage itself, so it is fixed per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelOrder {
    /// Channel advances after every block
    #[default]
    RowInterleaved,
    /// Each channel decodes one full row of blocks before the next channel
    RowSequential,
    /// Each channel is fully decoded before the next one starts
    OnePass,
}

/// Block grid of one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockGrid {
    pub blocks_wide: usize,
    pub blocks_tall: usize,
}

impl BlockGrid {
    /// Grid covering `width` x `height` pixels, partial blocks rounded up
    pub fn for_image(width: usize, height: usize) -> Self {
        Self {
            blocks_wide: width.div_ceil(BLOCK_SIZE),
            blocks_tall: height.div_ceil(BLOCK_SIZE),
        }
    }

    /// Number of blocks per channel
    pub fn block_count(&self) -> usize {
        self.blocks_wide * self.blocks_tall
    }
}

/// Dimensions and channel layout of the image under decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub width: usize,
    pub height: usize,
    pub channels: usize,
    pub order: ChannelOrder,
}

impl Geometry {
    /// Creates a validated geometry.
    ///
    /// # Arguments
    ///
    /// * `width` - Image width in pixels.
    /// * `height` - Image height in pixels.
    /// * `channels` - Number of color channels, 1 (grayscale) or 3 (color).
    /// * `order` - Channel rollover rule of the observed decoder.
    ///
    /// # Returns
    ///
    /// * `Ok(Geometry)` - Dimensions are non-zero, the channel count is supported
    ///   and the pixel output fits into a single allocation.
    /// * `Err(CaptureError::Config)` - Otherwise.
    pub fn new(
        width: usize,
        height: usize,
        channels: usize,
        order: ChannelOrder,
    ) -> Result<Self, CaptureError> {
        if width == 0 || height == 0 {
            return Err(CaptureError::Config(format!(
                "image dimensions must be non-zero, got {width}x{height}"
            )));
        }
        if channels != 1 && channels != 3 {
            return Err(CaptureError::Config(format!(
                "unsupported channel count {channels}, expected 1 or 3"
            )));
        }
        pixel_bytes(width, height, channels).ok_or_else(|| {
            CaptureError::Config(format!(
                "{width}x{height} image with {channels} channel(s) exceeds the addressable output size"
            ))
        })?;
        Ok(Self {
            width,
            height,
            channels,
            order,
        })
    }

    pub fn grid(&self) -> BlockGrid {
        BlockGrid::for_image(self.width, self.height)
    }

    /// Total number of block boundaries a complete decode delivers
    pub fn total_blocks(&self) -> usize {
        self.channels * self.grid().block_count()
    }

    /// Size of the decoder's pixel output in bytes
    pub fn output_size(&self) -> usize {
        pixel_bytes(self.width, self.height, self.channels).unwrap_or(usize::MAX)
    }

    pub fn is_color(&self) -> bool {
        self.channels > 1
    }
}

/// `width * height * channels`, limited to what a single allocation can hold
pub(crate) fn pixel_bytes(width: usize, height: usize, channels: usize) -> Option<usize> {
    width
        .checked_mul(height)?
        .checked_mul(channels)
        .filter(|&bytes| bytes <= isize::MAX as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grid_rounds_partial_blocks_up() {
        let grid = BlockGrid::for_image(227, 149);
        assert_eq!(grid.blocks_wide, 29);
        assert_eq!(grid.blocks_tall, 19);
        assert_eq!(grid.block_count(), 551);

        let grid = BlockGrid::for_image(16, 16);
        assert_eq!((grid.blocks_wide, grid.blocks_tall), (2, 2));

        let grid = BlockGrid::for_image(1, 9);
        assert_eq!((grid.blocks_wide, grid.blocks_tall), (1, 2));
    }

    #[test]
    fn geometry_validation() {
        assert!(Geometry::new(0, 8, 1, ChannelOrder::OnePass).is_err());
        assert!(Geometry::new(8, 8, 2, ChannelOrder::OnePass).is_err());

        let geometry = Geometry::new(16, 16, 3, ChannelOrder::RowInterleaved).unwrap();
        assert_eq!(geometry.total_blocks(), 12);
        assert_eq!(geometry.output_size(), 768);
        assert!(geometry.is_color());
    }

    #[test]
    fn oversized_geometry_rejected() {
        for (width, height, channels) in [
            (usize::MAX / 2, 3, 1),
            (usize::MAX, usize::MAX, 1),
            (1usize << 31, 1usize << 31, 3),
        ] {
            assert!(matches!(
                Geometry::new(width, height, channels, ChannelOrder::OnePass),
                Err(CaptureError::Config(_))
            ));
        }

        let geometry = Geometry::new(1usize << 20, 1usize << 20, 3, ChannelOrder::OnePass).unwrap();
        assert_eq!(geometry.output_size(), 3usize << 40);
    }
}
