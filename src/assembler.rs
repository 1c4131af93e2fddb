//! # Reconstruction assembler
//!
//! Lays the per-block scores out on the block grid, one pixel per block, and
//! writes them as portable graymaps / pixmaps
//! (<https://en.wikipedia.org/wiki/Netpbm#File_formats>).

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use itertools::iproduct;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};

use crate::aggregator::Reconstruction;
use crate::error::CaptureError;

const COMPONENT: &str = "assembler";

/// Largest sample value of the single byte payload
const MAX_SAMPLE: u32 = u8::MAX as u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RasterFormat {
    /// Single channel graymap
    Gray,
    /// Three channel pixmap
    Color,
}

impl RasterFormat {
    pub fn tag(&self) -> &'static str {
        match self {
            RasterFormat::Gray => "P5",
            RasterFormat::Color => "P6",
        }
    }

    pub fn channels(&self) -> usize {
        match self {
            RasterFormat::Gray => 1,
            RasterFormat::Color => 3,
        }
    }
}

/// Encoded image: text header followed by raw samples.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Raster {
    pub format: RasterFormat,
    pub width: usize,
    pub height: usize,
    pub max_value: u32,
    pub data: Vec<u8>,
}

impl Raster {
    pub fn header(&self) -> String {
        format!(
            "{} {} {} {}\n",
            self.format.tag(),
            self.width,
            self.height,
            self.max_value
        )
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = self.header().into_bytes();
        bytes.extend_from_slice(&self.data);
        bytes
    }

    pub fn write_to(&self, path: &Path) -> Result<(), CaptureError> {
        let io_error = |source| CaptureError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = BufWriter::new(File::create(path).map_err(io_error)?);
        file.write_all(&self.encode()).map_err(io_error)?;
        file.flush().map_err(io_error)
    }
}

/// How scores are turned into samples.
///
/// The defaults write the raw scores; no upsampling or smoothing is ever
/// applied, one pixel stays one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    /// Also write an interleaved color composite for multi-channel captures
    pub composite: bool,
    /// Stretch scores from [min, max] to [0, 255]
    pub normalize: bool,
    /// Write 255 - value, so that complex blocks come out bright
    pub invert: bool,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            composite: true,
            normalize: false,
            invert: false,
        }
    }
}

/// Score to sample mapping shared by all rasters of one reconstruction
struct Scale {
    min: u32,
    max: u32,
    options: RenderOptions,
}

impl Scale {
    fn new(reconstruction: &Reconstruction, options: RenderOptions) -> Self {
        Self {
            min: reconstruction.min_score(),
            max: reconstruction.max_score,
            options,
        }
    }

    fn ceiling(&self) -> u32 {
        if self.options.normalize {
            MAX_SAMPLE
        } else {
            self.max.min(MAX_SAMPLE)
        }
    }

    fn sample(&self, score: u32) -> u8 {
        let value = if self.options.normalize {
            let range = self.max.saturating_sub(self.min);
            if range == 0 {
                0
            } else {
                (u64::from(score.saturating_sub(self.min)) * u64::from(MAX_SAMPLE)
                    / u64::from(range)) as u32
            }
        } else {
            score.min(MAX_SAMPLE)
        };

        if self.options.invert {
            (self.ceiling() - value.min(self.ceiling())) as u8
        } else {
            value as u8
        }
    }
}

/// Files written by [`render`] and the ones that failed.
#[derive(Debug, Default)]
pub struct RenderReport {
    pub written: Vec<PathBuf>,
    pub failed: Vec<CaptureError>,
}

impl RenderReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Verify that every channel buffer covers the block grid exactly
pub fn check_consistency(reconstruction: &Reconstruction) -> Result<(), CaptureError> {
    let expected = reconstruction.grid.block_count();
    for (channel, buffer) in reconstruction.channels.iter().enumerate() {
        if buffer.len() != expected {
            return Err(CaptureError::consistency(
                COMPONENT,
                channel,
                buffer.len(),
                format!(
                    "buffer holds {} blocks but the {}x{} grid needs {}",
                    buffer.len(),
                    reconstruction.grid.blocks_wide,
                    reconstruction.grid.blocks_tall,
                    expected
                ),
            ));
        }
    }
    Ok(())
}

/// Graymap of a single channel, one pixel per block
pub fn channel_raster(
    reconstruction: &Reconstruction,
    channel: usize,
    options: RenderOptions,
) -> Raster {
    let scale = Scale::new(reconstruction, options);
    Raster {
        format: RasterFormat::Gray,
        width: reconstruction.grid.blocks_wide,
        height: reconstruction.grid.blocks_tall,
        max_value: scale.ceiling(),
        data: reconstruction.channels[channel]
            .iter()
            .map(|&score| scale.sample(score))
            .collect(),
    }
}

/// Pixmap interleaving the three channel buffers
pub fn composite_raster(reconstruction: &Reconstruction, options: RenderOptions) -> Raster {
    let scale = Scale::new(reconstruction, options);
    let pixels = reconstruction.grid.block_count();
    Raster {
        format: RasterFormat::Color,
        width: reconstruction.grid.blocks_wide,
        height: reconstruction.grid.blocks_tall,
        max_value: scale.ceiling(),
        data: iproduct!(0..pixels, reconstruction.channels.iter())
            .map(|(pixel, channel)| scale.sample(channel[pixel]))
            .collect(),
    }
}

/// File name of the graymap for `channel`
pub fn channel_file_name(name: &str, channel: usize) -> String {
    format!("{name}-reconstruct-channel-{channel}-gray.pgm")
}

/// File name of the color composite
pub fn composite_file_name(name: &str) -> String {
    format!("{name}-reconstruct-color.ppm")
}

/// Write all rasters of a reconstruction into `directory`.
///
/// # Arguments
///
/// * `reconstruction` - Scores handed over by the aggregator.
/// * `directory` - Output directory, must exist.
/// * `name` - Base name of the written files.
/// * `options` - Sample mapping and composite selection.
///
/// # Returns
///
/// * `Ok(RenderReport)` - Every raster was attempted; failed writes are listed
///   in the report and do not stop the remaining ones.
/// * `Err(CaptureError::Consistency)` - A buffer does not match the grid,
///   nothing was written.
pub fn render(
    reconstruction: &Reconstruction,
    directory: &Path,
    name: &str,
    options: RenderOptions,
) -> Result<RenderReport, CaptureError> {
    check_consistency(reconstruction)?;

    if !options.normalize && reconstruction.max_score > MAX_SAMPLE {
        warn!(
            "Maximum score {} exceeds {}, samples saturate",
            reconstruction.max_score, MAX_SAMPLE
        );
    }

    let mut rasters: Vec<(PathBuf, Raster)> = (0..reconstruction.channel_count())
        .map(|channel| {
            (
                directory.join(channel_file_name(name, channel)),
                channel_raster(reconstruction, channel, options),
            )
        })
        .collect();

    if options.composite && reconstruction.channel_count() == RasterFormat::Color.channels() {
        rasters.push((
            directory.join(composite_file_name(name)),
            composite_raster(reconstruction, options),
        ));
    }

    let mut report = RenderReport::default();
    for (path, raster) in rasters {
        match raster.write_to(&path) {
            Ok(()) => {
                debug!("Wrote {} ({}x{})", path.display(), raster.width, raster.height);
                report.written.push(path);
            }
            Err(err) => {
                error!("{err}");
                report.failed.push(err);
            }
        }
    }

    info!(
        "Rendered {} of {} rasters",
        report.written.len(),
        report.written.len() + report.failed.len()
    );
    Ok(report)
}

#[derive(Serialize)]
struct RawDump<'a> {
    blocks_wide: usize,
    blocks_tall: usize,
    max_score: u32,
    /// `[channel][row][column]`
    channels: Vec<Vec<&'a [u32]>>,
}

/// Write the unscaled scores as pretty printed JSON
pub fn write_raw_dump(reconstruction: &Reconstruction, path: &Path) -> Result<(), CaptureError> {
    let dump = RawDump {
        blocks_wide: reconstruction.grid.blocks_wide,
        blocks_tall: reconstruction.grid.blocks_tall,
        max_score: reconstruction.max_score,
        channels: (0..reconstruction.channel_count())
            .map(|channel| reconstruction.rows(channel).collect())
            .collect(),
    };

    let io_error = |source| CaptureError::Io {
        path: path.to_path_buf(),
        source,
    };
    let mut file = BufWriter::new(File::create(path).map_err(io_error)?);
    serde_json::to_writer_pretty(&mut file, &dump)
        .map_err(io::Error::from)
        .map_err(io_error)?;
    file.flush().map_err(io_error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::BlockGrid;

    fn reconstruction(channels: Vec<Vec<u32>>, blocks_wide: usize) -> Reconstruction {
        let blocks_tall = channels[0].len() / blocks_wide;
        let max_score = channels.iter().flatten().copied().max().unwrap_or(0);
        Reconstruction {
            grid: BlockGrid {
                blocks_wide,
                blocks_tall,
            },
            channels,
            max_score,
        }
    }

    #[test]
    fn graymap_header_and_payload() {
        let rec = reconstruction(vec![vec![0, 1, 2, 3, 4, 5]], 3);
        let raster = channel_raster(&rec, 0, RenderOptions::default());
        assert_eq!(raster.header(), "P5 3 2 5\n");
        assert_eq!(raster.encode(), b"P5 3 2 5\n\x00\x01\x02\x03\x04\x05".to_vec());
    }

    #[test]
    fn composite_interleaves_channels() {
        let rec = reconstruction(vec![vec![1, 2], vec![10, 20], vec![100, 200]], 2);
        let raster = composite_raster(&rec, RenderOptions::default());
        assert_eq!(raster.header(), "P6 2 1 200\n");
        assert_eq!(raster.data, vec![1, 10, 100, 2, 20, 200]);
    }

    #[test]
    fn large_scores_saturate() {
        let rec = reconstruction(vec![vec![0, 300]], 2);
        let raster = channel_raster(&rec, 0, RenderOptions::default());
        assert_eq!(raster.max_value, 255);
        assert_eq!(raster.data, vec![0, 255]);
    }

    #[test]
    fn normalize_and_invert() {
        let rec = reconstruction(vec![vec![10, 20, 30]], 3);
        let options = RenderOptions {
            normalize: true,
            ..Default::default()
        };
        assert_eq!(channel_raster(&rec, 0, options).data, vec![0, 127, 255]);

        let options = RenderOptions {
            normalize: true,
            invert: true,
            ..Default::default()
        };
        let raster = channel_raster(&rec, 0, options);
        assert_eq!(raster.max_value, 255);
        assert_eq!(raster.data, vec![255, 128, 0]);

        let options = RenderOptions {
            invert: true,
            ..Default::default()
        };
        assert_eq!(channel_raster(&rec, 0, options).data, vec![20, 10, 0]);
    }

    #[test]
    fn mismatched_buffer_is_fatal() {
        let mut rec = reconstruction(vec![vec![0; 4], vec![0; 4], vec![0; 4]], 2);
        rec.channels[2].pop();
        let dir = tempfile::tempdir().unwrap();
        match render(&rec, dir.path(), "img", RenderOptions::default()) {
            Err(CaptureError::Consistency { channel, block, .. }) => {
                assert_eq!((channel, block), (2, 3))
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn failed_file_does_not_stop_others() {
        let rec = reconstruction(vec![vec![1; 4], vec![2; 4], vec![3; 4]], 2);
        let dir = tempfile::tempdir().unwrap();
        // A directory in place of the second graymap makes its creation fail
        std::fs::create_dir(dir.path().join(channel_file_name("img", 1))).unwrap();

        let report = render(&rec, dir.path(), "img", RenderOptions::default()).unwrap();
        assert!(!report.is_complete());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.written.len(), 3);
        assert!(dir.path().join(channel_file_name("img", 2)).is_file());
        assert!(dir.path().join(composite_file_name("img")).is_file());
    }

    #[test]
    fn raw_dump_nests_rows() {
        let rec = reconstruction(vec![vec![1, 2, 3, 4]], 2);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.json");
        write_raw_dump(&rec, &path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(value["blocks_wide"], 2);
        assert_eq!(value["max_score"], 4);
        assert_eq!(value["channels"], serde_json::json!([[[1, 2], [3, 4]]]));
    }
}
