use clap::Parser;
use serde::Deserialize;
use std::path::PathBuf;

use crate::assembler::RenderOptions;
use crate::error::CaptureError;
use crate::geometry::{pixel_bytes, ChannelOrder, Geometry};
use crate::page_trace::PageMap;

/// Extra output buffer bytes reserved on top of the raw pixel size
const OUTPUT_SLACK: usize = 100;

/// Configuration structure that can be loaded from JSON
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub trace: Option<PathBuf>,
    #[serde(default)]
    pub vcd: Option<PathBuf>,
    #[serde(default)]
    pub aex_notify: bool,
    /// Custom page layout, replaces the built-in one
    #[serde(default)]
    pub pages: Option<PageMap>,
    #[serde(default)]
    pub width: usize,
    #[serde(default)]
    pub height: usize,
    #[serde(default)]
    pub color: bool,
    #[serde(default)]
    pub order: ChannelOrder,
    #[serde(default = "Config::default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default = "Config::default_name")]
    pub name: String,
    #[serde(default)]
    pub raw_output: Option<PathBuf>,
    #[serde(default)]
    pub max_output_size: Option<usize>,
    #[serde(default)]
    pub no_step: bool,
    #[serde(default)]
    pub render: RenderOptions,
}

impl Config {
    // Keep defaults in sync with CLI defaults
    fn default_output_dir() -> PathBuf {
        PathBuf::from(".")
    }

    fn default_name() -> String {
        String::from("capture")
    }

    /// Load configuration from JSON5 file
    pub fn from_file(path: &PathBuf) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file: {}", e))?;

        Self::from_json5(&content)
    }

    /// Parse configuration from JSON5 text
    pub fn from_json5(content: &str) -> Result<Self, String> {
        json5::from_str(content).map_err(|e| format!("Failed to parse JSON5 config: {}", e))
    }

    /// Create Config from command line arguments
    pub fn from_args(args: &Args) -> Self {
        Self {
            trace: args.trace.clone(),
            vcd: args.vcd.clone(),
            aex_notify: args.aex_notify,
            pages: None,
            width: args.width.unwrap_or(0),
            height: args.height.unwrap_or(0),
            color: args.color,
            order: args.order.unwrap_or_default(),
            output_dir: args
                .output_dir
                .clone()
                .unwrap_or_else(Self::default_output_dir),
            name: args.name.clone().unwrap_or_else(Self::default_name),
            raw_output: args.raw_output.clone(),
            max_output_size: args.max_output_size,
            no_step: args.no_step,
            render: RenderOptions {
                composite: !args.no_composite,
                normalize: args.normalize,
                invert: args.invert,
            },
        }
    }

    /// Override config values with command line arguments
    pub fn override_with_args(&mut self, args: &Args) {
        // Only override values explicitly given on the command line
        if args.trace.is_some() {
            self.trace = args.trace.clone();
        }
        if args.vcd.is_some() {
            self.vcd = args.vcd.clone();
        }
        if let Some(width) = args.width {
            self.width = width;
        }
        if let Some(height) = args.height {
            self.height = height;
        }
        if let Some(order) = args.order {
            self.order = order;
        }
        if let Some(output_dir) = &args.output_dir {
            self.output_dir = output_dir.clone();
        }
        if let Some(name) = &args.name {
            self.name = name.clone();
        }
        if args.raw_output.is_some() {
            self.raw_output = args.raw_output.clone();
        }
        if args.max_output_size.is_some() {
            self.max_output_size = args.max_output_size;
        }

        // Boolean flags can only switch behavior on
        if args.color {
            self.color = true;
        }
        if args.aex_notify {
            self.aex_notify = true;
        }
        if args.no_step {
            self.no_step = true;
        }
        if args.no_composite {
            self.render.composite = false;
        }
        if args.normalize {
            self.render.normalize = true;
        }
        if args.invert {
            self.render.invert = true;
        }
    }

    /// Validated geometry of the captured image
    pub fn geometry(&self) -> Result<Geometry, CaptureError> {
        Geometry::new(
            self.width,
            self.height,
            if self.color { 3 } else { 1 },
            self.order,
        )
    }

    /// The one recorded trace to replay
    pub fn input(&self) -> Result<TraceInput, CaptureError> {
        match (&self.trace, &self.vcd) {
            (Some(trace), None) => Ok(TraceInput::Events(trace.clone())),
            (None, Some(vcd)) => Ok(TraceInput::Pages(vcd.clone())),
            (Some(_), Some(_)) => Err(CaptureError::Config(String::from(
                "give either a leakage trace or a VCD page trace, not both",
            ))),
            (None, None) => Err(CaptureError::Config(String::from(
                "no input trace given, use --trace, --vcd or a config file",
            ))),
        }
    }

    /// Page layout used to interpret a VCD page trace
    pub fn page_map(&self) -> PageMap {
        match &self.pages {
            Some(pages) => pages.clone(),
            None if self.aex_notify => PageMap::aex_notify(),
            None => PageMap::default(),
        }
    }

    /// Output buffer reserved inside the decoder, three bytes per pixel plus slack
    /// unless configured explicitly
    pub fn max_output_size(&self) -> Result<usize, CaptureError> {
        if let Some(size) = self.max_output_size {
            return Ok(size);
        }
        pixel_bytes(self.width, self.height, 3)
            .and_then(|bytes| bytes.checked_add(OUTPUT_SLACK))
            .ok_or_else(|| {
                CaptureError::Config(format!(
                    "no output buffer fits a {}x{} image",
                    self.width, self.height
                ))
            })
    }
}

/// Recorded input the capture replays as its decoder
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceInput {
    /// Leakage signal trace, see [`crate::replay`]
    Events(PathBuf),
    /// VCD page access trace, see [`crate::page_trace`]
    Pages(PathBuf),
}

/// Command-line arguments structure for the capture tool.
///
/// Every value can also be given in a JSON5 configuration file; values given
/// on the command line take precedence.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Load configuration from JSON5 file
    #[arg(short = 'c', long)]
    pub config: Option<PathBuf>,

    /// Recorded leakage trace replayed as the decoder
    #[arg(short, long)]
    pub trace: Option<PathBuf>,

    /// Recorded VCD page access trace replayed as the decoder
    #[arg(short, long)]
    pub vcd: Option<PathBuf>,

    /// Page trace was recorded with AEX-Notify enabled
    #[arg(short, long, default_value_t = false)]
    pub aex_notify: bool,

    /// Image width in pixels
    #[arg(long)]
    pub width: Option<usize>,

    /// Image height in pixels
    #[arg(long)]
    pub height: Option<usize>,

    /// Image has three color channels instead of one
    #[arg(long, default_value_t = false)]
    pub color: bool,

    /// Order in which the decoder walks blocks across channels
    #[arg(long, value_enum)]
    pub order: Option<ChannelOrder>,

    /// Directory receiving the reconstructed rasters
    #[arg(short, long)]
    pub output_dir: Option<PathBuf>,

    /// Base name of the written files
    #[arg(short, long)]
    pub name: Option<String>,

    /// Also dump the raw block scores as JSON
    #[arg(short, long)]
    pub raw_output: Option<PathBuf>,

    /// Output buffer size reserved inside the decoder
    #[arg(long)]
    pub max_output_size: Option<usize>,

    /// Run the decoder without single-stepping
    #[arg(long, default_value_t = false)]
    pub no_step: bool,

    /// Do not write the interleaved color composite
    #[arg(long, default_value_t = false)]
    pub no_composite: bool,

    /// Stretch block scores to the full 0..255 range
    #[arg(long, default_value_t = false)]
    pub normalize: bool,

    /// Invert the written samples
    #[arg(long, default_value_t = false)]
    pub invert: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json5_values_overridden_by_cli() {
        let mut config = Config::from_json5(
            r#"{
                // capture of the grayscale test image
                width: 227,
                height: 149,
                order: "one-pass",
                name: "testimg",
                render: { invert: true },
            }"#,
        )
        .unwrap();
        assert_eq!(config.order, ChannelOrder::OnePass);
        assert!(config.render.composite);
        assert!(config.render.invert);
        assert_eq!(config.output_dir, PathBuf::from("."));

        let args = Args::parse_from(["step_capture", "--height", "150", "--color", "-n", "logo"]);
        config.override_with_args(&args);
        assert_eq!(config.width, 227);
        assert_eq!(config.height, 150);
        assert_eq!(config.name, "logo");
        assert_eq!(config.order, ChannelOrder::OnePass);
        assert_eq!(config.geometry().unwrap().channels, 3);
    }

    #[test]
    fn args_only_config() {
        let args = Args::parse_from([
            "step_capture",
            "--width",
            "16",
            "--height",
            "16",
            "--order",
            "row-sequential",
            "--no-composite",
        ]);
        let config = Config::from_args(&args);
        assert_eq!(config.order, ChannelOrder::RowSequential);
        assert!(!config.render.composite);
        assert_eq!(config.max_output_size().unwrap(), 16 * 16 * 3 + 100);
        assert_eq!(config.geometry().unwrap().total_blocks(), 4);
    }

    #[test]
    fn overflowing_buffer_size_rejected() {
        let args = Args::parse_from([
            "step_capture",
            "--width",
            "18446744073709551615",
            "--height",
            "2",
        ]);
        let config = Config::from_args(&args);
        assert!(matches!(config.max_output_size(), Err(CaptureError::Config(_))));
        assert!(matches!(config.geometry(), Err(CaptureError::Config(_))));

        let args = Args::parse_from([
            "step_capture",
            "--width",
            "18446744073709551615",
            "--height",
            "2",
            "--max-output-size",
            "4096",
        ]);
        assert_eq!(Config::from_args(&args).max_output_size().unwrap(), 4096);
    }

    #[test]
    fn exactly_one_input_trace() {
        let config = Config::from_args(&Args::parse_from(["step_capture", "-t", "img.trace"]));
        assert_eq!(
            config.input().unwrap(),
            TraceInput::Events(PathBuf::from("img.trace"))
        );
        assert_eq!(config.page_map(), PageMap::default());

        let config = Config::from_args(&Args::parse_from(["step_capture", "-v", "img.vcd", "-a"]));
        assert_eq!(config.input().unwrap(), TraceInput::Pages(PathBuf::from("img.vcd")));
        assert_eq!(config.page_map(), PageMap::aex_notify());

        let mut config = Config::from_json5(r#"{ trace: "img.trace" }"#).unwrap();
        config.override_with_args(&Args::parse_from(["step_capture", "--vcd", "img.vcd"]));
        assert!(matches!(config.input(), Err(CaptureError::Config(_))));

        let config = Config::from_args(&Args::parse_from(["step_capture"]));
        assert!(matches!(config.input(), Err(CaptureError::Config(_))));
    }

    #[test]
    fn page_layout_from_json5() {
        let config = Config::from_json5(
            r#"{
                vcd: "img.vcd",
                aex_notify: true,
                pages: { idct: { start: 70, end: 72 }, data: { start: 200, end: 300 } },
            }"#,
        )
        .unwrap();
        let map = config.page_map();
        assert_eq!(map.idct, 70..72);
        assert_eq!(map.data, 200..300);
        assert_eq!(map.start, PageMap::default().start);
    }

    #[test]
    fn missing_dimensions_rejected() {
        let config = Config::from_args(&Args::parse_from(["step_capture"]));
        assert!(matches!(config.geometry(), Err(CaptureError::Config(_))));
    }
}
