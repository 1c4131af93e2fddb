use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};

use step_capture::assembler;
use step_capture::config::{Args, Config, TraceInput};
use step_capture::prelude::*;

use git_version::git_version;
const GIT_VERSION: &str = git_version!(fallback = "unknown");

/// Run `proxy` under the configured trap mechanism
fn capture<P: DecodeProxy>(
    proxy: P,
    config: &Config,
    geometry: Geometry,
    image: &[u8],
    progress: &ProgressBar,
) -> Result<CaptureReport, CaptureError> {
    let max_output_size = config.max_output_size()?;
    if config.no_step {
        let mut capture = Capture::new(proxy, Passive, geometry);
        capture.set_progress(progress.clone());
        capture.run(image, max_output_size)
    } else {
        let mut capture = Capture::new(proxy, TrapFlag::new(), geometry);
        capture.set_progress(progress.clone());
        capture.run(image, max_output_size)
    }
}

/// Replay a recorded leakage or page access trace and reconstruct the block
/// complexity image
///
fn main() -> Result<(), String> {
    // Get parameter from command line
    let args = Args::parse();
    env_logger::init(); // Switch on with: RUST_LOG=debug cargo run

    println!("--- Step capture: {GIT_VERSION} ---\n");

    // Config file first, command line values on top
    let config = match &args.config {
        Some(path) => {
            let mut config = Config::from_file(path)?;
            config.override_with_args(&args);
            config
        }
        None => Config::from_args(&args),
    };

    let geometry = config.geometry().map_err(|e| e.to_string())?;
    let input = config.input().map_err(|e| e.to_string())?;
    let path = match &input {
        TraceInput::Events(path) | TraceInput::Pages(path) => path,
    };
    let image = std::fs::read(path)
        .map_err(|e| format!("Failed to read trace {}: {}", path.display(), e))?;
    println!("Provided trace: {}", path.display());
    println!(
        "Image {}x{}, {} channel(s), {} blocks per channel\n",
        geometry.width,
        geometry.height,
        geometry.channels,
        geometry.grid().block_count()
    );

    // Initialize the progress bar
    let progress = ProgressBar::new(geometry.total_blocks() as u64);
    progress.set_style(
        ProgressStyle::with_template(
            "[{elapsed_precise}] {wide_bar} {pos:>7}/{len:7} ETA: [{eta_precise}] ",
        )
        .map_err(|e| e.to_string())?
        .progress_chars("##-"),
    );

    // Run the decoder with or without stepping
    let report = match input {
        TraceInput::Events(_) => capture(
            TraceReplay::new(geometry),
            &config,
            geometry,
            &image,
            &progress,
        ),
        TraceInput::Pages(_) => capture(
            PageReplay::new(geometry, config.page_map()),
            &config,
            geometry,
            &image,
            &progress,
        ),
    };
    progress.finish();
    let report = match report {
        Ok(report) => report,
        Err(err) => {
            println!("Capture: {}", "failed".red());
            return Err(err.to_string());
        }
    };
    let reconstruction = &report.reconstruction;
    println!("Capture: {} ({} steps)", "ok".green(), report.steps);
    println!(
        "min: {}, median: {}, max: {}",
        reconstruction.min_score(),
        reconstruction.median_score(),
        reconstruction.max_score
    );

    // Write rasters
    std::fs::create_dir_all(&config.output_dir).map_err(|e| {
        format!(
            "Failed to create output directory {}: {}",
            config.output_dir.display(),
            e
        )
    })?;
    let rendered = assembler::render(
        reconstruction,
        &config.output_dir,
        &config.name,
        config.render,
    )
    .map_err(|e| e.to_string())?;
    for path in &rendered.written {
        println!("  {} {}", "wrote".green(), path.display());
    }
    for err in &rendered.failed {
        println!("  {} {}", "failed".red(), err);
    }

    if let Some(path) = &config.raw_output {
        assembler::write_raw_dump(reconstruction, path).map_err(|e| e.to_string())?;
        println!("  {} {}", "wrote".green(), path.display());
    }

    if !rendered.is_complete() {
        return Err(format!("{} raster(s) not written", rendered.failed.len()));
    }
    Ok(())
}
