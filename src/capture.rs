//! # Capture driver
//!
//! Runs one decode invocation under single-step control and collects the
//! leaked block scores.

use indicatif::ProgressBar;
use log::{debug, error, info};

use crate::aggregator::{BlockTracker, Reconstruction};
use crate::error::CaptureError;
use crate::geometry::Geometry;
use crate::proxy::{DecodeProxy, ProxyCall, Status, INVALID_SIZE};
use crate::stepping::{StepController, TrapMechanism};

/// Result of a successful capture run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureReport {
    pub reconstruction: Reconstruction,
    /// Output size reported by the decoder
    pub output_size: usize,
    /// Steps observed while the decoder ran
    pub steps: u64,
}

/// Owns the decode proxy and the step controller for a series of runs.
#[derive(Debug)]
pub struct Capture<P: DecodeProxy, T: TrapMechanism> {
    proxy: P,
    controller: StepController<T>,
    geometry: Geometry,
    progress: Option<ProgressBar>,
}

impl<P: DecodeProxy, T: TrapMechanism> Capture<P, T> {
    /// Creates a new `Capture` instance.
    ///
    /// # Arguments
    ///
    /// * `proxy` - Calls into the isolated decode routine.
    /// * `mechanism` - Trap mechanism used to single-step the decode.
    /// * `geometry` - Dimensions and channel order of the image under decode.
    pub fn new(proxy: P, mechanism: T, geometry: Geometry) -> Self {
        Self {
            proxy,
            controller: StepController::new(mechanism),
            geometry,
            progress: None,
        }
    }

    /// Report every captured block on `bar`
    pub fn set_progress(&mut self, bar: ProgressBar) {
        self.progress = Some(bar);
    }

    pub fn proxy(&self) -> &P {
        &self.proxy
    }

    pub fn controller(&self) -> &StepController<T> {
        &self.controller
    }

    pub fn geometry(&self) -> &Geometry {
        &self.geometry
    }

    /// Load `image`, decode it single-stepped and collect the block scores.
    ///
    /// # Arguments
    ///
    /// * `image` - Encoded image handed to the decode routine.
    /// * `max_output_size` - Output buffer size reserved inside the routine.
    ///
    /// # Returns
    ///
    /// * `Ok(CaptureReport)` - Decode finished and the bookkeeping is consistent.
    /// * `Err(CaptureError)` - Setup, proxy or consistency failure. Stepping
    ///   is disarmed in every case.
    pub fn run(
        &mut self,
        image: &[u8],
        max_output_size: usize,
    ) -> Result<CaptureReport, CaptureError> {
        info!(
            "Capturing {}x{} image with {} channel(s), {:?} order",
            self.geometry.width, self.geometry.height, self.geometry.channels, self.geometry.order
        );

        self.proxy
            .load(image, max_output_size)
            .map_err(|status| proxy_error(ProxyCall::Load, status))?;
        debug!("Loaded {} bytes into the decoder", image.len());

        let mut tracker = BlockTracker::new(self.geometry);
        if let Some(bar) = &self.progress {
            tracker = tracker.with_progress(bar.clone());
        }
        let decoded = match self.controller.step_scope() {
            Ok(_guard) => self.proxy.decompress(&mut tracker),
            Err(err) => {
                release(&mut self.proxy);
                return Err(err);
            }
        };
        let steps = self.controller.steps();
        debug!("Decompress returned after {steps} steps");

        let output_size = match decoded {
            Ok(INVALID_SIZE) => Err(Status::UNEXPECTED),
            other => other,
        };
        let output_size = match output_size {
            Ok(size) => size,
            Err(status) => {
                release(&mut self.proxy);
                return Err(proxy_error(ProxyCall::Decompress, status));
            }
        };

        self.proxy
            .free()
            .map_err(|status| proxy_error(ProxyCall::Free, status))?;

        let reconstruction = tracker.finish()?;
        info!(
            "Captured {} blocks per channel, min: {}, median: {}, max: {}",
            reconstruction.grid.block_count(),
            reconstruction.min_score(),
            reconstruction.median_score(),
            reconstruction.max_score
        );

        Ok(CaptureReport {
            reconstruction,
            output_size,
            steps,
        })
    }
}

/// Free the decoder's buffers on an aborted run, the abort reason is kept
fn release<P: DecodeProxy>(proxy: &mut P) {
    if let Err(status) = proxy.free() {
        error!("Decode proxy free failed with status {status} during abort");
    }
}

fn proxy_error(call: ProxyCall, status: Status) -> CaptureError {
    let err = CaptureError::Proxy { call, status };
    error!("{err}");
    err
}
