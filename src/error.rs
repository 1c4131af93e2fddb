use std::path::PathBuf;

use thiserror::Error;

use crate::proxy::{ProxyCall, Status};

/// Errors surfaced by a capture run.
///
/// Setup and proxy errors abort the run before anything is rendered.
/// Consistency errors point at a bookkeeping defect and carry the offending
/// channel and block indices. Io errors are reported per output file.
#[derive(Debug, Error)]
pub enum CaptureError {
    /// The trap mechanism refused to arm single-stepping
    #[error("failed to arm {mechanism} single-stepping: {source}")]
    Setup {
        mechanism: &'static str,
        #[source]
        source: std::io::Error,
    },

    /// A call across the trust boundary reported failure
    #[error("decode proxy call `{call}` failed with status {status}")]
    Proxy { call: ProxyCall, status: Status },

    /// Channel/block bookkeeping does not match the expected geometry
    #[error("{component} consistency error at channel {channel}, block {block}: {detail}")]
    Consistency {
        component: &'static str,
        channel: usize,
        block: usize,
        detail: String,
    },

    /// An output raster could not be written
    #[error("failed to write {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Invalid geometry or configuration values
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl CaptureError {
    pub(crate) fn consistency(
        component: &'static str,
        channel: usize,
        block: usize,
        detail: impl Into<String>,
    ) -> Self {
        CaptureError::Consistency {
            component,
            channel,
            block,
            detail: detail.into(),
        }
    }
}
