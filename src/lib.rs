pub mod aggregator;
pub mod assembler;
pub mod capture;
pub mod config;
pub mod error;
pub mod geometry;
pub mod page_trace;
pub mod proxy;
pub mod replay;
pub mod stepping;

pub mod prelude {
    pub use crate::aggregator::{BlockTracker, Reconstruction, RunState};
    pub use crate::assembler::{RenderOptions, RenderReport};
    pub use crate::capture::{Capture, CaptureReport};
    pub use crate::error::CaptureError;
    pub use crate::geometry::{BlockGrid, ChannelOrder, Geometry};
    pub use crate::page_trace::{PageMap, PageReplay, PageState, PageTrace, PageWalker};
    pub use crate::proxy::{DecodeProxy, LeakageHooks, ProxyCall, Status, INVALID_SIZE};
    pub use crate::replay::{EventTrace, TraceReplay};
    pub use crate::stepping::{ControllerState, Passive, StepController, TrapFlag, TrapMechanism};
}
