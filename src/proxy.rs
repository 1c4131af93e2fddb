//! # Trust-boundary proxy and leakage hooks
//!
//! The decode routine lives behind an isolation boundary and is only reachable
//! through three calls. While it runs, instrumented program locations inside
//! the routine call back into the observer through [`LeakageHooks`].

use std::fmt;

/// Output size the decoder reports when it refuses to decode, `(size_t)-1`.
pub const INVALID_SIZE: usize = usize::MAX;

/// Numeric status code returned by a call across the trust boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(pub u32);

impl Status {
    /// Unexpected error inside the isolated routine
    pub const UNEXPECTED: Status = Status(0x0001);
    /// The routine rejected its input parameters
    pub const INVALID_PARAMETER: Status = Status(0x0002);
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "0x{:04X}", self.0)
    }
}

/// Identifies which proxy call failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyCall {
    Load,
    Decompress,
    Free,
}

impl fmt::Display for ProxyCall {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ProxyCall::Load => "load",
            ProxyCall::Decompress => "decompress",
            ProxyCall::Free => "free",
        };
        f.write_str(name)
    }
}

/// Callbacks invoked by the instrumented decode routine.
///
/// Delivery is synchronous from inside the routine. Implementations must not
/// block, must not touch the routine's state and never report errors back to
/// the caller; problems are latched and surfaced after the decode returns.
pub trait LeakageHooks {
    /// The current block performed one degenerate unit of work
    fn on_activity(&mut self);
    /// The current block is complete
    fn on_block_boundary(&mut self);
}

/// Calls crossing into the isolated decode routine.
pub trait DecodeProxy {
    /// Copy the encoded image into the routine and reserve `max_output_size`
    /// bytes for its output
    fn load(&mut self, image: &[u8], max_output_size: usize) -> Result<(), Status>;

    /// Decode the loaded image, delivering leakage through `hooks`.
    ///
    /// Returns the decoded output size, or [`INVALID_SIZE`] if the routine
    /// refused to decode.
    fn decompress(&mut self, hooks: &mut dyn LeakageHooks) -> Result<usize, Status>;

    /// Release the buffers allocated by `load`
    fn free(&mut self) -> Result<(), Status>;
}
