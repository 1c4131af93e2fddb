//! # Single-step execution control
//!
//! The controller forces the observed routine to pause after every elementary
//! step. The actual trap delivery is platform specific and abstracted by
//! [`TrapMechanism`]; the controller owns the IDLE/STEPPING state machine on
//! top of it and hands out a [`StepGuard`] which releases stepping on every exit
//! path of the stepped section.

mod trap_flag;

pub use trap_flag::TrapFlag;

use log::{debug, info, warn};

use crate::error::CaptureError;

/// Platform mechanism delivering one trap per executed step.
pub trait TrapMechanism {
    /// Short name used in diagnostics
    fn name(&self) -> &'static str;

    /// Install the trap handler and start trapping the calling thread.
    ///
    /// On error nothing is left armed.
    fn arm(&mut self) -> std::io::Result<()>;

    /// Stop trapping and restore unconstrained execution
    fn disarm(&mut self);

    /// Number of traps delivered since the last `arm`
    fn steps(&self) -> u64;
}

/// Runs the code without trapping.
///
/// Leakage hooks are still delivered, only the step count stays zero.
#[derive(Debug, Default, Clone, Copy)]
pub struct Passive;

impl TrapMechanism for Passive {
    fn name(&self) -> &'static str {
        "passive"
    }

    fn arm(&mut self) -> std::io::Result<()> {
        Ok(())
    }

    fn disarm(&mut self) {}

    fn steps(&self) -> u64 {
        0
    }
}

#[derive(PartialEq, Debug, Clone, Copy, Default)]
pub enum ControllerState {
    #[default]
    Idle,
    Stepping,
}

/// IDLE/STEPPING state machine around a trap mechanism.
#[derive(Debug)]
pub struct StepController<T: TrapMechanism> {
    mechanism: T,
    state: ControllerState,
    last_steps: u64,
}

impl<T: TrapMechanism> StepController<T> {
    pub fn new(mechanism: T) -> Self {
        Self {
            mechanism,
            state: ControllerState::Idle,
            last_steps: 0,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn mechanism(&self) -> &T {
        &self.mechanism
    }

    /// Steps observed in the current (or last finished) stepping window
    pub fn steps(&self) -> u64 {
        match self.state {
            ControllerState::Stepping => self.mechanism.steps(),
            ControllerState::Idle => self.last_steps,
        }
    }

    /// Arm single-stepping.
    ///
    /// Calling `start` while already stepping is a no-op.
    ///
    /// # Returns
    ///
    /// * `Ok(())` - The controller is STEPPING.
    /// * `Err(CaptureError::Setup)` - The mechanism refused to arm, the
    ///   controller stays IDLE.
    pub fn start(&mut self) -> Result<(), CaptureError> {
        if self.state == ControllerState::Stepping {
            warn!("Single-stepping already armed, ignoring start");
            return Ok(());
        }
        self.mechanism
            .arm()
            .map_err(|source| CaptureError::Setup {
                mechanism: self.mechanism.name(),
                source,
            })?;
        self.state = ControllerState::Stepping;
        debug!("Armed {} single-stepping", self.mechanism.name());
        Ok(())
    }

    /// Disarm single-stepping. Stopping an idle controller does nothing.
    pub fn stop(&mut self) {
        if self.state == ControllerState::Idle {
            return;
        }
        self.mechanism.disarm();
        self.last_steps = self.mechanism.steps();
        self.state = ControllerState::Idle;
        info!("Single-stepping stopped after {} steps", self.last_steps);
    }

    /// Arm stepping for the lifetime of the returned guard
    pub fn step_scope(&mut self) -> Result<StepGuard<'_, T>, CaptureError> {
        self.start()?;
        Ok(StepGuard { controller: self })
    }
}

impl<T: TrapMechanism> Drop for StepController<T> {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Keeps single-stepping armed until dropped, also during unwinding.
pub struct StepGuard<'a, T: TrapMechanism> {
    controller: &'a mut StepController<T>,
}

impl<T: TrapMechanism> StepGuard<'_, T> {
    /// Steps observed so far in this window
    pub fn steps(&self) -> u64 {
        self.controller.steps()
    }
}

impl<T: TrapMechanism> Drop for StepGuard<'_, T> {
    fn drop(&mut self) {
        self.controller.stop();
    }
}
