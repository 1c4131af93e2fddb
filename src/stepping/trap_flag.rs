//! Hardware single-stepping through the x86 trap flag (RFLAGS.TF).
//!
//! With TF set the CPU raises a debug exception after every instruction, which
//! Linux delivers to the thread as `SIGTRAP`. The handler counts the step and
//! keeps TF set in the interrupted context, so returning from the signal
//! resumes the thread for exactly one more instruction.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

// Signal handlers cannot carry state, only one trap flag window per process
static ARMED: AtomicBool = AtomicBool::new(false);
static STEPS: AtomicU64 = AtomicU64::new(0);

/// Trap flag stepping of the calling thread.
///
/// Must be disarmed on the thread that armed it, hence not `Send`.
pub struct TrapFlag {
    #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
    previous: Option<libc::sigaction>,
    _thread: PhantomData<*const ()>,
}

impl TrapFlag {
    pub fn new() -> Self {
        Self {
            #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
            previous: None,
            _thread: PhantomData,
        }
    }

    fn is_owner(&self) -> bool {
        #[cfg(all(target_os = "linux", target_arch = "x86_64"))]
        return self.previous.is_some();
        #[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
        return false;
    }
}

impl Default for TrapFlag {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TrapFlag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TrapFlag")
            .field("armed", &self.is_owner())
            .field("steps", &STEPS.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl super::TrapMechanism for TrapFlag {
    fn name(&self) -> &'static str {
        "trap flag"
    }

    fn arm(&mut self) -> std::io::Result<()> {
        if ARMED
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(std::io::Error::other(
                "trap flag stepping is already armed in this process",
            ));
        }
        let previous = match imp::install() {
            Ok(previous) => previous,
            Err(err) => {
                ARMED.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        self.previous = Some(previous);
        STEPS.store(0, Ordering::SeqCst);
        imp::set_trap_flag();
        Ok(())
    }

    fn disarm(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        // Traps still in flight clear TF instead of re-arming it
        ARMED.store(false, Ordering::SeqCst);
        imp::clear_trap_flag();
        imp::restore(&previous);
    }

    fn steps(&self) -> u64 {
        STEPS.load(Ordering::SeqCst)
    }
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
impl super::TrapMechanism for TrapFlag {
    fn name(&self) -> &'static str {
        "trap flag"
    }

    fn arm(&mut self) -> std::io::Result<()> {
        Err(std::io::Error::new(
            std::io::ErrorKind::Unsupported,
            "trap flag stepping requires x86_64 Linux",
        ))
    }

    fn disarm(&mut self) {}

    fn steps(&self) -> u64 {
        0
    }
}

impl Drop for TrapFlag {
    fn drop(&mut self) {
        if self.is_owner() {
            super::TrapMechanism::disarm(self);
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
mod imp {
    use super::{ARMED, STEPS};
    use std::sync::atomic::Ordering;
    use std::{io, mem, ptr};

    const TRAP_FLAG: libc::greg_t = 0x100;

    extern "C" fn trap_handler(
        _signum: libc::c_int,
        _info: *mut libc::siginfo_t,
        context: *mut libc::c_void,
    ) {
        let context = context as *mut libc::ucontext_t;
        // SAFETY: SA_SIGINFO handlers receive the interrupted thread's context
        let flags = unsafe { &mut (*context).uc_mcontext.gregs[libc::REG_EFL as usize] };
        if ARMED.load(Ordering::Relaxed) {
            STEPS.fetch_add(1, Ordering::Relaxed);
            *flags |= TRAP_FLAG;
        } else {
            *flags &= !TRAP_FLAG;
        }
    }

    /// Install the SIGTRAP handler, returning the previous action
    pub(super) fn install() -> io::Result<libc::sigaction> {
        unsafe {
            let mut action: libc::sigaction = mem::zeroed();
            action.sa_sigaction = trap_handler as *const () as libc::sighandler_t;
            action.sa_flags = libc::SA_SIGINFO | libc::SA_RESTART;
            libc::sigemptyset(&mut action.sa_mask);

            let mut previous: libc::sigaction = mem::zeroed();
            if libc::sigaction(libc::SIGTRAP, &action, &mut previous) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(previous)
        }
    }

    pub(super) fn restore(previous: &libc::sigaction) {
        unsafe {
            libc::sigaction(libc::SIGTRAP, previous, ptr::null_mut());
        }
    }

    pub(super) fn set_trap_flag() {
        unsafe { core::arch::asm!("pushfq", "or qword ptr [rsp], 0x100", "popfq") };
    }

    pub(super) fn clear_trap_flag() {
        unsafe { core::arch::asm!("pushfq", "and qword ptr [rsp], -257", "popfq") };
    }
}
