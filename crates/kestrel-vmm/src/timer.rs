//! Host-side periodic timer.
//!
//! A POSIX interval timer on `CLOCK_REALTIME` that raises `SIGALRM` on
//! the thread which started it, once per millisecond.  The guest-facing
//! consumer (periodic interrupt injection) installs the `SIGALRM`
//! handler; the signal value carries a pointer to the timer's target so
//! the handler can find its VM.  [`Vm::start_timer`](crate::vm::Vm::start_timer)
//! arms one targeting the VM's pause coordinator, and `Vm::exit` stops it
//! before guest memory is released.
//!
//! `SIGALRM` terminates the process by default, so a handler must be in
//! place (for example via [`vmm_sys_util::signal::register_signal_handler`])
//! before [`PeriodicTimer::start`] is called.

use std::io;
use std::mem;
use std::ptr;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error};
use thiserror::Error;

/// Tick period.
pub const TIMER_INTERVAL: Duration = Duration::from_nanos(1_000_000);

/// Signal raised on every tick.
pub const TIMER_SIGNAL: libc::c_int = libc::SIGALRM;

#[derive(Error, Debug)]
pub enum TimerError {
    #[error("timer_create failed: {0}")]
    Create(#[source] io::Error),

    #[error("timer_settime failed: {0}")]
    Arm(#[source] io::Error),
}

/// An armed periodic timer targeting `T`.
///
/// The timer keeps `target` alive until it is stopped or dropped.
pub struct PeriodicTimer<T> {
    timer_id: libc::timer_t,
    target: Arc<T>,
    armed: bool,
}

impl<T> PeriodicTimer<T> {
    /// Create and arm the timer on the calling thread.
    ///
    /// If arming fails the timer is deleted before returning.
    pub fn start(target: Arc<T>) -> Result<Self, TimerError> {
        // SAFETY: sigevent is a plain C struct; all-zero is a valid value.
        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_THREAD_ID;
        sev.sigev_signo = TIMER_SIGNAL;
        sev.sigev_value = libc::sigval {
            sival_ptr: Arc::as_ptr(&target) as *mut libc::c_void,
        };
        // SAFETY: gettid has no preconditions.
        sev.sigev_notify_thread_id = unsafe { libc::gettid() };

        let mut timer_id: libc::timer_t = ptr::null_mut();
        // SAFETY: both pointers refer to live locals.
        let r = unsafe { libc::timer_create(libc::CLOCK_REALTIME, &mut sev, &mut timer_id) };
        if r < 0 {
            return Err(TimerError::Create(io::Error::last_os_error()));
        }

        let period = libc::timespec {
            tv_sec: TIMER_INTERVAL.as_secs() as libc::time_t,
            tv_nsec: TIMER_INTERVAL.subsec_nanos() as libc::c_long,
        };
        let its = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };

        // SAFETY: `timer_id` was just created; `its` is a live local.
        let r = unsafe { libc::timer_settime(timer_id, 0, &its, ptr::null_mut()) };
        if r < 0 {
            let err = io::Error::last_os_error();
            // SAFETY: `timer_id` is valid and not yet deleted.
            unsafe { libc::timer_delete(timer_id) };
            return Err(TimerError::Arm(err));
        }

        debug!("Periodic timer armed ({:?})", TIMER_INTERVAL);
        Ok(Self {
            timer_id,
            target,
            armed: true,
        })
    }

    pub fn target(&self) -> &Arc<T> {
        &self.target
    }

    /// Disarm and delete the timer.
    ///
    /// Aborts the process if the kernel refuses to delete it.
    pub fn stop(mut self) {
        self.delete();
    }

    fn delete(&mut self) {
        if !self.armed {
            return;
        }
        // SAFETY: `timer_id` is valid while `armed` is set.
        if unsafe { libc::timer_delete(self.timer_id) } < 0 {
            error!("timer_delete(): {}", io::Error::last_os_error());
            std::process::abort();
        }
        self.armed = false;
        debug!("Periodic timer deleted");
    }
}

impl<T> Drop for PeriodicTimer<T> {
    fn drop(&mut self) {
        self.delete();
    }
}
