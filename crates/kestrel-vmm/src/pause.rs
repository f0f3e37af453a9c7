//! Pausing and resuming all vCPU threads.
//!
//! The monitor calls [`PauseCoordinator::pause`] when it needs every vCPU
//! quiescent (to inspect or modify guest state) and
//! [`PauseCoordinator::resume`] when it is done.  vCPU threads take part
//! cooperatively: each one polls [`PauseCoordinator::pause_requested`]
//! in its run loop and calls [`PauseCoordinator::acknowledge`] with its
//! index at a safe point, where it blocks until the cycle is resumed.
//! Only vCPUs kicked by the current cycle count towards it; any other
//! caller returns at once.  A thread sitting
//! in `KVM_RUN` is kicked out with `SIGRTMIN` (see [`VcpuThread`]).
//!
//! ```text
//!   Running ──pause()──▶ PauseRequested ──all acked──▶ Paused
//!      ▲                        │                         │
//!      └──────── timeout ───────┘◀──────── resume() ──────┘
//! ```
//!
//! At most one cycle is in flight per coordinator; a second `pause`
//! waits until the first is resumed.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use kestrel_vmm::pause::{PauseCoordinator, VcpuHandle, VcpuThread};
//!
//! let coordinator = Arc::new(PauseCoordinator::new());
//! let c = Arc::clone(&coordinator);
//! std::thread::spawn(move || {
//!     let handle = VcpuHandle::new(0, Arc::new(VcpuThread::current().unwrap()));
//!     c.register(&handle);
//!     loop {
//!         if c.pause_requested() {
//!             c.acknowledge(0);
//!         }
//!         // ... KVM_RUN ...
//!     }
//! });
//!
//! coordinator.pause();
//! // all vCPUs are parked here
//! coordinator.resume();
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError, Weak};
use std::time::{Duration, Instant};

use log::{debug, info};
use thiserror::Error;
use vmm_sys_util::errno;
use vmm_sys_util::signal::{register_signal_handler, SIGRTMIN};

#[derive(Error, Debug)]
pub enum PauseError {
    /// Not every kicked vCPU acknowledged before the deadline.  The
    /// cycle has been rolled back.
    #[error("Pause timed out: {acked} of {expected} vCPUs acknowledged")]
    Timeout { acked: usize, expected: usize },

    #[error("Failed to install vCPU kick handler: {0}")]
    KickHandler(#[source] errno::Error),
}

// ═══════════════════════════════════════════════════════════════════════
//  vCPU handles
// ═══════════════════════════════════════════════════════════════════════

/// Forces a vCPU thread out of guest mode so it reaches its safe point.
pub trait VcpuKick: Send + Sync {
    fn kick(&self);
}

/// A running vCPU as seen by the coordinator.
///
/// The spawn site owns the handle; the coordinator keeps only a weak
/// reference to `thread`, so dropping the handle unregisters the vCPU.
pub struct VcpuHandle {
    pub index: usize,
    pub thread: Arc<dyn VcpuKick>,
}

impl VcpuHandle {
    pub fn new(index: usize, thread: Arc<dyn VcpuKick>) -> Self {
        Self { index, thread }
    }
}

/// Kicks an OS thread with `SIGRTMIN`.
///
/// The signal interrupts a blocking `KVM_RUN` with `EINTR`; the handler
/// itself does nothing.
pub struct VcpuThread {
    pthread: libc::pthread_t,
}

impl VcpuThread {
    /// Handle for the calling thread.  Installs the process-wide no-op
    /// `SIGRTMIN` handler on first use.
    pub fn current() -> Result<Self, PauseError> {
        install_kick_handler()?;
        Ok(Self {
            // SAFETY: pthread_self has no preconditions.
            pthread: unsafe { libc::pthread_self() },
        })
    }
}

impl VcpuKick for VcpuThread {
    fn kick(&self) {
        // SAFETY: the thread is alive while its handle is registered, and
        // the handler installed in `current` makes the signal harmless.
        let r = unsafe { libc::pthread_kill(self.pthread, SIGRTMIN()) };
        if r != 0 {
            debug!("pthread_kill failed: {}", std::io::Error::from_raw_os_error(r));
        }
    }
}

extern "C" fn handle_kick(_: libc::c_int, _: *mut libc::siginfo_t, _: *mut libc::c_void) {}

fn install_kick_handler() -> Result<(), PauseError> {
    static INSTALLED: OnceLock<Result<(), errno::Error>> = OnceLock::new();
    INSTALLED
        .get_or_init(|| register_signal_handler(SIGRTMIN(), handle_kick))
        .clone()
        .map_err(PauseError::KickHandler)
}

// ═══════════════════════════════════════════════════════════════════════
//  Coordinator
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PausePhase {
    Running,
    PauseRequested,
    Paused,
}

#[derive(Debug)]
struct PauseState {
    phase: PausePhase,
    /// Indices kicked by the current cycle that have not acknowledged.
    pending: Vec<usize>,
    acked: usize,
    expected: usize,
    generation: u64,
}

/// Per-VM pause/resume rendezvous.
pub struct PauseCoordinator {
    state: Mutex<PauseState>,
    cond: Condvar,
    requested: AtomicBool,
    vcpus: Mutex<Vec<(usize, Weak<dyn VcpuKick>)>>,
}

impl Default for PauseCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PauseState {
                phase: PausePhase::Running,
                pending: Vec::new(),
                acked: 0,
                expected: 0,
                generation: 0,
            }),
            cond: Condvar::new(),
            requested: AtomicBool::new(false),
            vcpus: Mutex::new(Vec::new()),
        }
    }

    /// Track `handle` for kicking.  Re-registering an index replaces it.
    pub fn register(&self, handle: &VcpuHandle) {
        let mut vcpus = lock(&self.vcpus);
        vcpus.retain(|(index, _)| *index != handle.index);
        vcpus.push((handle.index, Arc::downgrade(&handle.thread)));
        debug!("vCPU {} registered for pause", handle.index);
    }

    /// Cheap check for the vCPU run loop.
    #[inline]
    pub fn pause_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> PausePhase {
        lock(&self.state).phase
    }

    /// Live vCPU threads, or `None` while vCPU 0 has not started (or has
    /// gone away).
    fn live_vcpus(&self) -> Option<Vec<(usize, Arc<dyn VcpuKick>)>> {
        let vcpus = lock(&self.vcpus);
        let boot_alive = vcpus
            .iter()
            .any(|(index, thread)| *index == 0 && thread.strong_count() > 0);
        if !boot_alive {
            return None;
        }
        Some(
            vcpus
                .iter()
                .filter_map(|(index, t)| t.upgrade().map(|t| (*index, t)))
                .collect(),
        )
    }

    /// Stop every vCPU at its safe point.
    ///
    /// Returns once all live vCPUs have acknowledged.  A no-op if vCPU 0
    /// is not running.  Blocks without bound.
    pub fn pause(&self) {
        // Without a deadline the wait cannot time out.
        let _ = self.pause_until(None);
    }

    /// Like [`pause`](Self::pause), but gives up after `timeout`, rolling
    /// the cycle back and releasing any vCPU that already acknowledged.
    pub fn pause_timeout(&self, timeout: Duration) -> Result<(), PauseError> {
        self.pause_until(Some(Instant::now() + timeout))
    }

    fn pause_until(&self, deadline: Option<Instant>) -> Result<(), PauseError> {
        let Some(live) = self.live_vcpus() else {
            debug!("pause: vCPU 0 not running, nothing to do");
            return Ok(());
        };

        let mut state = lock(&self.state);

        // One cycle at a time.
        while state.phase != PausePhase::Running {
            let (guard, timed_out) = self.wait(state, deadline);
            state = guard;
            if timed_out && state.phase != PausePhase::Running {
                return Err(PauseError::Timeout {
                    acked: 0,
                    expected: live.len(),
                });
            }
        }

        state.phase = PausePhase::PauseRequested;
        state.pending = live.iter().map(|(index, _)| *index).collect();
        state.acked = 0;
        state.expected = live.len();
        state.generation += 1;
        self.requested.store(true, Ordering::Release);

        for (_, vcpu) in &live {
            vcpu.kick();
        }

        while state.acked < state.expected {
            let (guard, timed_out) = self.wait(state, deadline);
            state = guard;
            if timed_out && state.acked < state.expected {
                let err = PauseError::Timeout {
                    acked: state.acked,
                    expected: state.expected,
                };
                state.phase = PausePhase::Running;
                state.pending.clear();
                self.requested.store(false, Ordering::Release);
                self.cond.notify_all();
                return Err(err);
            }
        }

        state.phase = PausePhase::Paused;
        info!("Paused {} vCPU(s)", state.expected);
        Ok(())
    }

    /// Called by vCPU `index` at its safe point after seeing
    /// [`pause_requested`](Self::pause_requested).  Blocks until the
    /// current cycle is resumed or rolled back.
    ///
    /// Returns immediately if `index` was not kicked by the current cycle
    /// or has already acknowledged it.
    pub fn acknowledge(&self, index: usize) {
        let mut state = lock(&self.state);
        if state.phase != PausePhase::PauseRequested {
            return;
        }
        let Some(pos) = state.pending.iter().position(|&i| i == index) else {
            debug!("vCPU {} is not part of the current pause", index);
            return;
        };

        let generation = state.generation;
        state.pending.swap_remove(pos);
        state.acked += 1;
        self.cond.notify_all();

        while state.generation == generation && state.phase != PausePhase::Running {
            state = self
                .cond
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Let every paused vCPU continue.  A no-op if vCPU 0 is not running
    /// or no pause is in effect.
    pub fn resume(&self) {
        if self.live_vcpus().is_none() {
            debug!("resume: vCPU 0 not running, nothing to do");
            return;
        }

        let mut state = lock(&self.state);
        if state.phase != PausePhase::Paused {
            return;
        }
        state.phase = PausePhase::Running;
        self.requested.store(false, Ordering::Release);
        self.cond.notify_all();
        info!("Resumed vCPUs");
    }

    /// Wait on the condvar, honoring `deadline`.  Returns whether the
    /// deadline has passed.
    fn wait<'a>(
        &self,
        state: MutexGuard<'a, PauseState>,
        deadline: Option<Instant>,
    ) -> (MutexGuard<'a, PauseState>, bool) {
        match deadline {
            None => (
                self.cond
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                false,
            ),
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                let (guard, result) = self
                    .cond
                    .wait_timeout(state, remaining)
                    .unwrap_or_else(PoisonError::into_inner);
                (guard, result.timed_out() || Instant::now() >= deadline)
            }
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;

    #[derive(Default)]
    struct CountingKick(AtomicUsize);

    impl VcpuKick for CountingKick {
        fn kick(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        coordinator: Arc<PauseCoordinator>,
        stop: Arc<AtomicBool>,
        progress: Vec<Arc<AtomicUsize>>,
        kicks: Vec<Arc<CountingKick>>,
        threads: Vec<thread::JoinHandle<()>>,
    }

    impl Harness {
        fn start(n: usize) -> Self {
            let coordinator = Arc::new(PauseCoordinator::new());
            let stop = Arc::new(AtomicBool::new(false));
            let mut progress = Vec::new();
            let mut kicks = Vec::new();
            let mut threads = Vec::new();
            let (ready_tx, ready_rx) = mpsc::channel();

            for index in 0..n {
                let kick = Arc::new(CountingKick::default());
                let counter = Arc::new(AtomicUsize::new(0));
                let c = Arc::clone(&coordinator);
                let s = Arc::clone(&stop);
                let k = Arc::clone(&kick);
                let p = Arc::clone(&counter);
                let ready = ready_tx.clone();
                threads.push(thread::spawn(move || {
                    let handle = VcpuHandle::new(index, k);
                    c.register(&handle);
                    ready.send(()).unwrap();
                    while !s.load(Ordering::SeqCst) {
                        if c.pause_requested() {
                            c.acknowledge(index);
                        }
                        p.fetch_add(1, Ordering::SeqCst);
                        thread::sleep(Duration::from_micros(200));
                    }
                }));
                progress.push(counter);
                kicks.push(kick);
            }
            for _ in 0..n {
                ready_rx.recv().unwrap();
            }

            Self {
                coordinator,
                stop,
                progress,
                kicks,
                threads,
            }
        }

        fn snapshot(&self) -> Vec<usize> {
            self.progress.iter().map(|p| p.load(Ordering::SeqCst)).collect()
        }

        fn finish(self) {
            self.stop.store(true, Ordering::SeqCst);
            self.coordinator.resume();
            for t in self.threads {
                t.join().unwrap();
            }
        }
    }

    #[test]
    fn pause_freezes_all_vcpus_until_resume() {
        let h = Harness::start(4);

        h.coordinator.pause();
        assert_eq!(h.coordinator.phase(), PausePhase::Paused);
        let frozen = h.snapshot();
        thread::sleep(Duration::from_millis(20));
        assert_eq!(h.snapshot(), frozen, "a vCPU ran past its acknowledgement");
        for kick in &h.kicks {
            assert_eq!(kick.0.load(Ordering::SeqCst), 1);
        }

        h.coordinator.resume();
        assert!(!h.coordinator.pause_requested());
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.snapshot().iter().zip(&frozen).any(|(now, then)| now <= then)
            && Instant::now() < deadline
        {
            thread::sleep(Duration::from_millis(1));
        }
        assert!(h.snapshot().iter().zip(&frozen).all(|(now, then)| now > then));

        h.finish();
    }

    #[test]
    fn repeated_cycles() {
        let h = Harness::start(3);
        for _ in 0..5 {
            h.coordinator.pause();
            h.coordinator.resume();
        }
        for kick in &h.kicks {
            assert_eq!(kick.0.load(Ordering::SeqCst), 5);
        }
        h.finish();
    }

    #[test]
    fn pause_without_boot_vcpu_is_noop() {
        let coordinator = PauseCoordinator::new();
        let kick = Arc::new(CountingKick::default());
        let handle = VcpuHandle::new(1, kick.clone());
        coordinator.register(&handle);

        coordinator.pause();
        assert_eq!(coordinator.phase(), PausePhase::Running);
        assert_eq!(kick.0.load(Ordering::SeqCst), 0);
        coordinator.resume();
        assert_eq!(coordinator.phase(), PausePhase::Running);
    }

    #[test]
    fn dropped_boot_vcpu_disables_pause() {
        let coordinator = PauseCoordinator::new();
        let handle = VcpuHandle::new(0, Arc::new(CountingKick::default()));
        coordinator.register(&handle);
        drop(handle);

        assert!(coordinator.pause_timeout(Duration::from_millis(10)).is_ok());
        assert_eq!(coordinator.phase(), PausePhase::Running);
    }

    #[test]
    fn timeout_rolls_back() {
        let coordinator = PauseCoordinator::new();
        let kick = Arc::new(CountingKick::default());
        let handle = VcpuHandle::new(0, kick.clone());
        coordinator.register(&handle);

        // Nobody acknowledges.
        let err = coordinator
            .pause_timeout(Duration::from_millis(20))
            .unwrap_err();
        assert!(matches!(err, PauseError::Timeout { acked: 0, expected: 1 }));
        assert_eq!(kick.0.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.phase(), PausePhase::Running);
        assert!(!coordinator.pause_requested());

        // A late acknowledgement does not block.
        coordinator.acknowledge(0);
    }

    #[test]
    fn unkicked_vcpu_cannot_complete_pause() {
        let coordinator = Arc::new(PauseCoordinator::new());
        // vCPU 0 is kicked but never reaches its safe point.
        let boot = VcpuHandle::new(0, Arc::new(CountingKick::default()));
        coordinator.register(&boot);

        let c = Arc::clone(&coordinator);
        let monitor = thread::spawn(move || c.pause_timeout(Duration::from_millis(300)));

        let deadline = Instant::now() + Duration::from_secs(5);
        while coordinator.phase() != PausePhase::PauseRequested && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(coordinator.phase(), PausePhase::PauseRequested);

        // A vCPU that joined after the kick sees the request.  Its
        // acknowledgement, and one from an unknown index, return at once
        // without counting.
        let late = VcpuHandle::new(1, Arc::new(CountingKick::default()));
        coordinator.register(&late);
        assert!(coordinator.pause_requested());
        coordinator.acknowledge(1);
        coordinator.acknowledge(7);

        let result = monitor.join().unwrap();
        assert!(matches!(
            result,
            Err(PauseError::Timeout { acked: 0, expected: 1 })
        ));
        assert_eq!(coordinator.phase(), PausePhase::Running);
    }

    #[test]
    fn second_pause_waits_for_resume() {
        let h = Harness::start(2);
        h.coordinator.pause();

        let c = Arc::clone(&h.coordinator);
        let blocked = thread::spawn(move || c.pause_timeout(Duration::from_millis(30)));
        assert!(matches!(
            blocked.join().unwrap(),
            Err(PauseError::Timeout { .. })
        ));
        assert_eq!(h.coordinator.phase(), PausePhase::Paused);

        let c = Arc::clone(&h.coordinator);
        let waiter = thread::spawn(move || {
            c.pause();
            c.resume();
        });
        thread::sleep(Duration::from_millis(10));
        h.coordinator.resume();
        waiter.join().unwrap();

        h.finish();
    }

    #[test]
    fn signal_kick_does_not_kill_thread() {
        let (tx, rx) = mpsc::channel();
        let done = Arc::new(AtomicBool::new(false));
        let d = Arc::clone(&done);
        let t = thread::spawn(move || {
            tx.send(VcpuThread::current().unwrap()).unwrap();
            while !d.load(Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(1));
            }
        });

        let vcpu = rx.recv().unwrap();
        for _ in 0..3 {
            vcpu.kick();
            thread::sleep(Duration::from_millis(2));
        }
        done.store(true, Ordering::SeqCst);
        t.join().unwrap();
    }
}
