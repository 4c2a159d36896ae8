//! Deadline interlock between the controller and the execution thread.
//!
//! Exactly one side ends a run: the worker moves the guard to `Finished`
//! when the snippet returns, the controller moves it to `Cancelled` when the
//! deadline fires. Whoever wins the compare-and-swap owns the capture
//! hand-off. Inside the VM an instruction hook checks the guard and raises
//! [`Interrupted`] once the run is no longer `Running`.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use mlua::{HookTriggers, Lua};

use super::error::Interrupted;
use super::watchdog::MemoryWatchdog;

const RUNNING: u8 = 0;
const FINISHED: u8 = 1;
const CANCELLED: u8 = 2;

/// Granularity of interruptible sleeps.
const SLEEP_SLICE: Duration = Duration::from_millis(10);

#[derive(Clone)]
pub struct RunGuard {
    state: Arc<AtomicU8>,
    watchdog: Arc<MemoryWatchdog>,
}

impl RunGuard {
    pub fn new(watchdog: Arc<MemoryWatchdog>) -> Self {
        Self {
            state: Arc::new(AtomicU8::new(RUNNING)),
            watchdog,
        }
    }

    fn transition(&self, to: u8) -> bool {
        self.state
            .compare_exchange(RUNNING, to, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// Worker side. Returns `false` if the controller already cancelled.
    pub fn finish(&self) -> bool {
        self.transition(FINISHED)
    }

    /// Controller side. Returns `false` if the worker already finished.
    pub fn cancel(&self) -> bool {
        self.transition(CANCELLED)
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.load(Ordering::SeqCst) == CANCELLED
    }

    /// True once the snippet must stop executing.
    pub fn should_stop(&self) -> bool {
        self.state.load(Ordering::SeqCst) != RUNNING || self.watchdog.is_shutdown()
    }

    pub fn checkpoint(&self) -> mlua::Result<()> {
        if self.should_stop() {
            Err(Interrupted.into())
        } else {
            Ok(())
        }
    }

    /// Blocks the execution thread while still honouring cancellation.
    /// A duration past the clock's range sleeps until the run is stopped.
    pub fn sleep(&self, duration: Duration) -> mlua::Result<()> {
        let until = Instant::now().checked_add(duration);
        loop {
            self.checkpoint()?;
            let slice = match until {
                Some(until) => {
                    let now = Instant::now();
                    if now >= until {
                        return Ok(());
                    }
                    SLEEP_SLICE.min(until - now)
                }
                None => SLEEP_SLICE,
            };
            thread::sleep(slice);
        }
    }
}

/// Installs the preemption hook on `lua`.
///
/// The hook keeps firing after the run has ended, which also stops
/// finalizers the snippet left behind from spinning while the VM drops.
pub fn install_hook(lua: &Lua, guard: RunGuard, quantum: u32) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(quantum.max(1)),
        move |_lua, _debug| guard.checkpoint(),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::error::{classify, Classified};
    use crate::sandbox::watchdog::testing::{idle_watchdog, sandbox_only_settings, FakeSampler};

    #[test]
    fn test_only_one_transition_wins() {
        let guard = RunGuard::new(idle_watchdog());
        assert!(guard.cancel());
        assert!(!guard.finish());
        assert!(!guard.cancel());
        assert!(guard.is_cancelled());

        let guard = RunGuard::new(idle_watchdog());
        assert!(guard.finish());
        assert!(!guard.cancel());
        assert!(!guard.is_cancelled());
    }

    #[test]
    fn test_checkpoint_follows_watchdog() {
        let sampler = FakeSampler::default();
        let watchdog = MemoryWatchdog::new(sandbox_only_settings(10), Box::new(sampler.clone()));
        let guard = RunGuard::new(watchdog.clone());
        assert!(guard.checkpoint().is_ok());

        sampler.set(11);
        watchdog.sample_once();
        let err = guard.checkpoint().unwrap_err();
        assert_eq!(classify(&err), Classified::Interrupted);
    }

    #[test]
    fn test_sleep_is_cut_short_by_cancel() {
        let guard = RunGuard::new(idle_watchdog());
        let canceller = guard.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        let started = Instant::now();
        assert!(guard.sleep(Duration::from_secs(5)).is_err());
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_unrepresentable_sleep_waits_for_cancel() {
        let guard = RunGuard::new(idle_watchdog());
        let canceller = guard.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            canceller.cancel();
        });

        let started = Instant::now();
        let err = guard.sleep(Duration::MAX).unwrap_err();
        assert_eq!(classify(&err), Classified::Interrupted);
        assert!(started.elapsed() < Duration::from_secs(2));
        handle.join().unwrap();
    }

    #[test]
    fn test_hook_interrupts_endless_loop() {
        let lua = Lua::new();
        let guard = RunGuard::new(idle_watchdog());
        install_hook(&lua, guard.clone(), 100);

        let canceller = guard.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let err = lua.load("while true do end").exec().unwrap_err();
        assert_eq!(classify(&err), Classified::Interrupted);
        handle.join().unwrap();
    }
}
