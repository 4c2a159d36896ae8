//! Process-wide memory watchdog.
//!
//! A single watcher thread samples the resident set size of the whole
//! process. The first sample above the ceiling flips the watchdog from
//! `Running` to `Shutdown`, irreversibly, and applies the fail-stop policy:
//! every in-flight and future request resolves to `MemoryAborted`, and by
//! default the process exits shortly afterwards. No recovery is attempted;
//! a process already over its ceiling cannot be trusted to allocate the
//! bookkeeping a graceful recovery would need.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Exit status used when the watchdog stops the whole process.
pub const MEMORY_ABORT_EXIT_CODE: i32 = 137;

static GLOBAL: Mutex<Option<Arc<MemoryWatchdog>>> = Mutex::new(None);

/// Source of "how much memory does this process use right now".
pub trait MemorySampler: Send + Sync + 'static {
    /// Resident bytes, or `None` when the platform cannot tell.
    fn resident_bytes(&self) -> Option<u64>;
}

/// Reads the resident set size of the current process from procfs.
pub struct ProcessMemory;

impl MemorySampler for ProcessMemory {
    #[cfg(target_os = "linux")]
    fn resident_bytes(&self) -> Option<u64> {
        let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
        let pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
        // SAFETY: sysconf has no preconditions and only reads configuration.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if page_size <= 0 {
            return None;
        }
        Some(pages * page_size as u64)
    }

    #[cfg(not(target_os = "linux"))]
    fn resident_bytes(&self) -> Option<u64> {
        None
    }
}

/// What happens after the ceiling is breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailStop {
    /// Stop the whole host process after `shutdown_grace`.
    Process,
    /// Disable the sandbox subsystem only; the host keeps running.
    Sandbox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogState {
    Running,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchdogSettings {
    pub ceiling_bytes: u64,
    pub poll_interval: Duration,
    pub fail_stop: FailStop,
    /// Time given to in-flight callers to observe `MemoryAborted` before
    /// the process exits.
    pub shutdown_grace: Duration,
}

pub struct MemoryWatchdog {
    settings: WatchdogSettings,
    sampler: Box<dyn MemorySampler>,
    shutdown: AtomicBool,
    state_tx: watch::Sender<WatchdogState>,
}

impl MemoryWatchdog {
    /// Creates a watchdog without a watcher thread. See [`spawn_watcher`](Self::spawn_watcher).
    pub fn new(settings: WatchdogSettings, sampler: Box<dyn MemorySampler>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(WatchdogState::Running);
        Arc::new(Self {
            settings,
            sampler,
            shutdown: AtomicBool::new(false),
            state_tx,
        })
    }

    /// Returns the process-wide watchdog, creating it and its watcher
    /// thread on first use. Later calls get the same instance; differing
    /// settings are ignored with a warning since the ceiling is read once.
    pub fn global(settings: WatchdogSettings) -> io::Result<Arc<Self>> {
        let mut slot = GLOBAL.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slot.as_ref() {
            if existing.settings != settings {
                warn!(
                    "Memory watchdog already running with a {} byte ceiling, ignoring new settings",
                    existing.settings.ceiling_bytes
                );
            }
            return Ok(existing.clone());
        }

        let watchdog = Self::new(settings, Box::new(ProcessMemory));
        if watchdog.sampler.resident_bytes().is_none() {
            warn!("Resident memory is not readable on this platform, memory ceiling is not enforced");
        }
        watchdog.spawn_watcher()?;
        info!(
            "Memory watchdog started: ceiling {} bytes, sampled every {}ms, fail-stop: {:?}",
            settings.ceiling_bytes,
            settings.poll_interval.as_millis(),
            settings.fail_stop
        );
        *slot = Some(watchdog.clone());
        Ok(watchdog)
    }

    /// Starts the sampling thread. It stops once the watchdog trips or
    /// once every handle to the watchdog has been dropped.
    pub fn spawn_watcher(self: &Arc<Self>) -> io::Result<thread::JoinHandle<()>> {
        let weak = Arc::downgrade(self);
        let interval = self.settings.poll_interval;
        thread::Builder::new()
            .name("sandbox-memwatch".to_string())
            .spawn(move || loop {
                thread::sleep(interval);
                let Some(watchdog) = weak.upgrade() else {
                    debug!("Memory watchdog dropped, watcher exiting");
                    break;
                };
                if watchdog.sample_once() == WatchdogState::Shutdown {
                    break;
                }
            })
    }

    /// Takes one sample and trips the watchdog if it is over the ceiling.
    pub fn sample_once(&self) -> WatchdogState {
        if self.is_shutdown() {
            return WatchdogState::Shutdown;
        }
        if let Some(resident) = self.sampler.resident_bytes() {
            if resident > self.settings.ceiling_bytes {
                self.trip(resident);
            }
        }
        self.state()
    }

    fn trip(&self, resident: u64) {
        // Running -> Shutdown happens exactly once.
        if self.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state_tx.send_replace(WatchdogState::Shutdown);
        error!(
            "Process memory at {resident} bytes exceeds the {} byte ceiling, sandbox shutting down",
            self.settings.ceiling_bytes
        );

        if self.settings.fail_stop == FailStop::Process {
            thread::sleep(self.settings.shutdown_grace);
            error!("Memory fail-stop: terminating host process");
            std::process::exit(MEMORY_ABORT_EXIT_CODE);
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> WatchdogState {
        if self.is_shutdown() {
            WatchdogState::Shutdown
        } else {
            WatchdogState::Running
        }
    }

    pub fn settings(&self) -> &WatchdogSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> watch::Receiver<WatchdogState> {
        self.state_tx.subscribe()
    }
}

/// Resolves once the watchdog reports `Shutdown`.
pub async fn wait_for_shutdown(rx: &mut watch::Receiver<WatchdogState>) {
    loop {
        if *rx.borrow_and_update() == WatchdogState::Shutdown {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: the watchdog can no longer trip.
            std::future::pending::<()>().await;
        }
    }
}
