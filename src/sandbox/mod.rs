//! In-process execution sandbox for untrusted script snippets.
//!
//! A [`Sandbox`] turns a [`SandboxRequest`] into an [`ExecutionOutcome`]:
//!
//! 1. A fresh Lua state is built per request holding only the allow-listed
//!    builtins and modules ([`namespace`]).
//! 2. The snippet runs on its own OS thread ([`context`]) while the calling
//!    task races completion against the tier's deadline ([`governor`]).
//! 3. One process-wide watcher enforces the memory ceiling ([`watchdog`]).
//!
//! Everything the snippet prints or draws lands in an [`OutputCapture`]
//! that is handed back exactly once.

pub mod capture;
pub mod context;
pub mod error;
pub mod governor;
pub mod modules;
pub mod namespace;
pub mod patterns;
pub mod pixels;
pub mod types;
pub mod watchdog;

pub use capture::{Animation, CaptureSnapshot, Frame, OutputCapture, SharedCapture};
pub use error::{SandboxError, SnippetError};
pub use pixels::{PixelBuffer, Rgba};
pub use types::{
    ErrorKind, ExecutionOutcome, PrivilegeTier, ResourceLimits, SandboxRequest, TerminationReason,
};
pub use watchdog::{FailStop, MemoryWatchdog, WatchdogState};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use tokio::sync::oneshot;
use tracing::{debug, error, info, info_span, warn, Instrument, Span};
use uuid::Uuid;

use crate::config::SandboxSettings;
use context::{ContextReport, ExecutionContext};
use governor::RunGuard;
use namespace::NamespaceBuilder;

const EXECUTION_STACK_BYTES: usize = 8 * 1024 * 1024;

/// The only thing a caller learns about a fault on the execution thread.
const INTERNAL_ERROR_MESSAGE: &str = "internal sandbox error";

type WorkerResult = Result<thread::Result<ContextReport>, oneshot::error::RecvError>;

/// Entry point for running untrusted snippets.
///
/// Cheap to share behind an `Arc`: every [`execute`](Sandbox::execute) call
/// builds its own Lua state and execution thread, and only the memory
/// watchdog is common to all of them.
pub struct Sandbox {
    settings: SandboxSettings,
    watchdog: Arc<MemoryWatchdog>,
}

impl Sandbox {
    /// Creates a sandbox attached to the process-wide memory watchdog,
    /// starting the watchdog on first use.
    pub fn new(settings: SandboxSettings) -> Result<Self, SandboxError> {
        let watchdog = MemoryWatchdog::global(settings.watchdog_settings())?;
        Ok(Self::with_watchdog(settings, watchdog))
    }

    pub fn with_watchdog(settings: SandboxSettings, watchdog: Arc<MemoryWatchdog>) -> Self {
        Self { settings, watchdog }
    }

    pub fn settings(&self) -> &SandboxSettings {
        &self.settings
    }

    pub fn watchdog(&self) -> &Arc<MemoryWatchdog> {
        &self.watchdog
    }

    /// Runs one snippet under the limits of its caller's tier.
    ///
    /// Snippet failures, timeouts and memory aborts are all `Ok`; `Err` is
    /// reserved for faults of the sandbox itself.
    pub async fn execute(&self, request: SandboxRequest) -> Result<ExecutionOutcome, SandboxError> {
        let run_id = Uuid::new_v4();
        let span = info_span!(
            "sandbox",
            %run_id,
            caller = %request.caller_id(),
            tier = %request.tier()
        );
        self.supervise(request).instrument(span).await
    }

    async fn supervise(&self, request: SandboxRequest) -> Result<ExecutionOutcome, SandboxError> {
        let limits = self.settings.limits_for(request.tier());
        if self.watchdog.is_shutdown() {
            warn!("Memory watchdog has shut the sandbox down, refusing request");
            return Ok(ExecutionOutcome::MemoryAborted);
        }
        let mut shutdown_rx = self.watchdog.subscribe();

        let capture = SharedCapture::new(self.settings.max_output_bytes);
        let guard = RunGuard::new(self.watchdog.clone());
        let namespace = NamespaceBuilder::new(&self.settings, capture.clone(), guard.clone()).build()?;
        let context = ExecutionContext::new(
            namespace,
            capture.clone(),
            guard.clone(),
            self.settings.script_memory_bytes,
            self.settings.instruction_quantum,
        );

        let (report_tx, mut report_rx) = oneshot::channel();
        let code = request.code().to_string();
        let span = Span::current();
        thread::Builder::new()
            .name("sandbox-exec".to_string())
            .stack_size(EXECUTION_STACK_BYTES)
            .spawn(move || {
                let _entered = span.enter();
                let report = panic::catch_unwind(AssertUnwindSafe(move || context.run(&code)));
                // The controller may have stopped listening after a timeout.
                let _ = report_tx.send(report);
            })?;
        debug!("Snippet started ({} bytes, timeout {}ms)", request.code().len(), limits.timeout.as_millis());

        let started = Instant::now();
        let outcome = tokio::select! {
            biased;

            _ = watchdog::wait_for_shutdown(&mut shutdown_rx) => {
                guard.cancel();
                capture.freeze();
                warn!("Memory ceiling breached while snippet was running");
                ExecutionOutcome::MemoryAborted
            }
            result = &mut report_rx => self.settle(result, &guard, &capture),
            _ = tokio::time::sleep(limits.timeout) => {
                if guard.cancel() {
                    let snapshot = capture.freeze().unwrap_or_default();
                    warn!("Snippet exceeded its {}ms deadline, cancelled", limits.timeout.as_millis());
                    self.await_teardown(report_rx).await;
                    ExecutionOutcome::TimedOut {
                        partial_text: snapshot.text,
                        image: snapshot.image,
                        timeout: limits.timeout,
                    }
                } else {
                    // Finished at the deadline: the report is already on its way.
                    let grace = self.settings.teardown_grace();
                    match tokio::time::timeout(grace, report_rx).await {
                        Ok(result) => self.settle(result, &guard, &capture),
                        Err(_) => internal_failure(&guard, &capture, "finished run never reported"),
                    }
                }
            }
        };

        info!(
            "Snippet {} after {}ms",
            outcome.label(),
            started.elapsed().as_millis()
        );
        Ok(outcome)
    }

    /// Turns what the execution thread reported into an outcome.
    fn settle(&self, result: WorkerResult, guard: &RunGuard, capture: &SharedCapture) -> ExecutionOutcome {
        // A breach racing with completion wins.
        if self.watchdog.is_shutdown() {
            guard.cancel();
            capture.freeze();
            return ExecutionOutcome::MemoryAborted;
        }

        let report = match result {
            Ok(Ok(report)) => report,
            Ok(Err(payload)) => {
                return internal_failure(guard, capture, &panic_message(payload.as_ref()));
            }
            Err(_) => {
                return internal_failure(guard, capture, "execution thread exited without a report");
            }
        };

        let Some(snapshot) = report.snapshot else {
            return internal_failure(guard, capture, "run reported without its capture");
        };
        match report.reason {
            TerminationReason::Completed => ExecutionOutcome::Completed {
                text: snapshot.text,
                image: snapshot.image,
                animation: snapshot.animation,
                duration: report.duration,
            },
            TerminationReason::RuntimeFailure(kind, message) => {
                debug!("Snippet raised {kind}: {message}");
                ExecutionOutcome::Failed {
                    kind,
                    message,
                    partial_text: snapshot.text,
                }
            }
            // Only the watchdog interrupts a run the controller did not cancel.
            TerminationReason::Cancelled => ExecutionOutcome::MemoryAborted,
        }
    }

    async fn await_teardown(&self, report_rx: oneshot::Receiver<thread::Result<ContextReport>>) {
        let grace = self.settings.teardown_grace();
        match tokio::time::timeout(grace, report_rx).await {
            Ok(_) => debug!("Execution thread stopped after cancellation"),
            Err(_) => warn!(
                "Execution thread did not stop within {}ms, detaching it",
                grace.as_millis()
            ),
        }
    }
}

fn internal_failure(guard: &RunGuard, capture: &SharedCapture, detail: &str) -> ExecutionOutcome {
    guard.cancel();
    let partial_text = capture.freeze().map(|snapshot| snapshot.text).unwrap_or_default();
    error!("Sandbox fault: {detail}");
    ExecutionOutcome::Failed {
        kind: ErrorKind::RuntimeError,
        message: INTERNAL_ERROR_MESSAGE.to_string(),
        partial_text,
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("execution thread panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("execution thread panicked: {message}")
    } else {
        "execution thread panicked".to_string()
    }
}
