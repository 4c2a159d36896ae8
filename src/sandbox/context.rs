//! One snippet evaluation on the execution thread.

use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::capture::{CaptureSnapshot, SharedCapture};
use super::error::{classify, Classified};
use super::governor::{install_hook, RunGuard};
use super::namespace::CapabilityNamespace;
use super::types::TerminationReason;

/// Chunk name used in snippet error positions (`snippet:3: ...`).
const CHUNK_NAME: &str = "=snippet";

/// What the execution thread hands back once evaluation stops.
#[derive(Debug)]
pub struct ContextReport {
    pub reason: TerminationReason,
    /// `None` when the controller cancelled first and already owns the capture.
    pub snapshot: Option<CaptureSnapshot>,
    pub duration: Duration,
}

pub struct ExecutionContext {
    namespace: CapabilityNamespace,
    capture: SharedCapture,
    guard: RunGuard,
    script_memory_bytes: usize,
    instruction_quantum: u32,
}

impl ExecutionContext {
    pub fn new(
        namespace: CapabilityNamespace,
        capture: SharedCapture,
        guard: RunGuard,
        script_memory_bytes: usize,
        instruction_quantum: u32,
    ) -> Self {
        Self {
            namespace,
            capture,
            guard,
            script_memory_bytes,
            instruction_quantum,
        }
    }

    /// Evaluates `code` to completion, failure or interruption. Consumes
    /// the context: the Lua state is torn down when this returns.
    pub fn run(self, code: &str) -> ContextReport {
        let started = Instant::now();
        let reason = self.evaluate(code);
        let duration = started.elapsed();

        let snapshot = if self.guard.finish() {
            self.capture.freeze()
        } else {
            debug!("Run already cancelled, capture left to the controller");
            None
        };
        ContextReport {
            reason,
            snapshot,
            duration,
        }
    }

    fn evaluate(&self, code: &str) -> TerminationReason {
        let lua = self.namespace.lua();
        if let Err(err) = lua.set_memory_limit(self.script_memory_bytes) {
            warn!("Could not apply script memory limit: {err}");
        }

        let env = match self.namespace.env() {
            Ok(env) => env,
            Err(err) => return termination(&err),
        };
        let function = match lua
            .load(code)
            .set_name(CHUNK_NAME)
            .set_environment(env)
            .into_function()
        {
            Ok(function) => function,
            Err(err) => return termination(&err),
        };

        install_hook(lua, self.guard.clone(), self.instruction_quantum);
        match function.call::<_, ()>(()) {
            Ok(()) => TerminationReason::Completed,
            Err(err) => termination(&err),
        }
    }
}

fn termination(err: &mlua::Error) -> TerminationReason {
    match classify(err) {
        Classified::Interrupted => TerminationReason::Cancelled,
        Classified::Failure(kind, message) => TerminationReason::RuntimeFailure(kind, message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SandboxSettings;
    use crate::sandbox::namespace::NamespaceBuilder;
    use crate::sandbox::types::ErrorKind;
    use crate::sandbox::watchdog::testing::idle_watchdog;
    use std::thread;

    fn context_with(settings: &SandboxSettings, guard: RunGuard) -> ExecutionContext {
        let capture = SharedCapture::new(settings.max_output_bytes);
        let namespace = NamespaceBuilder::new(settings, capture.clone(), guard.clone())
            .build()
            .unwrap();
        ExecutionContext::new(
            namespace,
            capture,
            guard,
            settings.script_memory_bytes,
            settings.instruction_quantum,
        )
    }

    fn run(code: &str) -> ContextReport {
        let settings = SandboxSettings::default();
        context_with(&settings, RunGuard::new(idle_watchdog())).run(code)
    }

    fn failure_kind(report: &ContextReport) -> ErrorKind {
        match &report.reason {
            TerminationReason::RuntimeFailure(kind, _) => *kind,
            other => panic!("expected a failure, got {other:?}"),
        }
    }

    #[test]
    fn test_completed_run_hands_off_text() {
        let report = run(r#"for i = 1, 3 do print("line", i) end"#);
        assert_eq!(report.reason, TerminationReason::Completed);
        assert_eq!(report.snapshot.unwrap().text, "line 1\nline 2\nline 3\n");
    }

    #[test]
    fn test_syntax_error_never_evaluates() {
        let report = run("print('before')\nlocal = 3");
        assert_eq!(failure_kind(&report), ErrorKind::SyntaxError);
        assert_eq!(report.snapshot.unwrap().text, "");
    }

    #[test]
    fn test_runtime_failures_keep_partial_text() {
        let report = run("print('partial')\nlocal x = nil + 1");
        assert_eq!(failure_kind(&report), ErrorKind::TypeError);
        assert_eq!(report.snapshot.unwrap().text, "partial\n");

        let report = run("local x = 1 // 0");
        assert_eq!(failure_kind(&report), ErrorKind::ZeroDivisionError);

        let report = run("local function f() return 1 + f() end f()");
        assert_eq!(failure_kind(&report), ErrorKind::RecursionError);
    }

    #[test]
    fn test_error_positions_use_snippet_name() {
        let report = run("\n\nerror('custom')");
        match report.reason {
            TerminationReason::RuntimeFailure(ErrorKind::RuntimeError, message) => {
                assert_eq!(message, "snippet:3: custom");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_script_memory_limit() {
        let settings = SandboxSettings {
            script_memory_bytes: 8 * 1024 * 1024,
            ..SandboxSettings::default()
        };
        let report = context_with(&settings, RunGuard::new(idle_watchdog()))
            .run("local t = {} for i = 1, 1e9 do t[i] = tostring(i) end");
        assert_eq!(failure_kind(&report), ErrorKind::MemoryError);
    }

    #[test]
    fn test_cancel_interrupts_and_keeps_capture_for_controller() {
        let settings = SandboxSettings::default();
        let guard = RunGuard::new(idle_watchdog());
        let context = context_with(&settings, guard.clone());

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            assert!(guard.cancel());
        });
        let report = context.run("print('spin') while true do end");
        canceller.join().unwrap();

        assert_eq!(report.reason, TerminationReason::Cancelled);
        assert!(report.snapshot.is_none());
    }
}
