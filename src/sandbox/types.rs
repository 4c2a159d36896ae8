//! Request, limit and outcome types exchanged with the command front end.

use std::fmt;
use std::time::Duration;

use serde::Deserialize;

use super::capture::Animation;
use super::pixels::PixelBuffer;

/// Caller privilege classification, resolved by the front end from the
/// caller's role before the request reaches the sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrivilegeTier {
    Standard,
    Privileged,
}

impl fmt::Display for PrivilegeTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivilegeTier::Standard => f.write_str("standard"),
            PrivilegeTier::Privileged => f.write_str("privileged"),
        }
    }
}

/// One snippet submitted for execution. Immutable once built.
#[derive(Debug, Clone)]
pub struct SandboxRequest {
    code: String,
    tier: PrivilegeTier,
    caller_id: String,
}

impl SandboxRequest {
    pub fn new(code: impl Into<String>, tier: PrivilegeTier, caller_id: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            tier,
            caller_id: caller_id.into(),
        }
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn tier(&self) -> PrivilegeTier {
        self.tier
    }

    /// Opaque identifier of the caller, only used for log correlation.
    pub fn caller_id(&self) -> &str {
        &self.caller_id
    }
}

/// Limits resolved from a [`PrivilegeTier`].
///
/// `memory_ceiling_bytes` is the process-wide ceiling and is identical
/// for every tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub timeout: Duration,
    pub memory_ceiling_bytes: u64,
}

/// Snippet-facing error classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    SyntaxError,
    NameError,
    ImportError,
    AttributeError,
    TypeError,
    ValueError,
    IndexError,
    OverflowError,
    ZeroDivisionError,
    MemoryError,
    RecursionError,
    RuntimeError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 12] = [
        ErrorKind::SyntaxError,
        ErrorKind::NameError,
        ErrorKind::ImportError,
        ErrorKind::AttributeError,
        ErrorKind::TypeError,
        ErrorKind::ValueError,
        ErrorKind::IndexError,
        ErrorKind::OverflowError,
        ErrorKind::ZeroDivisionError,
        ErrorKind::MemoryError,
        ErrorKind::RecursionError,
        ErrorKind::RuntimeError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::SyntaxError => "SyntaxError",
            ErrorKind::NameError => "NameError",
            ErrorKind::ImportError => "ImportError",
            ErrorKind::AttributeError => "AttributeError",
            ErrorKind::TypeError => "TypeError",
            ErrorKind::ValueError => "ValueError",
            ErrorKind::IndexError => "IndexError",
            ErrorKind::OverflowError => "OverflowError",
            ErrorKind::ZeroDivisionError => "ZeroDivisionError",
            ErrorKind::MemoryError => "MemoryError",
            ErrorKind::RecursionError => "RecursionError",
            ErrorKind::RuntimeError => "RuntimeError",
        }
    }

    /// Looks a kind up by its display name (`"ValueError"`).
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == name)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an execution context stopped.
#[derive(Debug, Clone, PartialEq)]
pub enum TerminationReason {
    Completed,
    RuntimeFailure(ErrorKind, String),
    /// The governor interrupted the run (deadline or memory fail-stop).
    Cancelled,
}

/// What the front end receives for every request.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Completed {
        text: String,
        image: Option<PixelBuffer>,
        animation: Option<Animation>,
        /// Time spent evaluating the snippet itself.
        duration: Duration,
    },
    Failed {
        kind: ErrorKind,
        message: String,
        partial_text: String,
    },
    TimedOut {
        partial_text: String,
        /// Only present when the snippet assigned `output.img` before the deadline.
        image: Option<PixelBuffer>,
        timeout: Duration,
    },
    /// The process-wide memory ceiling was breached. The host is shutting
    /// down (or the sandbox subsystem is disabled), so nothing per-request
    /// is reported.
    MemoryAborted,
}

impl ExecutionOutcome {
    /// Short machine-friendly name of the variant.
    pub fn label(&self) -> &'static str {
        match self {
            ExecutionOutcome::Completed { .. } => "completed",
            ExecutionOutcome::Failed { .. } => "failed",
            ExecutionOutcome::TimedOut { .. } => "timed_out",
            ExecutionOutcome::MemoryAborted => "memory_aborted",
        }
    }

    /// Captured text, complete or partial. Empty for `MemoryAborted`.
    pub fn text(&self) -> &str {
        match self {
            ExecutionOutcome::Completed { text, .. } => text,
            ExecutionOutcome::Failed { partial_text, .. } => partial_text,
            ExecutionOutcome::TimedOut { partial_text, .. } => partial_text,
            ExecutionOutcome::MemoryAborted => "",
        }
    }

    pub fn image(&self) -> Option<&PixelBuffer> {
        match self {
            ExecutionOutcome::Completed { image, .. } => image.as_ref(),
            ExecutionOutcome::TimedOut { image, .. } => image.as_ref(),
            _ => None,
        }
    }
}
