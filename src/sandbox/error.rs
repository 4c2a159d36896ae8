//! Host faults, snippet-raised errors, and classification of `mlua`
//! errors at the execution context boundary.

use super::types::ErrorKind;

/// Faults of the sandbox machinery itself. These are operator problems
/// and are never reported to the caller as a snippet error.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("failed to build sandbox namespace (module `{module}`): {source}")]
    Namespace {
        module: &'static str,
        #[source]
        source: mlua::Error,
    },

    #[error("failed to spawn sandbox thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Error raised by a host builtin on behalf of the snippet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct SnippetError {
    pub kind: ErrorKind,
    pub message: String,
}

impl SnippetError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::TypeError, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ValueError, message)
    }
}

impl From<SnippetError> for mlua::Error {
    fn from(err: SnippetError) -> Self {
        mlua::Error::external(err)
    }
}

/// Raised inside the VM once the governor has decided the run is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("execution interrupted by the sandbox governor")]
pub struct Interrupted;

impl From<Interrupted> for mlua::Error {
    fn from(err: Interrupted) -> Self {
        mlua::Error::external(err)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Classified {
    Interrupted,
    Failure(ErrorKind, String),
}

/// Maps any error that left the VM onto the snippet-facing taxonomy.
/// Only the snippet-level message is kept, never the host traceback.
pub(crate) fn classify(err: &mlua::Error) -> Classified {
    match err {
        mlua::Error::SyntaxError { message, .. } => {
            Classified::Failure(ErrorKind::SyntaxError, without_traceback(message).to_string())
        }
        mlua::Error::MemoryError(message) => {
            Classified::Failure(ErrorKind::MemoryError, message.clone())
        }
        mlua::Error::RuntimeError(message) => {
            let message = without_traceback(message);
            Classified::Failure(kind_from_lua_message(message), message.to_string())
        }
        mlua::Error::CallbackError { cause, .. } => classify(cause),
        mlua::Error::ExternalError(inner) => {
            if inner.downcast_ref::<Interrupted>().is_some() {
                Classified::Interrupted
            } else if let Some(raised) = inner.downcast_ref::<SnippetError>() {
                Classified::Failure(raised.kind, raised.message.clone())
            } else {
                Classified::Failure(ErrorKind::RuntimeError, inner.to_string())
            }
        }
        mlua::Error::FromLuaConversionError { .. } | mlua::Error::ToLuaConversionError { .. } => {
            Classified::Failure(ErrorKind::TypeError, err.to_string())
        }
        other => {
            let message = other.to_string();
            let message = without_traceback(&message);
            Classified::Failure(kind_from_lua_message(message), message.to_string())
        }
    }
}

/// Errors that a snippet must not be able to swallow with `pcall`.
pub(crate) fn is_fatal(err: &mlua::Error) -> bool {
    match classify(err) {
        Classified::Interrupted => true,
        Classified::Failure(kind, _) => kind == ErrorKind::MemoryError,
    }
}

/// The message handed back to the snippet by `pcall`/`xpcall`.
pub(crate) fn snippet_message(err: &mlua::Error) -> String {
    match classify(err) {
        Classified::Interrupted => Interrupted.to_string(),
        Classified::Failure(ErrorKind::RuntimeError, message) => message,
        Classified::Failure(kind, message) => format!("{kind}: {message}"),
    }
}

/// Lua errors come back with the VM traceback appended.
fn without_traceback(message: &str) -> &str {
    match message.find("\nstack traceback:") {
        Some(end) => &message[..end],
        None => message,
    }
}

fn kind_from_lua_message(message: &str) -> ErrorKind {
    if message.contains("stack overflow") {
        ErrorKind::RecursionError
    } else if message.contains("not enough memory") {
        ErrorKind::MemoryError
    } else if message.contains("attempt to perform 'n//0'")
        || message.contains("attempt to perform 'n%0'")
    {
        ErrorKind::ZeroDivisionError
    } else if message.contains("has no integer representation") {
        ErrorKind::ValueError
    } else if message.contains("attempt to")
        || message.contains("bad argument")
        || message.contains("error converting")
    {
        ErrorKind::TypeError
    } else {
        ErrorKind::RuntimeError
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_classify_snippet_error_through_callback() {
        let raised: mlua::Error = SnippetError::value_error("bad delay").into();
        let wrapped = mlua::Error::CallbackError {
            traceback: "stack traceback:\n\t[C]: in ?".to_string(),
            cause: Arc::new(raised),
        };
        assert_eq!(
            classify(&wrapped),
            Classified::Failure(ErrorKind::ValueError, "bad delay".to_string())
        );
    }

    #[test]
    fn test_classify_interrupted_is_fatal() {
        let err: mlua::Error = Interrupted.into();
        assert_eq!(classify(&err), Classified::Interrupted);
        assert!(is_fatal(&err));
    }

    #[test]
    fn test_classify_lua_runtime_messages() {
        let cases = [
            ("snippet:1: attempt to call a nil value (global 'f')", ErrorKind::TypeError),
            ("snippet:3: stack overflow", ErrorKind::RecursionError),
            ("snippet:2: attempt to perform 'n//0'", ErrorKind::ZeroDivisionError),
            ("snippet:1: boom", ErrorKind::RuntimeError),
        ];
        for (message, expected) in cases {
            let err = mlua::Error::RuntimeError(message.to_string());
            assert_eq!(
                classify(&err),
                Classified::Failure(expected, message.to_string()),
                "{message}"
            );
        }
    }

    #[test]
    fn test_traceback_is_stripped() {
        let err = mlua::Error::RuntimeError(
            "snippet:2: boom\nstack traceback:\n\t[C]: in function 'error'".to_string(),
        );
        assert_eq!(
            classify(&err),
            Classified::Failure(ErrorKind::RuntimeError, "snippet:2: boom".to_string())
        );
    }

    #[test]
    fn test_memory_error_is_fatal() {
        let err = mlua::Error::MemoryError("not enough memory".to_string());
        assert!(is_fatal(&err));
        let err = mlua::Error::RuntimeError("snippet:1: boom".to_string());
        assert!(!is_fatal(&err));
    }

    #[test]
    fn test_snippet_message_prefixes_kind() {
        let err: mlua::Error = SnippetError::type_error("expected a Surface").into();
        assert_eq!(snippet_message(&err), "TypeError: expected a Surface");
        let err = mlua::Error::RuntimeError("snippet:1: boom".to_string());
        assert_eq!(snippet_message(&err), "snippet:1: boom");
    }
}
