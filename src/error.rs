use serde::Serialize;
use thiserror::Error;
use ts_rs::TS;

/// Failure reported by an external collaborator (remote session, export
/// service, model-state store). The core only carries the message through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, TS, Error)]
#[error("{message}")]
#[ts(export)]
pub struct SessionError {
    pub message: String,
}

impl SessionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Structured error type for the coordination core. Tagged so a UI layer can
/// match on the error code and decide what to show.
#[derive(Debug, Clone, Serialize, TS, Error)]
#[serde(tag = "code", content = "detail")]
#[ts(export)]
pub enum StateError {
    #[error("{what} not found")]
    NotFound { what: String },
    #[error("{message}")]
    Validation { message: String },
    #[error("Namespace {namespace} is already executing")]
    CommitInProgress { namespace: String },
    #[error("Result for namespace {namespace} was superseded and discarded")]
    Superseded { namespace: String },
    #[error("Session error in {namespace}: {message}")]
    Session { namespace: String, message: String },
    #[error("History restore failed in {namespace}: {message}")]
    Restore { namespace: String, message: String },
    #[error("Process manager {id} no longer accepts processes")]
    ProcessManagerClosed { id: String },
    #[error("I/O error: {message}")]
    Io { message: String },
    #[error("JSON error: {message}")]
    Json { message: String },
}

impl StateError {
    pub fn not_found(what: impl Into<String>) -> Self {
        StateError::NotFound { what: what.into() }
    }

    pub fn session(namespace: &str, err: &SessionError) -> Self {
        StateError::Session {
            namespace: namespace.to_string(),
            message: err.message.clone(),
        }
    }
}

impl From<std::io::Error> for StateError {
    fn from(e: std::io::Error) -> Self {
        StateError::Io {
            message: e.to_string(),
        }
    }
}

impl From<serde_json::Error> for StateError {
    fn from(e: serde_json::Error) -> Self {
        StateError::Json {
            message: e.to_string(),
        }
    }
}

/// Allow converting StateError to String for callers that only display it.
impl From<StateError> for String {
    fn from(e: StateError) -> String {
        e.to_string()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn serializes_with_code_and_detail() {
        let err = StateError::CommitInProgress {
            namespace: "chair".into(),
        };
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["code"], "CommitInProgress");
        assert_eq!(json["detail"]["namespace"], "chair");
        assert_eq!(err.to_string(), "Namespace chair is already executing");
    }

    #[test]
    fn session_error_carries_namespace() {
        let err = StateError::session("table", &SessionError::new("timeout"));
        assert_eq!(err.to_string(), "Session error in table: timeout");
    }
}
