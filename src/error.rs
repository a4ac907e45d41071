use std::time::Duration;

use thiserror::Error;

use crate::state_machine::State;

/// An expected, displayable failure of a stage.
///
/// The `Display` text is exactly what ends up in the job log, so every
/// variant carries a fully formatted message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WorkError {
    #[error("$ {command}\ncommand failed ({code}){output}")]
    CommandFailed {
        command: String,
        code: i32,
        output: String,
    },

    #[error("$ {command}\ncommand {program} not found")]
    NotFound { command: String, program: String },

    #[error("$ {command}\ntimeout after {secs} seconds{output}", secs = .timeout.as_secs_f64())]
    Timeout {
        command: String,
        timeout: Duration,
        output: String,
    },

    #[error("$ {command}\ncommand {program} could not be started: {reason}")]
    Spawn {
        command: String,
        program: String,
        reason: String,
    },

    #[error("{0}")]
    Message(String),
}

impl WorkError {
    pub fn msg(message: impl Into<String>) -> Self {
        WorkError::Message(message.into())
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Job already exists: {0}")]
    JobExists(String),

    #[error("Invalid job name: {0:?}")]
    InvalidName(String),

    #[error("Invalid transition for job {job}: {from} -> {to}")]
    InvalidTransition { job: String, from: State, to: State },

    #[error("Stale job {job}: caller holds {held}, store has {actual}")]
    Stale {
        job: String,
        held: State,
        actual: State,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// What a stage body can fail with.
///
/// `Work` is an operational failure whose message is logged verbatim;
/// `Defect` is anything unexpected and is logged with its full chain.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Work(#[from] WorkError),

    #[error(transparent)]
    Defect(#[from] anyhow::Error),
}

impl From<std::io::Error> for StageError {
    fn from(err: std::io::Error) -> Self {
        StageError::Defect(err.into())
    }
}

impl From<StoreError> for StageError {
    fn from(err: StoreError) -> Self {
        StageError::Defect(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_failed_display() {
        let err = WorkError::CommandFailed {
            command: "make 'a b'".into(),
            code: 2,
            output: "\noops".into(),
        };
        assert_eq!(err.to_string(), "$ make 'a b'\ncommand failed (2)\noops");
    }

    #[test]
    fn timeout_display_uses_seconds() {
        let err = WorkError::Timeout {
            command: "sleep 10".into(),
            timeout: Duration::from_millis(1500),
            output: String::new(),
        };
        assert_eq!(err.to_string(), "$ sleep 10\ntimeout after 1.5 seconds");

        let err = WorkError::Timeout {
            command: "sleep 10".into(),
            timeout: Duration::from_secs(1800),
            output: String::new(),
        };
        assert!(err.to_string().ends_with("timeout after 1800 seconds"));
    }

    #[test]
    fn message_is_verbatim() {
        assert_eq!(
            WorkError::msg("no source file found").to_string(),
            "no source file found"
        );
    }

    #[test]
    fn io_errors_become_defects() {
        let err: StageError = std::io::Error::other("disk on fire").into();
        assert!(matches!(err, StageError::Defect(_)));
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<WorkError>();
        assert_send_sync::<StoreError>();
        assert_send_sync::<StageError>();
    }
}
