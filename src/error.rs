use std::io;

/// Errors surfaced across the supervisor: engine spawn/IO, session lifecycle,
/// and block persistence all funnel into this one enum so callers get a
/// single, matchable failure surface (spec §7).
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("engine failed to spawn: {0}")]
    SpawnFailed(String),

    #[error("engine process died: {0}")]
    EngineDied(String),

    #[error("session not ready (status={0})")]
    NotReady(String),

    #[error("session not found: {0}")]
    SessionNotFound(String),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("block {0} is completed or errored and cannot be mutated")]
    BlockImmutable(String),

    #[error("consumer stalled, backpressure timeout")]
    BackpressureTimeout,

    #[error("cancelled")]
    Cancelled,

    #[error("persistence failure: {0}")]
    PersistenceFailure(String),

    #[error("conflict allocating round number, retried {attempts} times")]
    Conflict { attempts: u32 },

    #[error("io: {0}")]
    Io(#[from] io::Error),

    #[error("serde: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("sqlite: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_ready_displays_status() {
        let err = SupervisorError::NotReady("Busy".into());
        assert_eq!(err.to_string(), "session not ready (status=Busy)");
    }

    #[test]
    fn conflict_displays_attempts() {
        let err = SupervisorError::Conflict { attempts: 3 };
        assert_eq!(
            err.to_string(),
            "conflict allocating round number, retried 3 times"
        );
    }

    #[test]
    fn io_error_converts_via_from() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
        let err: SupervisorError = io_err.into();
        assert!(matches!(err, SupervisorError::Io(_)));
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SupervisorError>();
    }
}
