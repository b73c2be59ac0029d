//! Error taxonomy shared by every component. Handler-scoped errors are
//! caught inside the executor and translated into store settlements;
//! engine-scoped errors bubble to the worker loop, which logs and either
//! backs off (storage faults) or aborts (configuration faults).

use crate::resolver::ResolutionError;

/// Coarse category used by callers that need to branch on *kind* rather
/// than match every variant (the CLI's exit-code mapping, the worker
/// loop's retry-vs-abort decision).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Config,
    Storage,
    Resolution,
    Decode,
    Handler,
    Timeout,
    Invariant,
}

/// Implemented by [`JobforgeError`] so callers can ask "should I retry
/// this?" / "what should my process exit code be?" without re-deriving
/// the policy at each call site.
pub trait Categorizable {
    fn category(&self) -> ErrorCategory;

    /// Transient failures a worker should back off and retry; everything
    /// else is either a per-job terminal condition or a fatal misconfiguration.
    fn is_retryable(&self) -> bool {
        matches!(self.category(), ErrorCategory::Storage)
    }

    /// Exit code per the operational surface contract: 0 success, 1
    /// configuration error, 2 storage error, 3 unknown task.
    fn exit_code(&self) -> i32 {
        match self.category() {
            ErrorCategory::Config => 1,
            ErrorCategory::Storage | ErrorCategory::Invariant => 2,
            ErrorCategory::Resolution => 3,
            ErrorCategory::Decode | ErrorCategory::Handler | ErrorCategory::Timeout => 2,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JobforgeError {
    #[error("configuration error: {0}")]
    Config(String),

    /// A transient storage error survived the driver's own bounded internal
    /// retries. Callers of `add`/admin methods see this; workers log and
    /// sleep briefly rather than failing the job.
    #[error("storage fault: {0}")]
    Storage(String),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("malformed payload: {0}")]
    Decode(String),

    #[error("handler error: {0}")]
    Handler(String),

    #[error("execution timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// A row was observed in a combination the state machine forbids
    /// (e.g. `reserved` with a null `reserved_at`). Logged at error level
    /// and forced into the reclaim path rather than trusted.
    #[error("invariant violation: {0}")]
    Invariant(String),
}

impl Categorizable for JobforgeError {
    fn category(&self) -> ErrorCategory {
        match self {
            JobforgeError::Config(_) => ErrorCategory::Config,
            JobforgeError::Storage(_) => ErrorCategory::Storage,
            JobforgeError::Resolution(_) => ErrorCategory::Resolution,
            JobforgeError::Decode(_) => ErrorCategory::Decode,
            JobforgeError::Handler(_) => ErrorCategory::Handler,
            JobforgeError::Timeout(_) => ErrorCategory::Timeout,
            JobforgeError::Invariant(_) => ErrorCategory::Invariant,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_storage_errors_are_retryable() {
        assert!(JobforgeError::Storage("timeout".to_string()).is_retryable());
        assert!(!JobforgeError::Config("bad url".to_string()).is_retryable());
        assert!(!JobforgeError::Handler("oops".to_string()).is_retryable());
    }

    #[test]
    fn exit_codes_match_the_operational_contract() {
        assert_eq!(JobforgeError::Config("x".to_string()).exit_code(), 1);
        assert_eq!(JobforgeError::Storage("x".to_string()).exit_code(), 2);
        assert_eq!(
            JobforgeError::Resolution(ResolutionError::UnknownTask("x".to_string())).exit_code(),
            3
        );
    }
}
