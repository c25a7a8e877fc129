//! Error taxonomy for the evaluation engine.
//!
//! Only two kinds of error propagate to callers as hard failures: a
//! transport failure at the model-invocation boundary and a configuration
//! error detected before a run starts. Everything else degrades in place:
//! a probe that fails scores zero, an unattributable tool call scores as a
//! failed attribution, and a store outage leaves the run result in memory
//! with persistence flagged as failed.

use thiserror::Error;

/// Errors surfaced by the evaluation engine.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The model-invocation transport is unreachable or broke mid-call.
    /// Aborts the current run.
    #[error("transport failure: {message}")]
    Transport { message: String },

    /// Missing or contradictory settings detected before a run starts.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The persistent store is unavailable. The run itself is not rolled
    /// back; results are held in memory.
    #[error("persistence error: {message}")]
    Persistence { message: String },

    /// A referenced entity (run, prosthetic, version) does not exist.
    #[error("not found: {what}")]
    NotFound { what: String },
}

impl EngineError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    pub fn persistence(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Whether this error should abort an in-flight run rather than be
    /// scored as a failing probe.
    pub fn aborts_run(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Configuration { .. })
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_aborts_run() {
        assert!(EngineError::transport("connection refused").aborts_run());
        assert!(EngineError::configuration("no student model").aborts_run());
        assert!(!EngineError::persistence("db locked").aborts_run());
        assert!(!EngineError::not_found("run 42").aborts_run());
    }

    #[test]
    fn test_display_messages() {
        let err = EngineError::transport("connection refused");
        assert_eq!(err.to_string(), "transport failure: connection refused");
        let err = EngineError::not_found("prosthetic for m1");
        assert_eq!(err.to_string(), "not found: prosthetic for m1");
    }
}
