// Error types for the connectivity core

//! Error types
//!
//! Every fallible library operation returns [`Result`]. Errors raised by a
//! lower layer are wrapped with the identity of the step that failed via
//! [`StepExt::step`], and [`Error::kind`] looks through those wrappers so
//! callers can branch on what actually went wrong.

use crate::engine::EngineStatus;
use thiserror::Error;

/// Result type alias for library operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by the tunnel, connection and routing controllers
#[derive(Debug, Error)]
pub enum Error {
    /// Interface, address or MTU operation failed
    #[error("{step}: {reason}")]
    Configuration {
        /// Operation that failed
        step: &'static str,
        /// What the OS reported
        reason: String,
    },

    /// The engine returned a non-OK result code
    #[error("{step}: engine returned {status}")]
    Engine {
        /// Operation that failed
        step: &'static str,
        /// Result code returned by the engine
        status: EngineStatus,
    },

    /// Connect succeeded but no live link was reported before the deadline
    #[error("connected to {server} but there is no connectivity as a result")]
    ConnectivityTimeout {
        /// Exit node that was connected to
        server: String,
    },

    /// Routing agent operation failed
    #[error("{step}: {reason}")]
    Routing {
        /// Operation that failed
        step: &'static str,
        /// What the routing agent reported
        reason: String,
    },

    /// Engine snapshot could not be decoded
    #[error("decoding engine snapshot: {0}")]
    Decode(#[from] serde_json::Error),

    /// Operation requires an open tunnel
    #[error("tunnel is not open")]
    TunnelAbsent,

    /// An inner error annotated with the step that produced it
    #[error("{step}: {source}")]
    Step {
        /// Step that produced `source`
        step: &'static str,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },
}

/// Coarse error classification, independent of step wrapping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// See [`Error::Configuration`]
    Configuration,
    /// See [`Error::Engine`]
    Engine,
    /// See [`Error::ConnectivityTimeout`]
    ConnectivityTimeout,
    /// See [`Error::Routing`]
    Routing,
    /// See [`Error::Decode`]
    Decode,
    /// See [`Error::TunnelAbsent`]
    TunnelAbsent,
}

impl Error {
    /// Classify the error, unwrapping any step annotations
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Configuration { .. } => ErrorKind::Configuration,
            Error::Engine { .. } => ErrorKind::Engine,
            Error::ConnectivityTimeout { .. } => ErrorKind::ConnectivityTimeout,
            Error::Routing { .. } => ErrorKind::Routing,
            Error::Decode(_) => ErrorKind::Decode,
            Error::TunnelAbsent => ErrorKind::TunnelAbsent,
            Error::Step { source, .. } => source.kind(),
        }
    }

    /// Engine result code carried by this error, if any
    pub fn engine_status(&self) -> Option<EngineStatus> {
        match self {
            Error::Engine { status, .. } => Some(*status),
            Error::Step { source, .. } => source.engine_status(),
            _ => None,
        }
    }

    pub(crate) fn configuration(step: &'static str, reason: impl ToString) -> Self {
        Error::Configuration {
            step,
            reason: reason.to_string(),
        }
    }

    pub(crate) fn routing(step: &'static str, reason: impl ToString) -> Self {
        Error::Routing {
            step,
            reason: reason.to_string(),
        }
    }
}

/// Annotate an error with the step that failed
pub trait StepExt<T> {
    /// Wrap the error, if any, in [`Error::Step`]
    fn step(self, step: &'static str) -> Result<T>;
}

impl<T> StepExt<T> for Result<T> {
    fn step(self, step: &'static str) -> Result<T> {
        self.map_err(|source| Error::Step {
            step,
            source: Box::new(source),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_looks_through_steps() {
        let err: Result<()> = Err(Error::configuration("setting mtu", "device busy"));
        let err = err.step("opening the tunnel").step("enabling mesh").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(
            err.to_string(),
            "enabling mesh: opening the tunnel: setting mtu: device busy"
        );
    }

    #[test]
    fn test_engine_status_is_preserved() {
        let err: Result<()> = Err(Error::Engine {
            step: "starting the engine",
            status: EngineStatus::InvalidKey,
        });
        let err = err.step("opening the tunnel").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(err.engine_status(), Some(EngineStatus::InvalidKey));
    }

    #[test]
    fn test_timeout_message_names_server() {
        let err = Error::ConnectivityTimeout {
            server: "1.2.3.4".to_string(),
        };
        assert!(err.to_string().contains("1.2.3.4"));
        assert_eq!(err.engine_status(), None);
    }
}
