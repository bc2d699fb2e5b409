//! Error taxonomy shared by every component
//!
//! Transport, authentication, malformed model output and execution failures
//! stay distinct so the orchestrator can route them differently.

use thiserror::Error;

/// Errors surfaced by the query pipeline
#[derive(Error, Debug)]
pub enum Error {
    /// Endpoint unreachable, connection dropped, body unreadable
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-success HTTP status with the best message we could extract
    #[error("{message}")]
    Http { status: u16, message: String },

    /// Missing, expired or revoked credential; re-enter the auth flow
    #[error("Authentication required")]
    AuthRequired,

    /// Code exchange or provisioning rejected by the provider
    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    /// Model output that cannot be turned into a plan
    #[error("{0}")]
    MalformedPlan(String),

    /// A step raised inside the sandbox
    #[error("{0}")]
    Execution(String),

    /// The isolated worker died, refused to start or spoke garbage
    #[error("Worker error: {0}")]
    Worker(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Config error: {0}")]
    Config(String),
}

impl Error {
    /// Sentinel checked by the orchestrator before reporting a terminal error
    pub fn is_auth_required(&self) -> bool {
        matches!(self, Error::AuthRequired)
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        match e.status() {
            Some(status) => Error::Http {
                status: status.as_u16(),
                message: e.to_string(),
            },
            None => Error::Transport(e.to_string()),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::MalformedPlan(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_sentinel() {
        assert!(Error::AuthRequired.is_auth_required());
        assert!(!Error::AuthFailed("bad code".into()).is_auth_required());
        assert!(!Error::Transport("reset".into()).is_auth_required());
    }

    #[test]
    fn test_http_error_shows_message_only() {
        let e = Error::Http {
            status: 500,
            message: "backend exploded".into(),
        };
        assert_eq!(e.to_string(), "backend exploded");
    }
}
