//! Errors that cross the protocol boundary.
//!
//! Internal plumbing uses `anyhow`; this enum exists for the cases a client
//! can observe, where the reason string and HTTP status matter.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("session {0} not found")]
    SessionNotFound(String),

    #[error("session {0} is already executing a turn")]
    SessionBusy(String),

    #[error("session {0} has ended")]
    SessionTerminal(String),

    #[error("session {0} is active")]
    SessionActive(String),

    #[error("invalid working directory: {0}")]
    InvalidCwd(String),

    #[error("bundle resolution failed: {0}")]
    BundleResolution(String),

    #[error("session creation timed out")]
    CreateTimeout,

    #[error("runtime fault: {0}")]
    Runtime(String),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::SessionNotFound(_) => 404,
            GatewayError::SessionBusy(_)
            | GatewayError::SessionTerminal(_)
            | GatewayError::SessionActive(_) => 409,
            GatewayError::InvalidCwd(_) | GatewayError::BundleResolution(_) => 400,
            GatewayError::CreateTimeout => 504,
            GatewayError::Runtime(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_and_statuses() {
        let err = GatewayError::SessionNotFound("s1".into());
        assert_eq!(err.to_string(), "session s1 not found");
        assert_eq!(err.status_code(), 404);
        assert_eq!(GatewayError::SessionBusy("s".into()).status_code(), 409);
        assert_eq!(GatewayError::CreateTimeout.status_code(), 504);
    }
}
