//! Protocol-level errors and their stable error codes.

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("hostname {hostname:?} is already registered")]
    AlreadyRegistered { hostname: String },

    #[error("invalid hostname: {0:?}")]
    InvalidHostname(String),
}

impl ProtocolError {
    pub fn error_code(&self) -> &str {
        match self {
            Self::ProtocolViolation(_) => "protocol_violation",
            Self::AlreadyRegistered { .. } => "already_registered",
            Self::InvalidHostname(_) => "invalid_hostname",
        }
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        Self::ProtocolViolation(err.to_string())
    }
}
