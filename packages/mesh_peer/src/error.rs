//! Error types and stable error codes for the peer side.

use mesh_protocol::ProtocolError;

/// Failure reported by the platform peer-connection primitive.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlatformError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("connection closed")]
    Closed,

    #[error("{0}")]
    Other(String),
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("port {port:?} is already in use")]
    PortInUse { port: String },

    #[error("connection to {remote} timed out")]
    ConnectionTimedOut { remote: String },

    #[error("socket closed")]
    SocketClosed,

    #[error("negotiation between {local} and {remote} failed: {source}")]
    Negotiation {
        local: String,
        remote: String,
        #[source]
        source: PlatformError,
    },

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("signaling unavailable: {0}")]
    Signaling(String),

    #[error("hub rejected request: {0}")]
    Rejected(String),

    #[error("host {0:?} not found")]
    HostNotFound(String),

    #[error("channel error: {0}")]
    Channel(String),

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("stream cancelled by peer")]
    Cancelled,

    #[error("remote error: {0}")]
    Remote(String),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

impl Error {
    pub fn error_code(&self) -> &str {
        match self {
            Self::PortInUse { .. } => "port_in_use",
            Self::ConnectionTimedOut { .. } => "connection_timed_out",
            Self::SocketClosed => "socket_closed",
            Self::Negotiation { .. } => "negotiation_error",
            Self::Platform(_) => "platform_error",
            Self::Signaling(_) => "signaling_unavailable",
            Self::Rejected(_) => "rejected",
            Self::HostNotFound(_) => "host_not_found",
            Self::Channel(_) => "channel_error",
            Self::MalformedFrame(_) => "malformed_frame",
            Self::Cancelled => "cancelled",
            Self::Remote(_) => "remote_error",
            Self::Protocol(e) => e.error_code(),
        }
    }

    pub(crate) fn negotiation(local: &str, remote: &str, source: PlatformError) -> Self {
        Self::Negotiation {
            local: local.to_string(),
            remote: remote.to_string(),
            source,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
