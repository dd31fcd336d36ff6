//! Peer side of the mesh.
//!
//! A node connects to the signaling hub, negotiates one peer connection per
//! remote address and multiplexes named ports over data channels:
//!
//! - [`signaling`]: hub session, reconnect, hostname directory
//! - [`engine`]: perfect negotiation, loopback pair, listeners
//! - [`socket`]: congestion-aware byte stream over one channel
//! - [`duplex`]: pull-based framed streams over a socket
//! - [`mux`]: dial/bind API for applications
//! - [`platform`]: the peer-connection primitive, plus an in-memory one

pub mod config;
pub mod duplex;
pub mod engine;
pub mod error;
pub mod mux;
pub mod platform;
pub mod signaling;
pub mod socket;

#[cfg(test)]
mod testing;

pub use config::PeerConfig;
pub use duplex::{DuplexReader, DuplexWriter, duplex};
pub use engine::{ConnectOptions, Engine, PeerRecord};
pub use error::{Error, PlatformError, Result};
pub use mux::{PortListener, PortMux};
pub use signaling::{HubClient, HubEvent};
pub use socket::Socket;
