//! Wire types shared by the mesh signaling hub and its peers.

pub mod address;
pub mod error;
pub mod hub;
pub mod signal;

pub use address::{LOCALHOST, LOOPBACK_RECEIVER, LOOPBACK_SENDER, is_polite, render_address};
pub use error::ProtocolError;
pub use hub::{ClientMessage, HubBinding, IceConfiguration, IceServer, ServerMessage};
pub use signal::{IceCandidate, SdpType, SessionDescription, SignalMessage};
