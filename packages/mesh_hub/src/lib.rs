//! Signaling hub: hands out virtual addresses, relays opaque signaling
//! payloads between them, and keeps an optional hostname directory.

pub mod config;
pub mod hub;
pub mod server;

pub use hub::{Hub, Outbound, Session};
