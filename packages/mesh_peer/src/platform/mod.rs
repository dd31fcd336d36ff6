//! Platform collaborator: the peer-connection and data-channel primitives the
//! engine drives.
//!
//! The shapes follow the browser primitives. Events are delivered through a
//! channel handed out when the connection is created instead of callback
//! registration, so each consumer owns exactly one event stream.
//!
//! [`memory`] provides an in-process implementation.

pub mod memory;

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use mesh_protocol::{IceCandidate, IceConfiguration, SessionDescription};
use tokio::sync::{mpsc, watch};

use crate::error::PlatformError;

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the connection will not carry traffic again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed | Self::Closed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One inbound item on a data channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    Data(Bytes),
    Error(String),
}

#[derive(Debug)]
pub enum PeerEvent {
    NegotiationNeeded,
    /// `None` is the end-of-gathering marker.
    IceCandidate(Option<IceCandidate>),
    ConnectionState(ConnectionState),
    /// A channel opened by the remote side.
    DataChannel(Arc<dyn DataChannel>),
}

pub type PeerEvents = mpsc::UnboundedReceiver<PeerEvent>;

#[async_trait]
pub trait PeerConnection: Send + Sync + Debug {
    async fn create_offer(&self) -> Result<SessionDescription, PlatformError>;

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PlatformError>;

    async fn set_remote_description(&self, desc: SessionDescription)
    -> Result<(), PlatformError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), PlatformError>;

    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PlatformError>;

    fn signaling_state(&self) -> SignalingState;

    fn connection_state(&self) -> ConnectionState;

    fn close(&self);
}

/// A reliable, ordered message channel.
pub trait DataChannel: Send + Sync + Debug {
    fn id(&self) -> ChannelId;

    fn label(&self) -> &str;

    fn ready_state(&self) -> ChannelState;

    /// Watch ready-state transitions.
    fn state_changes(&self) -> watch::Receiver<ChannelState>;

    /// Bytes queued for sending but not yet handed to the network.
    fn buffered_amount(&self) -> usize;

    fn send(&self, data: Bytes) -> Result<(), PlatformError>;

    fn close(&self);

    /// The inbound queue. Available once; it ends after the channel closes.
    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>>;
}

pub trait PeerConnectionFactory: Send + Sync {
    fn create(
        &self,
        configuration: &IceConfiguration,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PlatformError>;
}

/// Wait until `channel` leaves the connecting state. True if it opened.
pub async fn wait_open(channel: &dyn DataChannel) -> bool {
    let mut state = channel.state_changes();
    match state
        .wait_for(|s| *s != ChannelState::Connecting)
        .await
    {
        Ok(s) => *s == ChannelState::Open,
        Err(_) => false,
    }
}
