//! In-process peer connections.
//!
//! A [`MemoryNetwork`] links connections created from it once both sides have
//! completed an offer/answer exchange naming each other. The session id of the
//! creating connection travels inside the SDP, so descriptions can be relayed
//! through the real hub unchanged. Channels are unbounded in-memory queues;
//! `buffered_amount` is zero unless a test holds it up with
//! [`MemoryDataChannel::hold_buffered`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use mesh_protocol::{IceCandidate, IceConfiguration, SdpType, SessionDescription};
use tokio::sync::{mpsc, watch};
use tracing::debug;
use uuid::Uuid;

use super::{
    ChannelId, ChannelMessage, ChannelState, ConnectionState, DataChannel, PeerConnection,
    PeerConnectionFactory, PeerEvent, PeerEvents, SignalingState,
};
use crate::error::PlatformError;

const SESSION_ATTRIBUTE: &str = "a=memory-session:";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

fn render_sdp(session: &str, version: u64) -> String {
    format!("v=0\r\no=memory {session} {version} IN IP4 0.0.0.0\r\ns=-\r\n{SESSION_ATTRIBUTE}{session}\r\n")
}

fn parse_session(sdp: &str) -> Option<&str> {
    sdp.lines()
        .find_map(|line| line.trim_end().strip_prefix(SESSION_ATTRIBUTE))
        .filter(|s| !s.is_empty())
}

#[derive(Default)]
struct NetworkInner {
    connections: Mutex<HashMap<String, Weak<MemoryPeerConnection>>>,
    channels: Mutex<HashMap<ChannelId, Weak<MemoryDataChannel>>>,
    /// Serializes linking so two connections never hold each other's state lock.
    linking: Mutex<()>,
    next_channel_id: AtomicU64,
}

/// Registry of in-process peer connections. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections that have not been closed.
    pub fn connection_count(&self) -> usize {
        lock(&self.inner.connections)
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    /// Look up a live channel end by id.
    pub fn data_channel(&self, id: ChannelId) -> Option<Arc<MemoryDataChannel>> {
        lock(&self.inner.channels).get(&id).and_then(Weak::upgrade)
    }

    fn connection(&self, session: &str) -> Option<Arc<MemoryPeerConnection>> {
        lock(&self.inner.connections)
            .get(session)
            .and_then(Weak::upgrade)
    }

    fn new_channel(&self, label: &str) -> Arc<MemoryDataChannel> {
        let id = self.inner.next_channel_id.fetch_add(1, Ordering::Relaxed) + 1;
        let channel = MemoryDataChannel::new(id, label);
        let mut channels = lock(&self.inner.channels);
        channels.retain(|_, w| w.strong_count() > 0);
        channels.insert(id, Arc::downgrade(&channel));
        channel
    }
}

impl PeerConnectionFactory for MemoryNetwork {
    fn create(
        &self,
        _configuration: &IceConfiguration,
    ) -> Result<(Arc<dyn PeerConnection>, PeerEvents), PlatformError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let session = Uuid::new_v4().to_string();
        let connection = Arc::new_cyclic(|me| MemoryPeerConnection {
            session: session.clone(),
            network: self.clone(),
            me: me.clone(),
            events: Mutex::new(Some(events_tx)),
            state: Mutex::new(ConnectionInner::default()),
        });
        lock(&self.inner.connections).insert(session, Arc::downgrade(&connection));
        let connection: Arc<dyn PeerConnection> = connection;
        Ok((connection, events_rx))
    }
}

struct ConnectionInner {
    signaling: SignalingState,
    connection: ConnectionState,
    has_remote_description: bool,
    remote_session: Option<String>,
    remote: Weak<MemoryPeerConnection>,
    sdp_version: u64,
    gathered: bool,
    negotiation_requested: bool,
    pending: Vec<Arc<MemoryDataChannel>>,
    channels: Vec<Weak<MemoryDataChannel>>,
}

impl Default for ConnectionInner {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            connection: ConnectionState::New,
            has_remote_description: false,
            remote_session: None,
            remote: Weak::new(),
            sdp_version: 0,
            gathered: false,
            negotiation_requested: false,
            pending: Vec::new(),
            channels: Vec::new(),
        }
    }
}

pub struct MemoryPeerConnection {
    session: String,
    network: MemoryNetwork,
    me: Weak<MemoryPeerConnection>,
    events: Mutex<Option<mpsc::UnboundedSender<PeerEvent>>>,
    state: Mutex<ConnectionInner>,
}

impl std::fmt::Debug for MemoryPeerConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = lock(&self.state);
        f.debug_struct("MemoryPeerConnection")
            .field("session", &self.session)
            .field("signaling", &state.signaling)
            .field("connection", &state.connection)
            .finish()
    }
}

impl MemoryPeerConnection {
    fn emit(&self, event: PeerEvent) {
        if let Some(tx) = lock(&self.events).as_ref() {
            let _ = tx.send(event);
        }
    }

    fn description(&self, kind: SdpType, state: &mut ConnectionInner) -> SessionDescription {
        state.sdp_version += 1;
        SessionDescription {
            kind,
            sdp: render_sdp(&self.session, state.sdp_version),
        }
    }

    fn check_open(state: &ConnectionInner) -> Result<(), PlatformError> {
        if state.signaling == SignalingState::Closed {
            return Err(PlatformError::Closed);
        }
        Ok(())
    }

    /// Link with the remote connection once both sides are stable and each
    /// holds the other's description.
    fn try_link(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let linking = lock(&self.network.inner.linking);

        let remote_session = {
            let state = lock(&self.state);
            if state.connection == ConnectionState::Connected
                || state.connection.is_terminal()
                || state.signaling != SignalingState::Stable
            {
                return;
            }
            match state.remote_session.clone() {
                Some(s) => s,
                None => return,
            }
        };
        let remote = match self.network.connection(&remote_session) {
            Some(remote) if remote.signaling_state() != SignalingState::Closed => remote,
            _ => {
                drop(linking);
                self.link_failed(&remote_session);
                return;
            }
        };
        {
            let state = lock(&remote.state);
            if state.signaling != SignalingState::Stable
                || state.connection.is_terminal()
                || state.remote_session.as_deref() != Some(self.session.as_str())
            {
                return;
            }
        }

        let local_pending = {
            let mut state = lock(&self.state);
            state.connection = ConnectionState::Connected;
            state.remote = Arc::downgrade(&remote);
            state.negotiation_requested = false;
            std::mem::take(&mut state.pending)
        };
        let remote_pending = {
            let mut state = lock(&remote.state);
            state.connection = ConnectionState::Connected;
            state.remote = Arc::downgrade(&me);
            state.negotiation_requested = false;
            std::mem::take(&mut state.pending)
        };
        debug!(local = %self.session, remote = %remote.session, "memory connection linked");

        self.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        remote.emit(PeerEvent::ConnectionState(ConnectionState::Connected));
        for channel in local_pending {
            open_pair(&channel, &remote);
        }
        for channel in remote_pending {
            open_pair(&channel, &me);
        }
    }

    /// The description we settled on belongs to a connection that is gone.
    fn link_failed(&self, remote_session: &str) {
        {
            let mut state = lock(&self.state);
            if state.signaling == SignalingState::Closed || state.connection.is_terminal() {
                return;
            }
            state.connection = ConnectionState::Failed;
        }
        debug!(local = %self.session, remote = %remote_session, "memory link failed");
        self.emit(PeerEvent::ConnectionState(ConnectionState::Failed));
    }

    fn remote_closed(&self) {
        {
            let mut state = lock(&self.state);
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.connection = ConnectionState::Disconnected;
            state.remote = Weak::new();
        }
        self.emit(PeerEvent::ConnectionState(ConnectionState::Disconnected));
    }
}

/// Create the far end of `local` on `remote` and open both.
fn open_pair(local: &Arc<MemoryDataChannel>, remote: &Arc<MemoryPeerConnection>) {
    if local.ready_state() != ChannelState::Connecting {
        return;
    }
    let far = remote.network.new_channel(&local.label);
    *lock(&local.remote) = Arc::downgrade(&far);
    *lock(&far.remote) = Arc::downgrade(local);
    lock(&remote.state).channels.push(Arc::downgrade(&far));
    far.state.send_replace(ChannelState::Open);
    local.state.send_replace(ChannelState::Open);
    remote.emit(PeerEvent::DataChannel(far));
}

#[async_trait]
impl PeerConnection for MemoryPeerConnection {
    async fn create_offer(&self) -> Result<SessionDescription, PlatformError> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        Ok(self.description(SdpType::Offer, &mut state))
    }

    async fn create_answer(&self) -> Result<SessionDescription, PlatformError> {
        let mut state = lock(&self.state);
        Self::check_open(&state)?;
        if state.signaling != SignalingState::HaveRemoteOffer {
            return Err(PlatformError::InvalidState(format!(
                "cannot answer in {:?}",
                state.signaling
            )));
        }
        Ok(self.description(SdpType::Answer, &mut state))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<(), PlatformError> {
        let first_gather = {
            let mut state = lock(&self.state);
            Self::check_open(&state)?;
            state.signaling = match (desc.kind, state.signaling) {
                (SdpType::Offer, SignalingState::Stable | SignalingState::HaveLocalOffer) => {
                    SignalingState::HaveLocalOffer
                }
                (SdpType::Answer, SignalingState::HaveRemoteOffer) => SignalingState::Stable,
                (kind, current) => {
                    return Err(PlatformError::InvalidState(format!(
                        "cannot apply local {kind:?} in {current:?}"
                    )));
                }
            };
            if state.connection == ConnectionState::New {
                state.connection = ConnectionState::Connecting;
            }
            !std::mem::replace(&mut state.gathered, true)
        };

        if first_gather {
            self.emit(PeerEvent::IceCandidate(Some(IceCandidate {
                candidate: format!(
                    "candidate:1 1 udp 2122260223 memory {} 9 typ host",
                    self.session
                ),
                sdp_mid: Some("0".to_string()),
                sdp_m_line_index: Some(0),
            })));
            self.emit(PeerEvent::IceCandidate(None));
        }
        self.try_link();
        Ok(())
    }

    async fn set_remote_description(
        &self,
        desc: SessionDescription,
    ) -> Result<(), PlatformError> {
        let session = parse_session(&desc.sdp)
            .ok_or_else(|| PlatformError::InvalidState("malformed session description".into()))?
            .to_string();
        {
            let mut state = lock(&self.state);
            Self::check_open(&state)?;
            state.signaling = match (desc.kind, state.signaling) {
                // An offer in have-local-offer rolls back the local offer.
                (
                    SdpType::Offer,
                    SignalingState::Stable
                    | SignalingState::HaveLocalOffer
                    | SignalingState::HaveRemoteOffer,
                ) => SignalingState::HaveRemoteOffer,
                (SdpType::Answer, SignalingState::HaveLocalOffer) => SignalingState::Stable,
                (kind, current) => {
                    return Err(PlatformError::InvalidState(format!(
                        "cannot apply remote {kind:?} in {current:?}"
                    )));
                }
            };
            state.has_remote_description = true;
            state.remote_session = Some(session);
            if state.connection == ConnectionState::New {
                state.connection = ConnectionState::Connecting;
            }
        }
        self.try_link();
        Ok(())
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), PlatformError> {
        let state = lock(&self.state);
        Self::check_open(&state)?;
        if !state.has_remote_description {
            return Err(PlatformError::InvalidState(
                "candidate received before remote description".into(),
            ));
        }
        Ok(())
    }

    fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>, PlatformError> {
        let channel = self.network.new_channel(label);
        let (linked, request_negotiation) = {
            let mut state = lock(&self.state);
            Self::check_open(&state)?;
            state.channels.push(Arc::downgrade(&channel));
            match state.remote.upgrade() {
                Some(remote) if state.connection == ConnectionState::Connected => {
                    (Some(remote), false)
                }
                _ => {
                    state.pending.push(channel.clone());
                    (None, !std::mem::replace(&mut state.negotiation_requested, true))
                }
            }
        };
        if let Some(remote) = linked {
            open_pair(&channel, &remote);
        } else if request_negotiation {
            self.emit(PeerEvent::NegotiationNeeded);
        }
        Ok(channel)
    }

    fn signaling_state(&self) -> SignalingState {
        lock(&self.state).signaling
    }

    fn connection_state(&self) -> ConnectionState {
        lock(&self.state).connection
    }

    fn close(&self) {
        let (channels, remote) = {
            let mut state = lock(&self.state);
            if state.signaling == SignalingState::Closed {
                return;
            }
            state.signaling = SignalingState::Closed;
            state.connection = ConnectionState::Closed;
            state.pending.clear();
            (
                std::mem::take(&mut state.channels),
                std::mem::replace(&mut state.remote, Weak::new()),
            )
        };
        for channel in channels.iter().filter_map(Weak::upgrade) {
            channel.close();
        }
        if let Some(remote) = remote.upgrade() {
            remote.remote_closed();
        }
        let negotiating: Vec<_> = {
            let mut connections = lock(&self.network.inner.connections);
            connections.remove(&self.session);
            connections.values().filter_map(Weak::upgrade).collect()
        };
        // Unlinked connections that settled on our description can never link.
        for other in negotiating {
            let orphaned = {
                let state = lock(&other.state);
                state.connection != ConnectionState::Connected
                    && state.remote_session.as_deref() == Some(self.session.as_str())
            };
            if orphaned {
                other.link_failed(&self.session);
            }
        }
        // Dropping the sender ends the event stream.
        lock(&self.events).take();
    }
}

pub struct MemoryDataChannel {
    id: ChannelId,
    label: String,
    state: watch::Sender<ChannelState>,
    incoming_tx: Mutex<Option<mpsc::UnboundedSender<ChannelMessage>>>,
    incoming_rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelMessage>>>,
    remote: Mutex<Weak<MemoryDataChannel>>,
    held_buffered: AtomicUsize,
}

impl std::fmt::Debug for MemoryDataChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDataChannel")
            .field("id", &self.id)
            .field("label", &self.label)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl MemoryDataChannel {
    fn new(id: ChannelId, label: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            id,
            label: label.to_string(),
            state: watch::Sender::new(ChannelState::Connecting),
            incoming_tx: Mutex::new(Some(tx)),
            incoming_rx: Mutex::new(Some(rx)),
            remote: Mutex::new(Weak::new()),
            held_buffered: AtomicUsize::new(0),
        })
    }

    /// Report `amount` as buffered until called again with zero.
    pub fn hold_buffered(&self, amount: usize) {
        self.held_buffered.store(amount, Ordering::SeqCst);
    }

    /// Deliver a channel error to this end's inbound queue.
    pub fn inject_error(&self, message: &str) {
        self.deliver(ChannelMessage::Error(message.to_string()));
    }

    fn deliver(&self, message: ChannelMessage) {
        if let Some(tx) = lock(&self.incoming_tx).as_ref() {
            let _ = tx.send(message);
        }
    }
}

impl DataChannel for MemoryDataChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn ready_state(&self) -> ChannelState {
        *self.state.borrow()
    }

    fn state_changes(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    fn buffered_amount(&self) -> usize {
        self.held_buffered.load(Ordering::SeqCst)
    }

    fn send(&self, data: Bytes) -> Result<(), PlatformError> {
        if self.ready_state() != ChannelState::Open {
            return Err(PlatformError::InvalidState("channel is not open".into()));
        }
        let remote = lock(&self.remote).upgrade().ok_or(PlatformError::Closed)?;
        remote.deliver(ChannelMessage::Data(data));
        Ok(())
    }

    fn close(&self) {
        let previous = self.state.send_replace(ChannelState::Closed);
        if previous == ChannelState::Closed {
            return;
        }
        lock(&self.incoming_tx).take();
        let remote = std::mem::replace(&mut *lock(&self.remote), Weak::new());
        if let Some(remote) = remote.upgrade() {
            remote.close();
        }
    }

    fn take_incoming(&self) -> Option<mpsc::UnboundedReceiver<ChannelMessage>> {
        lock(&self.incoming_rx).take()
    }
}

impl Drop for MemoryDataChannel {
    fn drop(&mut self) {
        if let Some(remote) = lock(&self.remote).upgrade() {
            remote.close();
        }
    }
}
