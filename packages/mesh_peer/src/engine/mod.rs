//! Negotiation engine: one peer connection per remote address, negotiated
//! with the perfect-negotiation pattern over hub signaling.
//!
//! Incoming signals are handled one at a time by a dispatch task. Description
//! handling, offer creation and teardown run under a single engine-wide
//! negotiation lock, so no two negotiation steps interleave. Local candidates
//! and channel data never wait on it. Remote candidates that arrive before
//! any remote description are held on the record until one is applied.
//! The record table has its own short lock; resolve-or-create is one critical
//! section on it.
//!
//! The node also negotiates with itself: the records keyed `local:0` and
//! `local:1` are two ends of a loopback connection whose signals never leave
//! the process.

mod peer;

pub use peer::PeerRecord;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, Weak};
use std::time::Duration;

use mesh_protocol::address::{is_hub_address, is_loopback, loopback_complement};
use mesh_protocol::{
    HubBinding, IceCandidate, LOCALHOST, LOOPBACK_RECEIVER, LOOPBACK_SENDER, SessionDescription,
    SignalMessage,
};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::error::{Error, PlatformError, Result};
use crate::platform::{
    DataChannel, PeerConnectionFactory, PeerEvent, PeerEvents, SignalingState, wait_open,
};
use crate::signaling::{HubClient, HubEvent, HubEvents};

/// Called for every channel the remote side opens on a listened port.
pub type ChannelHandler = Arc<dyn Fn(Arc<PeerRecord>, Arc<dyn DataChannel>) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Overrides [`EngineConfig::connect_timeout`].
    pub timeout: Option<Duration>,
}

impl ConnectOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
        }
    }
}

/// A signal between the two loopback records, tagged with the loopback
/// generation it was produced in.
struct LoopbackSignal {
    generation: u64,
    from: String,
    message: SignalMessage,
}

struct EngineInner {
    config: EngineConfig,
    factory: Arc<dyn PeerConnectionFactory>,
    hub: HubClient,
    binding: RwLock<HubBinding>,
    peers: Mutex<HashMap<String, Arc<PeerRecord>>>,
    listeners: Mutex<HashMap<String, ChannelHandler>>,
    negotiation: tokio::sync::Mutex<()>,
    loopback: mpsc::UnboundedSender<LoopbackSignal>,
    /// Bumped whenever the loopback pair is recreated.
    loopback_generation: AtomicU64,
    cancel: CancellationToken,
}

/// Handle to a running engine. Cheap to clone.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

impl Engine {
    /// Wait for the hub's binding, create the loopback pair and start
    /// dispatching signals.
    pub async fn start(
        hub: HubClient,
        mut events: HubEvents,
        factory: Arc<dyn PeerConnectionFactory>,
        config: EngineConfig,
    ) -> Result<Self> {
        let binding = timeout(config.bind_timeout, async {
            while let Some(event) = events.recv().await {
                if let HubEvent::Bound(binding) = event {
                    return Some(binding);
                }
            }
            None
        })
        .await
        .map_err(|_| Error::ConnectionTimedOut {
            remote: "hub".into(),
        })?
        .ok_or_else(|| Error::Signaling("hub session ended before binding".into()))?;

        let (loopback_tx, loopback_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let engine = Self {
            inner: Arc::new(EngineInner {
                config,
                factory,
                hub,
                binding: RwLock::new(binding),
                peers: Mutex::new(HashMap::new()),
                listeners: Mutex::new(HashMap::new()),
                negotiation: tokio::sync::Mutex::new(()),
                loopback: loopback_tx,
                loopback_generation: AtomicU64::new(0),
                cancel: cancel.clone(),
            }),
        };
        engine.create_loopback_pair()?;

        tokio::spawn(run_dispatch(
            Arc::downgrade(&engine.inner),
            events,
            loopback_rx,
            cancel,
        ));
        info!(address = %engine.local_address(), "engine started");
        Ok(engine)
    }

    /// Our hub address.
    pub fn local_address(&self) -> String {
        self.binding().address
    }

    pub fn binding(&self) -> HubBinding {
        self.inner
            .binding
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn hub(&self) -> &HubClient {
        &self.inner.hub
    }

    /// The live record for `remote`, if one exists.
    pub fn peer(&self, remote: &str) -> Option<Arc<PeerRecord>> {
        self.peers().get(remote).cloned()
    }

    pub fn peer_addresses(&self) -> Vec<String> {
        let mut addresses: Vec<String> = self.peers().keys().cloned().collect();
        addresses.sort();
        addresses
    }

    /// Claim `hostname` on the hub for this node.
    pub async fn register_hostname(&self, hostname: &str) -> Result<()> {
        self.inner.hub.register(hostname).await
    }

    /// Resolve a hostname through the hub directory.
    pub async fn lookup(&self, hostname: &str) -> Result<Vec<String>> {
        self.inner.hub.lookup(hostname).await
    }

    /// Open a channel labelled `port` to `remote` and wait for it to open.
    ///
    /// `remote` may be a hub address, a loopback id, `localhost`, our own
    /// address, or a hostname registered on the hub.
    pub async fn connect(
        &self,
        remote: &str,
        port: &str,
        options: ConnectOptions,
    ) -> Result<(Arc<PeerRecord>, Arc<dyn DataChannel>)> {
        let address = self.resolve_address(remote).await?;
        let record = self.resolve_or_create(&address)?;
        let channel = record
            .connection()
            .create_data_channel(port)
            .map_err(|e| Error::negotiation(record.local_address(), &address, e))?;
        record.add_channel(channel.clone());

        let limit = options.timeout.unwrap_or(self.inner.config.connect_timeout);
        match timeout(limit, wait_open(channel.as_ref())).await {
            Ok(true) => {
                debug!(remote = %address, port = %port, "channel open");
                Ok((record, channel))
            }
            Ok(false) => Err(Error::SocketClosed),
            Err(_) => {
                channel.close();
                warn!(remote = %address, port = %port, timeout_ms = limit.as_millis() as u64, "connect timed out");
                Err(Error::ConnectionTimedOut { remote: address })
            }
        }
    }

    /// Accept channels labelled `port`.
    pub fn listen(
        &self,
        port: &str,
        handler: impl Fn(Arc<PeerRecord>, Arc<dyn DataChannel>) + Send + Sync + 'static,
    ) -> Result<()> {
        let mut listeners = self.listeners();
        if listeners.contains_key(port) {
            return Err(Error::PortInUse {
                port: port.to_string(),
            });
        }
        listeners.insert(port.to_string(), Arc::new(handler));
        debug!(port = %port, "listening");
        Ok(())
    }

    /// Stop accepting channels on `port`. Returns false if it was not bound.
    pub fn unlisten(&self, port: &str) -> bool {
        self.listeners().remove(port).is_some()
    }

    /// Close the connection to `remote` and tell the remote to do the same.
    /// Terminating a loopback address recreates the loopback pair.
    pub async fn terminate(&self, remote: &str) -> Result<()> {
        let address = self
            .local_alias(remote)
            .unwrap_or_else(|| remote.to_string());
        let _guard = self.inner.negotiation.lock().await;

        if is_loopback(&address) {
            return self.reset_loopback();
        }
        let Some(record) = self.peers().remove(&address) else {
            return Ok(());
        };
        if let Err(e) = self.send_signal(&record, SignalMessage::Terminate) {
            debug!(remote = %address, error = %e, "terminate notice not sent");
        }
        record.shutdown();
        info!(remote = %address, "peer terminated");
        Ok(())
    }

    /// Tear down every record and leave the hub.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        let records: Vec<_> = self.peers().drain().map(|(_, r)| r).collect();
        for record in records {
            record.shutdown();
        }
        self.inner.hub.close();
        info!(address = %self.local_address(), "engine stopped");
    }

    fn peers(&self) -> MutexGuard<'_, HashMap<String, Arc<PeerRecord>>> {
        self.inner.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, ChannelHandler>> {
        self.inner.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// `localhost` and our own address both mean the loopback receiver.
    fn local_alias(&self, remote: &str) -> Option<String> {
        (remote == LOCALHOST || remote == self.local_address())
            .then(|| LOOPBACK_RECEIVER.to_string())
    }

    async fn resolve_address(&self, remote: &str) -> Result<String> {
        if let Some(alias) = self.local_alias(remote) {
            return Ok(alias);
        }
        if is_loopback(remote) || is_hub_address(remote) {
            return Ok(remote.to_string());
        }
        let addresses = self.inner.hub.lookup(remote).await?;
        let address = addresses
            .into_iter()
            .next()
            .ok_or_else(|| Error::HostNotFound(remote.to_string()))?;
        Ok(self.local_alias(&address).unwrap_or(address))
    }

    fn resolve_or_create(&self, remote: &str) -> Result<Arc<PeerRecord>> {
        let mut peers = self.peers();
        if let Some(record) = peers.get(remote) {
            return Ok(record.clone());
        }
        let record = self.create_record(remote)?;
        peers.insert(remote.to_string(), record.clone());
        Ok(record)
    }

    fn create_record(&self, remote: &str) -> Result<Arc<PeerRecord>> {
        let binding = self.binding();
        let local = loopback_complement(remote)
            .map(str::to_string)
            .unwrap_or(binding.address);
        let (connection, events) = self.inner.factory.create(&binding.configuration)?;
        let record = Arc::new(PeerRecord::new(local, remote.to_string(), connection));
        tokio::spawn(run_peer_events(
            Arc::downgrade(&self.inner),
            record.clone(),
            events,
        ));
        debug!(local = %record.local_address(), remote = %remote, polite = record.is_polite(), "peer record created");
        Ok(record)
    }

    fn create_loopback_pair(&self) -> Result<()> {
        let sender = self.create_record(LOOPBACK_SENDER)?;
        let receiver = self.create_record(LOOPBACK_RECEIVER)?;
        let mut peers = self.peers();
        peers.insert(LOOPBACK_SENDER.to_string(), sender);
        peers.insert(LOOPBACK_RECEIVER.to_string(), receiver);
        Ok(())
    }

    /// Caller holds the negotiation lock.
    fn reset_loopback(&self) -> Result<()> {
        self.inner.loopback_generation.fetch_add(1, Ordering::SeqCst);
        let old: Vec<_> = {
            let mut peers = self.peers();
            [LOOPBACK_SENDER, LOOPBACK_RECEIVER]
                .into_iter()
                .filter_map(|address| peers.remove(address))
                .collect()
        };
        for record in old {
            record.shutdown();
        }
        self.create_loopback_pair()?;
        info!("loopback pair recreated");
        Ok(())
    }

    fn send_signal(&self, record: &PeerRecord, message: SignalMessage) -> Result<()> {
        if record.is_loopback() {
            self.inner
                .loopback
                .send(LoopbackSignal {
                    generation: self.inner.loopback_generation.load(Ordering::SeqCst),
                    from: record.local_address().to_string(),
                    message,
                })
                .map_err(|_| Error::Signaling("engine stopped".into()))
        } else {
            self.inner.hub.send_signal(record.remote_address(), &message)
        }
    }

    async fn handle_signal(&self, from: &str, message: SignalMessage) {
        let result = match message {
            SignalMessage::Description { description } => {
                self.on_description(from, description).await
            }
            SignalMessage::Candidate { candidate } => self.on_candidate(from, candidate).await,
            SignalMessage::Terminate => {
                self.on_terminate(from).await;
                Ok(())
            }
        };
        if let Err(e) = result {
            warn!(remote = %from, error = %e, code = e.error_code(), "signal handling failed");
        }
    }

    async fn on_description(&self, from: &str, description: SessionDescription) -> Result<()> {
        let _guard = self.inner.negotiation.lock().await;
        let is_offer = description.is_offer();
        let record = if is_offer {
            self.resolve_or_create(from)?
        } else {
            // An answer is only meaningful to the record that sent the offer.
            let Some(record) = self.peer(from) else {
                debug!(remote = %from, "answer for unknown peer dropped");
                return Ok(());
            };
            record
        };
        let connection = record.connection().clone();
        let negotiation_error =
            |e: PlatformError| Error::negotiation(record.local_address(), from, e);

        let collision = is_offer
            && (record.making_offer() || connection.signaling_state() != SignalingState::Stable);
        let ignore = collision && !record.is_polite();
        record.set_ignore_offer(ignore);
        if ignore {
            debug!(remote = %from, "ignoring colliding offer");
            return Ok(());
        }

        connection
            .set_remote_description(description)
            .await
            .map_err(negotiation_error)?;
        for candidate in record.take_early_candidates() {
            if let Err(e) = connection.add_ice_candidate(candidate).await {
                debug!(remote = %from, error = %e, "early candidate rejected");
            }
        }
        if is_offer {
            let answer = connection.create_answer().await.map_err(negotiation_error)?;
            connection
                .set_local_description(answer.clone())
                .await
                .map_err(negotiation_error)?;
            self.send_signal(
                &record,
                SignalMessage::Description {
                    description: answer,
                },
            )?;
        }
        Ok(())
    }

    async fn on_candidate(&self, from: &str, candidate: Option<IceCandidate>) -> Result<()> {
        let Some(candidate) = candidate else {
            return Ok(());
        };
        let Some(record) = self.peer(from) else {
            debug!(remote = %from, "candidate for unknown peer dropped");
            return Ok(());
        };
        let Some(candidate) = record.defer_candidate(candidate) else {
            debug!(remote = %from, "candidate held until remote description");
            return Ok(());
        };
        match record.connection().add_ice_candidate(candidate).await {
            Ok(()) => Ok(()),
            Err(e) if record.ignore_offer() => {
                debug!(remote = %from, error = %e, "candidate for ignored offer dropped");
                Ok(())
            }
            Err(e) => Err(Error::negotiation(record.local_address(), from, e)),
        }
    }

    async fn on_terminate(&self, from: &str) {
        let _guard = self.inner.negotiation.lock().await;
        if let Some(record) = self.peers().remove(from) {
            record.shutdown();
            info!(remote = %from, "peer terminated by remote");
        }
    }

    async fn on_negotiation_needed(&self, record: &Arc<PeerRecord>) -> Result<()> {
        let _guard = self.inner.negotiation.lock().await;
        if record.is_closed() {
            return Ok(());
        }
        let connection = record.connection();
        if connection.signaling_state() != SignalingState::Stable {
            // An exchange is already in flight; it will carry the new channel.
            return Ok(());
        }

        record.set_making_offer(true);
        let offer = async {
            let offer = connection.create_offer().await?;
            connection.set_local_description(offer.clone()).await?;
            Ok::<_, PlatformError>(offer)
        }
        .await;
        record.set_making_offer(false);

        let offer = offer
            .map_err(|e| Error::negotiation(record.local_address(), record.remote_address(), e))?;
        debug!(remote = %record.remote_address(), "sending offer");
        self.send_signal(record, SignalMessage::Description { description: offer })
    }

    async fn on_local_candidate(&self, record: &Arc<PeerRecord>, candidate: Option<IceCandidate>) {
        if record.is_closed() {
            return;
        }
        if let Err(e) = self.send_signal(record, SignalMessage::Candidate { candidate }) {
            debug!(remote = %record.remote_address(), error = %e, "candidate not sent");
        }
    }

    async fn on_connection_lost(&self, record: &Arc<PeerRecord>) {
        let _guard = self.inner.negotiation.lock().await;
        let live = self
            .peer(record.remote_address())
            .is_some_and(|current| Arc::ptr_eq(&current, record));
        if !live {
            record.shutdown();
            return;
        }
        if record.is_loopback() {
            if let Err(e) = self.reset_loopback() {
                warn!(error = %e, "failed to recreate loopback pair");
            }
            return;
        }
        self.peers().remove(record.remote_address());
        record.shutdown();
        info!(remote = %record.remote_address(), "peer connection lost");
    }

    fn on_incoming_channel(&self, record: &Arc<PeerRecord>, channel: Arc<dyn DataChannel>) {
        let handler = self.listeners().get(channel.label()).cloned();
        match handler {
            Some(handler) if !record.is_closed() => {
                debug!(remote = %record.remote_address(), port = %channel.label(), "incoming channel");
                record.add_channel(channel.clone());
                handler(record.clone(), channel);
            }
            _ => {
                debug!(remote = %record.remote_address(), port = %channel.label(), "no listener, closing channel");
                channel.close();
            }
        }
    }

    async fn on_peer_event(&self, record: &Arc<PeerRecord>, event: PeerEvent) {
        match event {
            PeerEvent::NegotiationNeeded => {
                if let Err(e) = self.on_negotiation_needed(record).await {
                    warn!(remote = %record.remote_address(), error = %e, code = e.error_code(), "negotiation failed");
                }
            }
            PeerEvent::IceCandidate(candidate) => self.on_local_candidate(record, candidate).await,
            PeerEvent::ConnectionState(state) => {
                debug!(remote = %record.remote_address(), state = ?state, "connection state");
                if state.is_terminal() {
                    self.on_connection_lost(record).await;
                }
            }
            PeerEvent::DataChannel(channel) => self.on_incoming_channel(record, channel),
        }
    }

    /// A new binding means a new hub session: every remote peer knew us by
    /// the old address.
    async fn rebind(&self, binding: HubBinding) {
        let _guard = self.inner.negotiation.lock().await;
        let previous = std::mem::replace(
            &mut *self
                .inner
                .binding
                .write()
                .unwrap_or_else(|e| e.into_inner()),
            binding.clone(),
        );
        if previous.address == binding.address {
            return;
        }
        let stale: Vec<_> = {
            let mut peers = self.peers();
            let remote: Vec<String> = peers
                .keys()
                .filter(|address| !is_loopback(address))
                .cloned()
                .collect();
            remote
                .into_iter()
                .filter_map(|address| peers.remove(&address))
                .collect()
        };
        for record in &stale {
            record.shutdown();
        }
        info!(old = %previous.address, new = %binding.address, dropped = stale.len(), "rebound by hub");
    }
}

enum Dispatch {
    Loopback(LoopbackSignal),
    Hub(HubEvent),
}

async fn run_dispatch(
    engine: Weak<EngineInner>,
    mut hub_events: HubEvents,
    mut loopback: mpsc::UnboundedReceiver<LoopbackSignal>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            Some(signal) = loopback.recv() => Dispatch::Loopback(signal),
            event = hub_events.recv() => match event {
                Some(event) => Dispatch::Hub(event),
                None => break,
            },
        };
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let engine = Engine { inner };

        match next {
            Dispatch::Loopback(signal) => {
                if signal.generation != engine.inner.loopback_generation.load(Ordering::SeqCst) {
                    debug!(from = %signal.from, "stale loopback signal dropped");
                    continue;
                }
                engine.handle_signal(&signal.from, signal.message).await;
            }
            Dispatch::Hub(HubEvent::Signal { from, data }) => {
                match SignalMessage::from_value(data) {
                    Ok(message) => engine.handle_signal(&from, message).await,
                    Err(e) => warn!(remote = %from, error = %e, "malformed signal dropped"),
                }
            }
            Dispatch::Hub(HubEvent::Bound(binding)) => engine.rebind(binding).await,
            Dispatch::Hub(HubEvent::Disconnected) => {
                warn!("hub session lost; remote peers unreachable until rebound");
            }
        }
    }
    debug!("engine dispatch stopped");
}

async fn run_peer_events(
    engine: Weak<EngineInner>,
    record: Arc<PeerRecord>,
    mut events: PeerEvents,
) {
    loop {
        let event = tokio::select! {
            _ = record.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(inner) = engine.upgrade() else {
            break;
        };
        Engine { inner }.on_peer_event(&record, event).await;
    }
}
