use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use mesh_protocol::address::{display_address, is_loopback};
use mesh_protocol::{IceCandidate, is_polite};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::platform::{ChannelId, ChannelState, DataChannel, PeerConnection};

/// Negotiation state and open channels for one remote address.
pub struct PeerRecord {
    local: String,
    remote: String,
    connection: Arc<dyn PeerConnection>,
    channels: Mutex<HashMap<ChannelId, Arc<dyn DataChannel>>>,
    making_offer: AtomicBool,
    ignore_offer: AtomicBool,
    /// Remote candidates that arrived before any remote description.
    early_candidates: Mutex<Option<Vec<IceCandidate>>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("channels", &self.channel_count())
            .finish()
    }
}

impl PeerRecord {
    pub(crate) fn new(local: String, remote: String, connection: Arc<dyn PeerConnection>) -> Self {
        Self {
            local,
            remote,
            connection,
            channels: Mutex::new(HashMap::new()),
            making_offer: AtomicBool::new(false),
            ignore_offer: AtomicBool::new(false),
            early_candidates: Mutex::new(Some(Vec::new())),
            cancel: CancellationToken::new(),
        }
    }

    /// Our address as the remote knows it: a hub address or a loopback id.
    pub fn local_address(&self) -> &str {
        &self.local
    }

    pub fn remote_address(&self) -> &str {
        &self.remote
    }

    /// Remote address with loopback ids rendered as `localhost`.
    pub fn display_remote(&self) -> &str {
        display_address(&self.remote)
    }

    pub fn display_local(&self) -> &str {
        display_address(&self.local)
    }

    pub fn is_loopback(&self) -> bool {
        is_loopback(&self.remote)
    }

    pub fn is_polite(&self) -> bool {
        is_polite(&self.local, &self.remote)
    }

    pub fn connection(&self) -> &Arc<dyn PeerConnection> {
        &self.connection
    }

    pub fn channel_count(&self) -> usize {
        self.channels().len()
    }

    /// Channels on this connection that are currently open.
    pub fn open_channel_count(&self) -> usize {
        self.channels()
            .values()
            .filter(|c| c.ready_state() == ChannelState::Open)
            .count()
    }

    /// Total bytes buffered across every channel of the connection.
    pub fn buffered_amount(&self) -> usize {
        self.channels().values().map(|c| c.buffered_amount()).sum()
    }

    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub(crate) fn making_offer(&self) -> bool {
        self.making_offer.load(Ordering::SeqCst)
    }

    pub(crate) fn set_making_offer(&self, value: bool) {
        self.making_offer.store(value, Ordering::SeqCst);
    }

    pub(crate) fn ignore_offer(&self) -> bool {
        self.ignore_offer.load(Ordering::SeqCst)
    }

    pub(crate) fn set_ignore_offer(&self, value: bool) {
        self.ignore_offer.store(value, Ordering::SeqCst);
    }

    /// Hold `candidate` back if no remote description has been applied yet.
    /// Returns it when it can be added right away.
    pub(crate) fn defer_candidate(&self, candidate: IceCandidate) -> Option<IceCandidate> {
        match self.early().as_mut() {
            Some(pending) => {
                pending.push(candidate);
                None
            }
            None => Some(candidate),
        }
    }

    /// Mark the remote description as applied and take the held candidates.
    pub(crate) fn take_early_candidates(&self) -> Vec<IceCandidate> {
        self.early().take().unwrap_or_default()
    }

    pub(crate) fn cancelled(&self) -> tokio_util::sync::WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    /// Track `channel` until it closes.
    pub(crate) fn add_channel(self: &Arc<Self>, channel: Arc<dyn DataChannel>) {
        let id = channel.id();
        let mut state = channel.state_changes();
        self.channels().insert(id, channel);

        let record: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let _ = state.wait_for(|s| *s == ChannelState::Closed).await;
            if let Some(record) = record.upgrade() {
                record.channels().remove(&id);
            }
        });
    }

    /// Close every channel and the connection. Idempotent.
    pub(crate) fn shutdown(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let channels: Vec<_> = self.channels().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close();
        }
        self.connection.close();
        debug!(local = %self.local, remote = %self.remote, "peer record closed");
    }

    fn early(&self) -> MutexGuard<'_, Option<Vec<IceCandidate>>> {
        self.early_candidates.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn channels(&self) -> MutexGuard<'_, HashMap<ChannelId, Arc<dyn DataChannel>>> {
        self.channels.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::platform::PeerConnectionFactory;
    use crate::platform::memory::MemoryNetwork;
    use mesh_protocol::IceConfiguration;

    fn record(local: &str, remote: &str) -> Arc<PeerRecord> {
        let (pc, _events) = MemoryNetwork::new()
            .create(&IceConfiguration::default())
            .unwrap();
        Arc::new(PeerRecord::new(local.into(), remote.into(), pc))
    }

    #[tokio::test]
    async fn politeness_follows_address_order() {
        assert!(record("0.0.0.1", "0.0.0.2").is_polite());
        assert!(!record("0.0.0.2", "0.0.0.1").is_polite());
        assert!(record("local:0", "local:1").is_polite());
    }

    #[tokio::test]
    async fn loopback_addresses_display_as_localhost() {
        let r = record("local:1", "local:0");
        assert!(r.is_loopback());
        assert_eq!(r.display_remote(), "localhost");
        assert_eq!(r.display_local(), "localhost");
        assert_eq!(r.remote_address(), "local:0");
    }

    #[tokio::test]
    async fn closed_channels_leave_the_set() {
        let r = record("0.0.0.1", "0.0.0.2");
        let channel = r.connection().create_data_channel("echo").unwrap();
        r.add_channel(channel.clone());
        assert_eq!(r.channel_count(), 1);
        assert_eq!(r.open_channel_count(), 0);

        channel.close();
        tokio::time::timeout(std::time::Duration::from_secs(2), async {
            while r.channel_count() != 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let r = record("0.0.0.1", "0.0.0.2");
        let channel = r.connection().create_data_channel("echo").unwrap();
        r.add_channel(channel.clone());
        r.shutdown();
        r.shutdown();
        assert!(r.is_closed());
        assert_eq!(channel.ready_state(), ChannelState::Closed);
        assert!(r.connection().create_data_channel("again").is_err());
    }

    #[tokio::test]
    async fn candidates_wait_for_remote_description() {
        let r = record("0.0.0.1", "0.0.0.2");
        let candidate = |n: u32| IceCandidate {
            candidate: format!("candidate:{n}"),
            sdp_mid: None,
            sdp_m_line_index: None,
        };
        assert!(r.defer_candidate(candidate(1)).is_none());
        assert!(r.defer_candidate(candidate(2)).is_none());
        assert_eq!(r.take_early_candidates(), vec![candidate(1), candidate(2)]);
        assert_eq!(r.defer_candidate(candidate(3)), Some(candidate(3)));
        assert!(r.take_early_candidates().is_empty());
    }
}
