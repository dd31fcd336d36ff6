//! Client side of the hub protocol.
//!
//! One background task owns the WebSocket. It relays outbound messages, turns
//! hub frames into [`HubEvent`]s and resolves register/lookup replies by
//! request id. On disconnect it reconnects with exponential backoff; every new
//! session starts with a fresh binding.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use mesh_protocol::hub::validate_hostname;
use mesh_protocol::{ClientMessage, HubBinding, ServerMessage, SignalMessage};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::HubClientConfig;
use crate::error::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone)]
pub enum HubEvent {
    /// A (re)connected session was assigned an address.
    Bound(HubBinding),
    /// A signaling payload relayed from `from`.
    Signal {
        from: String,
        data: serde_json::Value,
    },
    /// The hub session ended; a reconnect may follow.
    Disconnected,
}

pub type HubEvents = mpsc::UnboundedReceiver<HubEvent>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// State shared between the handle and the connection task.
struct Shared {
    pending: Mutex<HashMap<String, oneshot::Sender<ServerMessage>>>,
    binding: watch::Sender<Option<HubBinding>>,
}

impl Shared {
    fn dispatch(&self, msg: ServerMessage, events: &mpsc::UnboundedSender<HubEvent>) {
        match msg {
            ServerMessage::Binding {
                address,
                configuration,
            } => {
                info!(address = %address, "bound by hub");
                let binding = HubBinding {
                    address,
                    configuration,
                };
                self.binding.send_replace(Some(binding.clone()));
                let _ = events.send(HubEvent::Bound(binding));
            }
            ServerMessage::Forward { from, data, .. } => {
                let _ = events.send(HubEvent::Signal { from, data });
            }
            reply => {
                let Some(request_id) = request_id(&reply) else {
                    return;
                };
                match lock(&self.pending).remove(request_id) {
                    Some(tx) => {
                        let _ = tx.send(reply);
                    }
                    None => debug!(request_id = %request_id, "reply for unknown request"),
                }
            }
        }
    }

    /// Forget the session: no binding, and outstanding requests fail.
    fn reset(&self) {
        self.binding.send_replace(None);
        lock(&self.pending).clear();
    }
}

fn request_id(msg: &ServerMessage) -> Option<&str> {
    match msg {
        ServerMessage::RegisterOk { request_id, .. }
        | ServerMessage::RegisterFail { request_id, .. }
        | ServerMessage::LookupOk { request_id, .. }
        | ServerMessage::LookupFail { request_id, .. } => Some(request_id),
        ServerMessage::Binding { .. } | ServerMessage::Forward { .. } => None,
    }
}

struct ClientInner {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    request_timeout: Duration,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Handle to a hub session. Cheap to clone; the connection closes when the
/// last clone is dropped.
#[derive(Clone)]
pub struct HubClient {
    inner: Arc<ClientInner>,
}

impl HubClient {
    /// Connect to the hub at `config.url`. The first attempt is made inline so
    /// an unreachable hub fails fast.
    pub async fn connect(config: HubClientConfig) -> Result<(Self, HubEvents)> {
        let (ws, _) = connect_async(config.url.as_str())
            .await
            .map_err(|e| Error::Signaling(format!("{}: {e}", config.url)))?;
        info!(url = %config.url, "connected to hub");

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            pending: Mutex::new(HashMap::new()),
            binding: watch::Sender::new(None),
        });
        let cancel = CancellationToken::new();

        tokio::spawn(run_connection(
            ws,
            config.clone(),
            shared.clone(),
            outbound_rx,
            events_tx,
            cancel.clone(),
        ));

        let client = Self {
            inner: Arc::new(ClientInner {
                outbound: outbound_tx,
                shared,
                cancel,
                request_timeout: config.request_timeout,
            }),
        };
        Ok((client, events_rx))
    }

    /// The current binding, if the session has one.
    pub fn binding(&self) -> Option<HubBinding> {
        self.inner.shared.binding.borrow().clone()
    }

    /// Relay a signaling payload to the node at hub address `to`.
    pub fn send_signal(&self, to: &str, signal: &SignalMessage) -> Result<()> {
        self.send(ClientMessage::Forward {
            from: None,
            to: to.to_string(),
            data: signal.to_value(),
        })
    }

    /// Claim `hostname` for this session.
    pub async fn register(&self, hostname: &str) -> Result<()> {
        validate_hostname(hostname)?;
        let reply = self
            .request(|request_id| ClientMessage::Register {
                request_id,
                hostname: hostname.to_string(),
            })
            .await?;
        match reply {
            ServerMessage::RegisterOk { .. } => Ok(()),
            ServerMessage::RegisterFail { reason, .. } => Err(Error::Rejected(reason)),
            other => Err(Error::Signaling(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Resolve `hostname` to the addresses registered under it.
    pub async fn lookup(&self, hostname: &str) -> Result<Vec<String>> {
        validate_hostname(hostname)?;
        let reply = self
            .request(|request_id| ClientMessage::Lookup {
                request_id,
                hostname: hostname.to_string(),
            })
            .await?;
        match reply {
            ServerMessage::LookupOk { addresses, .. } => Ok(addresses),
            ServerMessage::LookupFail { reason, .. } => Err(Error::Rejected(reason)),
            other => Err(Error::Signaling(format!("unexpected reply: {other:?}"))),
        }
    }

    /// Close the hub session and stop reconnecting.
    pub fn close(&self) {
        self.inner.cancel.cancel();
    }

    fn send(&self, msg: ClientMessage) -> Result<()> {
        self.inner
            .outbound
            .send(msg)
            .map_err(|_| Error::Signaling("hub connection closed".into()))
    }

    async fn request(&self, make: impl FnOnce(String) -> ClientMessage) -> Result<ServerMessage> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        lock(&self.inner.shared.pending).insert(request_id.clone(), tx);

        if let Err(e) = self.send(make(request_id.clone())) {
            lock(&self.inner.shared.pending).remove(&request_id);
            return Err(e);
        }

        match timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(Error::Signaling("hub session ended before reply".into())),
            Err(_) => {
                lock(&self.inner.shared.pending).remove(&request_id);
                Err(Error::ConnectionTimedOut {
                    remote: "hub".into(),
                })
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum PumpExit {
    Disconnected,
    Shutdown,
}

async fn run_connection(
    first: WsStream,
    config: HubClientConfig,
    shared: Arc<Shared>,
    mut outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::UnboundedSender<HubEvent>,
    cancel: CancellationToken,
) {
    let mut ws = Some(first);
    while let Some(stream) = ws.take() {
        let exit = pump(stream, &shared, &mut outbound, &events, &cancel).await;
        shared.reset();
        if exit == PumpExit::Shutdown {
            break;
        }
        info!(url = %config.url, "hub connection lost");
        let _ = events.send(HubEvent::Disconnected);

        if config.reconnect && !cancel.is_cancelled() {
            ws = reconnect(&config, &mut outbound, &cancel).await;
        }
    }
    debug!(url = %config.url, "hub client stopped");
}

async fn reconnect(
    config: &HubClientConfig,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    cancel: &CancellationToken,
) -> Option<WsStream> {
    let mut attempt = 0u32;
    loop {
        let delay = Duration::from_secs(1 << attempt.min(6)).min(config.max_backoff);
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        attempt += 1;
        info!(url = %config.url, attempt = attempt, "hub reconnection attempt");
        match connect_async(config.url.as_str()).await {
            Ok((ws, _)) => {
                // Anything queued while offline was addressed under the old binding.
                while outbound.try_recv().is_ok() {}
                info!(url = %config.url, "reconnected to hub");
                return Some(ws);
            }
            Err(e) => {
                warn!(url = %config.url, attempt = attempt, error = %e, "hub reconnect failed");
                if config.max_reconnect_attempts != 0 && attempt >= config.max_reconnect_attempts {
                    return None;
                }
            }
        }
    }
}

async fn pump(
    ws: WsStream,
    shared: &Shared,
    outbound: &mut mpsc::UnboundedReceiver<ClientMessage>,
    events: &mpsc::UnboundedSender<HubEvent>,
    cancel: &CancellationToken,
) -> PumpExit {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return PumpExit::Shutdown;
            }
            out = outbound.recv() => {
                let Some(msg) = out else {
                    let _ = sink.close().await;
                    return PumpExit::Shutdown;
                };
                let text = match msg.to_text() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!(error = %e, "failed to serialize hub message");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    return PumpExit::Disconnected;
                }
            }
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => match ServerMessage::parse(text.as_str()) {
                    Ok(msg) => shared.dispatch(msg, events),
                    Err(e) => warn!(error = %e, "ignoring malformed hub message"),
                },
                Some(Ok(Message::Ping(payload))) => {
                    if sink.send(Message::Pong(payload)).await.is_err() {
                        return PumpExit::Disconnected;
                    }
                }
                Some(Ok(Message::Close(_))) | None => return PumpExit::Disconnected,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "hub socket error");
                    return PumpExit::Disconnected;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::start_hub;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn next_event(events: &mut HubEvents) -> HubEvent {
        timeout(TEST_TIMEOUT, events.recv())
            .await
            .expect("timed out waiting for hub event")
            .expect("hub events ended")
    }

    async fn bound(config: HubClientConfig) -> (HubClient, HubEvents, String) {
        let (client, mut events) = HubClient::connect(config).await.unwrap();
        match next_event(&mut events).await {
            HubEvent::Bound(binding) => {
                let address = binding.address.clone();
                assert_eq!(client.binding(), Some(binding));
                (client, events, address)
            }
            other => panic!("expected binding, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn signals_are_relayed_with_sender_address() {
        let hub = start_hub().await;
        let (a, _a_events, a_addr) = bound(hub.client_config()).await;
        let (_b, mut b_events, b_addr) = bound(hub.client_config()).await;

        a.send_signal(&b_addr, &SignalMessage::Terminate).unwrap();
        match next_event(&mut b_events).await {
            HubEvent::Signal { from, data } => {
                assert_eq!(from, a_addr);
                assert_eq!(
                    SignalMessage::from_value(data).unwrap(),
                    SignalMessage::Terminate
                );
            }
            other => panic!("expected signal, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn register_then_lookup() {
        let hub = start_hub().await;
        let (a, _a_events, a_addr) = bound(hub.client_config()).await;
        let (b, _b_events, _) = bound(hub.client_config()).await;

        a.register("printer").await.unwrap();
        assert_eq!(b.lookup("printer").await.unwrap(), vec![a_addr]);
        assert!(b.lookup("scanner").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn invalid_hostname_fails_locally() {
        let hub = start_hub().await;
        let (a, _a_events, _) = bound(hub.client_config()).await;
        let err = a.register("").await.unwrap_err();
        assert_eq!(err.error_code(), "invalid_hostname");
    }

    #[tokio::test]
    async fn unreachable_hub_fails_fast() {
        let config = HubClientConfig {
            url: "ws://127.0.0.1:1/".into(),
            ..Default::default()
        };
        let err = HubClient::connect(config).await.err().unwrap();
        assert_eq!(err.error_code(), "signaling_unavailable");
    }

    #[tokio::test]
    async fn hub_shutdown_reports_disconnect() {
        let hub = start_hub().await;
        let config = HubClientConfig {
            reconnect: false,
            ..hub.client_config()
        };
        let (client, mut events, _) = bound(config).await;

        hub.drop_sessions();
        assert!(matches!(next_event(&mut events).await, HubEvent::Disconnected));
        assert!(client.binding().is_none());
    }
}
