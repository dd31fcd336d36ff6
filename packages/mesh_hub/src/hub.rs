//! Hub core: address allocation, signal relay and the hostname directory.
//!
//! Transport-agnostic. A transport calls [`Hub::attach`] once per connection,
//! feeds every inbound text frame to [`Hub::handle_text`], drains the session's
//! outbound queue, and calls [`Hub::detach`] when the connection ends.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use mesh_protocol::hub::validate_hostname;
use mesh_protocol::{ClientMessage, IceConfiguration, ProtocolError, ServerMessage, render_address};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What a transport should push down its connection next.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Message(ServerMessage),
    Ping,
    /// The hub has dropped this session; close the connection.
    Close,
}

/// Handle returned by [`Hub::attach`].
#[derive(Debug)]
pub struct Session {
    pub address: String,
    pub outbound: mpsc::UnboundedReceiver<Outbound>,
}

struct SessionEntry {
    tx: mpsc::UnboundedSender<Outbound>,
    /// Set when a ping goes out, cleared by the pong.
    awaiting_pong: bool,
    hostname: Option<String>,
}

struct Directory {
    /// Last counter handed out; addresses are never reused.
    counter: u64,
    sessions: HashMap<String, SessionEntry>,
    hostnames: HashMap<String, String>,
}

pub struct Hub {
    configuration: IceConfiguration,
    directory: Mutex<Directory>,
}

impl Hub {
    pub fn new(configuration: IceConfiguration) -> Self {
        Self {
            configuration,
            directory: Mutex::new(Directory {
                counter: 0,
                sessions: HashMap::new(),
                hostnames: HashMap::new(),
            }),
        }
    }

    fn directory(&self) -> MutexGuard<'_, Directory> {
        // Critical sections never panic midway; recover the data if one did.
        self.directory.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a new connection and queue its `binding`.
    pub fn attach(&self) -> Session {
        let (tx, outbound) = mpsc::unbounded_channel();
        let mut dir = self.directory();
        dir.counter += 1;
        let address = render_address(dir.counter);

        let _ = tx.send(Outbound::Message(ServerMessage::Binding {
            address: address.clone(),
            configuration: self.configuration.clone(),
        }));
        dir.sessions.insert(
            address.clone(),
            SessionEntry {
                tx,
                awaiting_pong: false,
                hostname: None,
            },
        );
        info!(address = %address, sessions = dir.sessions.len(), "session attached");

        Session { address, outbound }
    }

    /// Forget a session and release its hostname. Idempotent.
    pub fn detach(&self, address: &str) {
        let mut dir = self.directory();
        if let Some(entry) = dir.sessions.remove(address) {
            if let Some(hostname) = entry.hostname {
                dir.hostnames.remove(&hostname);
            }
            info!(address = %address, sessions = dir.sessions.len(), "session detached");
        }
    }

    /// Handle one inbound frame from `from`.
    ///
    /// An error means the frame was not a known message; the caller must close
    /// the connection and detach the session.
    pub fn handle_text(&self, from: &str, text: &str) -> Result<(), ProtocolError> {
        let msg = ClientMessage::parse(text).inspect_err(|e| {
            warn!(address = %from, error = %e, "dropping session after malformed message");
        })?;
        self.handle_message(from, msg);
        Ok(())
    }

    pub fn handle_message(&self, from: &str, msg: ClientMessage) {
        match msg {
            ClientMessage::Forward { to, data, .. } => self.forward(from, &to, data),
            ClientMessage::Register {
                request_id,
                hostname,
            } => {
                let reply = match self.register(from, &hostname) {
                    Ok(()) => ServerMessage::RegisterOk {
                        request_id,
                        hostname,
                    },
                    Err(e) => ServerMessage::RegisterFail {
                        request_id,
                        reason: e.to_string(),
                    },
                };
                self.send_to(from, reply);
            }
            ClientMessage::Lookup {
                request_id,
                hostname,
            } => {
                let reply = match self.lookup(&hostname) {
                    Ok(addresses) => ServerMessage::LookupOk {
                        request_id,
                        hostname,
                        addresses,
                    },
                    Err(e) => ServerMessage::LookupFail {
                        request_id,
                        reason: e.to_string(),
                    },
                };
                self.send_to(from, reply);
            }
        }
    }

    /// Relay `data` to `to`, stamped with `from`. At most once: unknown
    /// destinations drop the message.
    pub fn forward(&self, from: &str, to: &str, data: serde_json::Value) {
        let dir = self.directory();
        match dir.sessions.get(to) {
            Some(entry) => {
                let _ = entry.tx.send(Outbound::Message(ServerMessage::Forward {
                    from: from.to_string(),
                    to: to.to_string(),
                    data,
                }));
            }
            None => debug!(from = %from, to = %to, "forward target not connected, dropped"),
        }
    }

    /// Bind `hostname` to `owner`, replacing any hostname `owner` held before.
    pub fn register(&self, owner: &str, hostname: &str) -> Result<(), ProtocolError> {
        validate_hostname(hostname)?;
        let mut dir = self.directory();
        if let Some(current) = dir.hostnames.get(hostname) {
            if current != owner {
                return Err(ProtocolError::AlreadyRegistered {
                    hostname: hostname.to_string(),
                });
            }
        }
        let Some(entry) = dir.sessions.get_mut(owner) else {
            return Err(ProtocolError::ProtocolViolation(format!(
                "register from unknown session {owner}"
            )));
        };
        let previous = entry.hostname.replace(hostname.to_string());
        if let Some(previous) = previous.filter(|p| p != hostname) {
            dir.hostnames.remove(&previous);
        }
        dir.hostnames
            .insert(hostname.to_string(), owner.to_string());
        info!(address = %owner, hostname = %hostname, "hostname registered");
        Ok(())
    }

    /// Resolve a hostname. A connected address resolves to itself; unknown
    /// names resolve to nothing.
    pub fn lookup(&self, hostname: &str) -> Result<Vec<String>, ProtocolError> {
        validate_hostname(hostname)?;
        let dir = self.directory();
        if let Some(address) = dir.hostnames.get(hostname) {
            return Ok(vec![address.clone()]);
        }
        if dir.sessions.contains_key(hostname) {
            return Ok(vec![hostname.to_string()]);
        }
        Ok(Vec::new())
    }

    pub fn pong(&self, address: &str) {
        if let Some(entry) = self.directory().sessions.get_mut(address) {
            entry.awaiting_pong = false;
        }
    }

    /// One keepalive round: close sessions that never answered the previous
    /// ping, ping the rest. Returns the addresses that were dropped.
    pub fn keepalive_sweep(&self) -> Vec<String> {
        let mut dir = self.directory();
        let dead: Vec<String> = dir
            .sessions
            .iter()
            .filter(|(_, entry)| entry.awaiting_pong || entry.tx.is_closed())
            .map(|(address, _)| address.clone())
            .collect();

        for address in &dead {
            if let Some(entry) = dir.sessions.remove(address) {
                let _ = entry.tx.send(Outbound::Close);
                if let Some(hostname) = entry.hostname {
                    dir.hostnames.remove(&hostname);
                }
                warn!(address = %address, "session missed keepalive, dropped");
            }
        }

        for entry in dir.sessions.values_mut() {
            entry.awaiting_pong = true;
            let _ = entry.tx.send(Outbound::Ping);
        }
        dead
    }

    /// Run [`Hub::keepalive_sweep`] every `interval` until cancelled.
    pub fn spawn_keepalive(
        self: &Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let hub = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        hub.keepalive_sweep();
                    }
                }
            }
        })
    }

    /// Drop every session, asking each transport to close its connection.
    pub fn close_all(&self) {
        let mut dir = self.directory();
        for (_, entry) in dir.sessions.drain() {
            let _ = entry.tx.send(Outbound::Close);
        }
        dir.hostnames.clear();
        info!("all sessions closed");
    }

    pub fn session_count(&self) -> usize {
        self.directory().sessions.len()
    }

    pub fn hostname_count(&self) -> usize {
        self.directory().hostnames.len()
    }

    fn send_to(&self, address: &str, msg: ServerMessage) {
        if let Some(entry) = self.directory().sessions.get(address) {
            let _ = entry.tx.send(Outbound::Message(msg));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn hub() -> Hub {
        Hub::new(IceConfiguration::default())
    }

    fn next_message(session: &mut Session) -> ServerMessage {
        match session.outbound.try_recv() {
            Ok(Outbound::Message(msg)) => msg,
            other => panic!("expected message, got {other:?}"),
        }
    }

    fn attach_bound(hub: &Hub) -> Session {
        let mut session = hub.attach();
        assert!(matches!(
            next_message(&mut session),
            ServerMessage::Binding { .. }
        ));
        session
    }

    #[test]
    fn binding_is_first_message() {
        let hub = hub();
        let mut s = hub.attach();
        assert_eq!(
            next_message(&mut s),
            ServerMessage::Binding {
                address: "0.0.0.1".into(),
                configuration: IceConfiguration::default(),
            }
        );
    }

    #[test]
    fn sequential_sessions_get_distinct_addresses() {
        let hub = hub();
        let addresses: Vec<String> = (0..300).map(|_| hub.attach().address).collect();
        let unique: std::collections::HashSet<_> = addresses.iter().collect();
        assert_eq!(unique.len(), 300);
        assert_eq!(addresses[0], "0.0.0.1");
        assert_eq!(addresses[255], "0.0.1.0");
    }

    #[test]
    fn addresses_are_not_reused_after_detach() {
        let hub = hub();
        let a = hub.attach();
        hub.detach(&a.address);
        let b = hub.attach();
        assert_ne!(a.address, b.address);
    }

    #[test]
    fn forward_stamps_sender() {
        let hub = hub();
        let a = attach_bound(&hub);
        let mut b = attach_bound(&hub);

        hub.handle_text(
            &a.address,
            r#"{"type":"forward","from":"9.9.9.9","to":"0.0.0.2","data":{"x":1}}"#,
        )
        .unwrap();

        assert_eq!(
            next_message(&mut b),
            ServerMessage::Forward {
                from: "0.0.0.1".into(),
                to: "0.0.0.2".into(),
                data: json!({"x": 1}),
            }
        );
    }

    #[test]
    fn forward_to_unknown_is_dropped() {
        let hub = hub();
        let mut a = attach_bound(&hub);
        hub.forward(&a.address, "0.0.0.99", json!(null));
        assert!(a.outbound.try_recv().is_err());
    }

    #[test]
    fn malformed_message_is_violation() {
        let hub = hub();
        let a = attach_bound(&hub);
        let err = hub.handle_text(&a.address, r#"{"type":"teleport"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::ProtocolViolation(_)));
    }

    #[test]
    fn taken_hostname_fails_for_other_address() {
        let hub = hub();
        let mut a = attach_bound(&hub);
        let mut b = attach_bound(&hub);

        hub.handle_message(
            &a.address,
            ClientMessage::Register {
                request_id: "1".into(),
                hostname: "printer".into(),
            },
        );
        assert!(matches!(
            next_message(&mut a),
            ServerMessage::RegisterOk { .. }
        ));

        hub.handle_message(
            &b.address,
            ClientMessage::Register {
                request_id: "2".into(),
                hostname: "printer".into(),
            },
        );
        match next_message(&mut b) {
            ServerMessage::RegisterFail { request_id, reason } => {
                assert_eq!(request_id, "2");
                assert!(reason.contains("already registered"));
            }
            other => panic!("expected RegisterFail, got {other:?}"),
        }
    }

    #[test]
    fn reregistering_replaces_previous_hostname() {
        let hub = hub();
        let a = attach_bound(&hub);
        let b = attach_bound(&hub);

        hub.register(&a.address, "alpha").unwrap();
        hub.register(&a.address, "beta").unwrap();
        assert_eq!(hub.hostname_count(), 1);
        assert_eq!(hub.lookup("beta").unwrap(), vec![a.address.clone()]);
        assert!(hub.lookup("alpha").unwrap().is_empty());

        // The released name is free for someone else.
        hub.register(&b.address, "alpha").unwrap();
        // Same owner, same name: a no-op success.
        hub.register(&a.address, "beta").unwrap();
        assert_eq!(hub.hostname_count(), 2);
    }

    #[test]
    fn lookup_falls_back_to_connected_address() {
        let hub = hub();
        let a = attach_bound(&hub);
        assert_eq!(hub.lookup(&a.address).unwrap(), vec![a.address.clone()]);
        assert!(hub.lookup("0.0.0.42").unwrap().is_empty());
        assert!(hub.lookup("").is_err());
    }

    #[test]
    fn detach_releases_hostname() {
        let hub = hub();
        let a = attach_bound(&hub);
        hub.register(&a.address, "printer").unwrap();
        hub.detach(&a.address);
        assert!(hub.lookup("printer").unwrap().is_empty());
        assert_eq!(hub.session_count(), 0);
    }

    #[test]
    fn keepalive_drops_silent_sessions() {
        let hub = hub();
        let mut a = attach_bound(&hub);
        let mut b = attach_bound(&hub);

        assert!(hub.keepalive_sweep().is_empty());
        assert_eq!(a.outbound.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(b.outbound.try_recv().unwrap(), Outbound::Ping);

        hub.pong(&a.address);
        let dropped = hub.keepalive_sweep();
        assert_eq!(dropped, vec![b.address.clone()]);
        assert_eq!(b.outbound.try_recv().unwrap(), Outbound::Close);
        assert_eq!(a.outbound.try_recv().unwrap(), Outbound::Ping);
        assert_eq!(hub.session_count(), 1);
    }

    #[test]
    fn close_all_closes_every_session() {
        let hub = hub();
        let mut a = attach_bound(&hub);
        hub.register(&a.address, "printer").unwrap();

        hub.close_all();
        assert_eq!(a.outbound.try_recv().unwrap(), Outbound::Close);
        assert_eq!(hub.session_count(), 0);
        assert_eq!(hub.hostname_count(), 0);
    }

    #[tokio::test]
    async fn keepalive_task_pings_on_interval() {
        let hub = Arc::new(hub());
        let mut a = attach_bound(&hub);
        let cancel = CancellationToken::new();
        let task = hub.spawn_keepalive(Duration::from_millis(20), cancel.clone());

        let first = tokio::time::timeout(Duration::from_secs(2), a.outbound.recv())
            .await
            .unwrap();
        assert_eq!(first, Some(Outbound::Ping));

        cancel.cancel();
        task.await.unwrap();
    }
}
