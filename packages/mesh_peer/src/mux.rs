//! Named ports over the engine: dial returns a [`Socket`], bind returns a
//! listener that queues accepted sockets.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::{DuplexConfig, PeerConfig, SocketConfig};
use crate::duplex::{DuplexReader, DuplexWriter, duplex};
use crate::engine::{ConnectOptions, Engine};
use crate::error::Result;
use crate::platform::PeerConnectionFactory;
use crate::signaling::HubClient;
use crate::socket::Socket;

/// Entry point for applications: dial and bind named ports.
#[derive(Clone)]
pub struct PortMux {
    engine: Engine,
    socket_config: SocketConfig,
    duplex_config: DuplexConfig,
}

impl PortMux {
    pub fn new(engine: Engine, socket_config: SocketConfig, duplex_config: DuplexConfig) -> Self {
        Self {
            engine,
            socket_config,
            duplex_config,
        }
    }

    /// Connect to the hub, start an engine and wrap it.
    pub async fn start(
        config: &PeerConfig,
        factory: Arc<dyn PeerConnectionFactory>,
    ) -> Result<Self> {
        let (hub, events) = HubClient::connect(config.hub.clone()).await?;
        let engine = Engine::start(hub, events, factory, config.engine.clone()).await?;
        info!(address = %engine.local_address(), "node ready");
        Ok(Self::new(engine, config.socket.clone(), config.duplex.clone()))
    }

    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    pub fn local_address(&self) -> String {
        self.engine.local_address()
    }

    /// Open a socket to `port` on `remote`.
    pub async fn dial(&self, remote: &str, port: &str) -> Result<Arc<Socket>> {
        self.dial_with(remote, port, ConnectOptions::default()).await
    }

    pub async fn dial_with(
        &self,
        remote: &str,
        port: &str,
        options: ConnectOptions,
    ) -> Result<Arc<Socket>> {
        let (peer, channel) = self.engine.connect(remote, port, options).await?;
        let socket = Socket::new(peer, channel, self.socket_config.clone())?;
        debug!(remote = %socket.remote_address(), port = %port, "dialed");
        Ok(Arc::new(socket))
    }

    /// Dial and wrap the socket in a framed duplex.
    pub async fn dial_duplex(
        &self,
        remote: &str,
        port: &str,
    ) -> Result<(DuplexReader, DuplexWriter)> {
        let socket = self.dial(remote, port).await?;
        Ok(duplex(socket, self.duplex_config.clone()))
    }

    /// Claim `port`. Fails with `PortInUse` if it is already bound.
    pub fn bind(&self, port: &str) -> Result<PortListener> {
        let (tx, rx) = mpsc::unbounded_channel();
        let socket_config = self.socket_config.clone();
        let bound_port = port.to_string();
        self.engine.listen(port, move |peer, channel| {
            match Socket::new(peer, channel, socket_config.clone()) {
                Ok(socket) => {
                    let _ = tx.send(Arc::new(socket));
                }
                Err(e) => warn!(port = %bound_port, error = %e, "could not accept channel"),
            }
        })?;
        Ok(PortListener {
            port: port.to_string(),
            engine: self.engine.clone(),
            incoming: rx,
            duplex_config: self.duplex_config.clone(),
            bound: true,
        })
    }

    /// Register `hostname` on the hub so others can dial us by name.
    pub async fn register_hostname(&self, hostname: &str) -> Result<()> {
        self.engine.register_hostname(hostname).await
    }

    pub async fn terminate(&self, remote: &str) -> Result<()> {
        self.engine.terminate(remote).await
    }

    pub fn shutdown(&self) {
        self.engine.shutdown();
    }
}

/// A bound port. Dropping it releases the port.
pub struct PortListener {
    port: String,
    engine: Engine,
    incoming: mpsc::UnboundedReceiver<Arc<Socket>>,
    duplex_config: DuplexConfig,
    bound: bool,
}

impl PortListener {
    pub fn port(&self) -> &str {
        &self.port
    }

    /// Next accepted socket. `None` once the port is released.
    pub async fn accept(&mut self) -> Option<Arc<Socket>> {
        if !self.bound {
            return None;
        }
        self.incoming.recv().await
    }

    /// Next accepted socket wrapped in a framed duplex.
    pub async fn accept_duplex(&mut self) -> Option<(DuplexReader, DuplexWriter)> {
        let socket = self.accept().await?;
        Some(duplex(socket, self.duplex_config.clone()))
    }

    /// Stop accepting and free the port.
    pub fn unbind(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if std::mem::replace(&mut self.bound, false) {
            self.engine.unlisten(&self.port);
            debug!(port = %self.port, "port released");
        }
    }
}

impl Drop for PortListener {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::platform::memory::MemoryNetwork;
    use crate::testing::{TestHub, start_hub, start_node, start_node_with};
    use mesh_protocol::LOCALHOST;
    use std::time::Duration;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    async fn mux() -> PortMux {
        let hub = start_hub().await;
        let engine = start_node(&hub, &MemoryNetwork::new()).await;
        PortMux::new(engine, SocketConfig::default(), DuplexConfig::default())
    }

    #[tokio::test]
    async fn bind_twice_is_port_in_use() {
        let mux = mux().await;
        let _listener = mux.bind("http").unwrap();
        assert_eq!(mux.bind("http").err().unwrap().error_code(), "port_in_use");
    }

    #[tokio::test]
    async fn dropping_listener_frees_port() {
        let mux = mux().await;
        drop(mux.bind("http").unwrap());
        let listener = mux.bind("http").unwrap();
        listener.unbind();
        mux.bind("http").unwrap();
    }

    #[tokio::test]
    async fn dial_and_accept_over_loopback() {
        let mux = mux().await;
        let mut listener = mux.bind("echo").unwrap();

        let client = mux.dial(LOCALHOST, "echo").await.unwrap();
        let server = timeout(TEST_TIMEOUT, listener.accept())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(server.port(), "echo");

        client.write(&b"ping"[..]).await.unwrap();
        assert_eq!(&server.read().await.unwrap().unwrap()[..], b"ping");
        server.write(&b"pong"[..]).await.unwrap();
        assert_eq!(&client.read().await.unwrap().unwrap()[..], b"pong");
    }

    #[tokio::test]
    async fn unbound_port_is_not_reachable() {
        let hub = start_hub().await;
        let engine = start_node_fast(&hub).await;
        let mux = PortMux::new(engine, SocketConfig::default(), DuplexConfig::default());

        // The remote end closes the channel; the dialer either fails or sees
        // an immediately finished stream.
        match mux.dial(LOCALHOST, "nothing").await {
            Ok(socket) => {
                let read = timeout(TEST_TIMEOUT, socket.read()).await.unwrap();
                assert!(matches!(read, Ok(None)));
            }
            Err(e) => assert!(matches!(
                e.error_code(),
                "socket_closed" | "connection_timed_out"
            )),
        }
    }

    async fn start_node_fast(hub: &TestHub) -> Engine {
        start_node_with(
            hub,
            &MemoryNetwork::new(),
            EngineConfig {
                connect_timeout: Duration::from_millis(500),
                ..Default::default()
            },
        )
        .await
    }

    #[tokio::test]
    async fn duplex_over_bound_port() {
        let mux = mux().await;
        let mut listener = mux.bind("rpc").unwrap();

        let (_client_reader, mut client_writer) = mux.dial_duplex(LOCALHOST, "rpc").await.unwrap();
        let (mut server_reader, _server_writer) = timeout(TEST_TIMEOUT, listener.accept_duplex())
            .await
            .unwrap()
            .unwrap();

        let writer = tokio::spawn(async move {
            client_writer.write(&b"request"[..]).await.unwrap();
            client_writer.close().await.unwrap();
        });
        assert_eq!(
            &server_reader.read().await.unwrap().unwrap()[..],
            b"request"
        );
        assert_eq!(server_reader.read().await.unwrap(), None);
        writer.await.unwrap();
    }
}
