//! Shared fixtures for in-crate tests: a real hub on an ephemeral port and
//! nodes wired to a shared in-memory platform.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mesh_hub::Hub;
use mesh_protocol::IceConfiguration;
use tokio::net::TcpListener;

use crate::config::{EngineConfig, HubClientConfig};
use crate::engine::Engine;
use crate::platform::memory::MemoryNetwork;
use crate::signaling::HubClient;

pub(crate) struct TestHub {
    pub addr: SocketAddr,
    pub hub: Arc<Hub>,
}

impl TestHub {
    pub fn client_config(&self) -> HubClientConfig {
        HubClientConfig {
            url: format!("ws://{}/", self.addr),
            request_timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    /// Drop every hub session; the listener stays up.
    pub fn drop_sessions(&self) {
        self.hub.close_all();
    }
}

pub(crate) async fn start_hub() -> TestHub {
    init_tracing();
    let hub = Arc::new(Hub::new(IceConfiguration::default()));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(mesh_hub::server::serve(
        listener,
        hub.clone(),
        std::future::pending(),
    ));
    TestHub { addr, hub }
}

pub(crate) async fn start_node(hub: &TestHub, network: &MemoryNetwork) -> Engine {
    start_node_with(hub, network, EngineConfig::default()).await
}

pub(crate) async fn start_node_with(
    hub: &TestHub,
    network: &MemoryNetwork,
    config: EngineConfig,
) -> Engine {
    let (client, events) = HubClient::connect(hub.client_config()).await.unwrap();
    Engine::start(client, events, Arc::new(network.clone()), config)
        .await
        .unwrap()
}

pub(crate) fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}
