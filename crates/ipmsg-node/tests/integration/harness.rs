//! Test harness for in-process ipmsg-node integration tests.
//!
//! Provides TestNode (a full node on a MockTransport with a real loopback
//! TCP listener) and TestNodeBuilder (config), plus polling helpers.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use ipmsg_node::config::NodeConfig;
use ipmsg_node::delivery::DeliveryService;
use ipmsg_node::discovery::DiscoveredPeer;
use ipmsg_node::store::MemoryStore;
use ipmsg_node::transport::MockTransport;
use ipmsg_node::Node;
use ipmsg_protocol::{Command, Packet, PROTOCOL_VERSION};

/// Poll `check` every 20ms until it returns true, or fail after `timeout`.
pub async fn wait_until<F, Fut>(timeout: Duration, what: &str, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("timeout waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Packet as a remote peer would send it (no instance-id suffix).
pub fn remote_packet(command: Command, sender: &str, payload: &str) -> Packet {
    Packet::new(
        PROTOCOL_VERSION,
        1,
        sender,
        format!("{sender}-host"),
        command,
        payload,
    )
}

/// A running in-process node.
pub struct TestNode {
    pub node: Node,
    pub mock: MockTransport,
    pub store: Arc<MemoryStore>,
}

#[allow(dead_code)]
impl TestNode {
    pub fn nickname(&self) -> &str {
        &self.node.config().node.nickname
    }

    /// Make `name` known to the node via an ENTRY_ANNOUNCE from `address`.
    pub async fn announce_peer(&self, name: &str, address: &str) -> anyhow::Result<DiscoveredPeer> {
        self.mock
            .simulate_packet(&remote_packet(Command::EntryAnnounce, name, name), address);
        let discovery = self.node.discovery().clone();
        let id = name.to_string();
        wait_until(Duration::from_secs(2), "peer discovery", || {
            let discovery = discovery.clone();
            let id = id.clone();
            async move {
                discovery
                    .peers()
                    .await
                    .map(|peers| peers.iter().any(|p| p.id == id))
                    .unwrap_or(false)
            }
        })
        .await?;
        let peers = self.node.discovery().peers().await?;
        peers
            .into_iter()
            .find(|p| p.id == name)
            .ok_or_else(|| anyhow::anyhow!("peer {name} vanished"))
    }

    /// A delivery service dialling this node's TCP listener.
    pub fn delivery_from(&self, sender: &str) -> DeliveryService {
        let mut cfg = NodeConfig::default();
        cfg.node.nickname = sender.into();
        cfg.node.hostname = format!("{sender}-host");
        cfg.delivery.max_retries = 2;
        cfg.delivery.base_delay_ms = 10;
        DeliveryService::from_config(&cfg)
    }

    pub async fn shutdown(self) {
        self.node.shutdown().await;
    }
}

/// Builder for configuring and spawning a TestNode.
pub struct TestNodeBuilder {
    name: String,
    group: Option<String>,
    typing_timeout_ms: u64,
    typing_cleanup_ms: u64,
}

#[allow(dead_code)]
impl TestNodeBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            group: None,
            typing_timeout_ms: 5000,
            typing_cleanup_ms: 1000,
        }
    }

    pub fn group(mut self, group: &str) -> Self {
        self.group = Some(group.into());
        self
    }

    pub fn typing_timeout_ms(mut self, timeout: u64, cleanup: u64) -> Self {
        self.typing_timeout_ms = timeout;
        self.typing_cleanup_ms = cleanup;
        self
    }

    pub fn config(&self) -> NodeConfig {
        let mut cfg = NodeConfig::default();
        cfg.node.nickname = self.name.clone();
        cfg.node.hostname = format!("{}-host", self.name);
        cfg.node.group = self.group.clone();
        // Ephemeral TCP port; UDP is mocked
        cfg.network.tcp_port = 0;
        cfg.typing.timeout_ms = self.typing_timeout_ms;
        cfg.typing.cleanup_interval_ms = self.typing_cleanup_ms;
        cfg.delivery.max_retries = 1;
        cfg.delivery.base_delay_ms = 10;
        cfg
    }

    pub async fn build(self) -> anyhow::Result<TestNode> {
        let cfg = self.config();
        let mock = MockTransport::new();
        let store = Arc::new(MemoryStore::new());
        let delivery = DeliveryService::from_config(&cfg);
        let node = Node::start_with(cfg, mock.clone(), delivery, store.clone()).await?;
        Ok(TestNode { node, mock, store })
    }
}
