//! Gossip transport using Chitchat.
//!
//! Each node publishes the latest message per channel into its own gossip
//! state; peers read those values as they converge. Delivery is eventual and
//! only the most recent message per channel and node survives.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chitchat::transport::UdpTransport;
use chitchat::{spawn_chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::channel::EventChannel;
use crate::config::GossipConfig;
use crate::error::{Result, SwarmGuardError};

const KEY_PREFIX: &str = "channel|";

fn channel_key(channel: &str) -> String {
    format!("{}{}", KEY_PREFIX, channel)
}

/// A gossip-backed [`EventChannel`].
pub struct GossipChannel {
    node_id: String,
    handle: ChitchatHandle,
}

impl std::fmt::Debug for GossipChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GossipChannel")
            .field("node_id", &self.node_id)
            .finish()
    }
}

impl GossipChannel {
    /// Join the gossip cluster.
    pub async fn start(node_id: &str, config: &GossipConfig) -> Result<Self> {
        let advertise_addr = config.advertise_addr.unwrap_or(config.listen_addr);
        let gossip_interval = Duration::from_millis(config.gossip_interval_ms.max(1));

        info!(
            node_id = %node_id,
            listen_addr = %config.listen_addr,
            advertise_addr = %advertise_addr,
            seed_nodes = ?config.seed_nodes,
            cluster_id = %config.cluster_id,
            "Starting gossip channel"
        );

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId {
                node_id: node_id.to_string(),
                generation_id: 0,
                gossip_advertise_addr: advertise_addr,
            },
            cluster_id: config.cluster_id.clone(),
            gossip_interval,
            listen_addr: config.listen_addr,
            seed_nodes: config.seed_nodes.clone(),
            failure_detector_config: FailureDetectorConfig {
                initial_interval: gossip_interval,
                ..Default::default()
            },
            marked_for_deletion_grace_period: Duration::from_secs(
                config.dead_node_grace_period_secs,
            ),
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let handle = spawn_chitchat(chitchat_config, Vec::new(), &UdpTransport)
            .await
            .map_err(|e| SwarmGuardError::Cluster(format!("Failed to start gossip: {}", e)))?;

        Ok(Self {
            node_id: node_id.to_string(),
            handle,
        })
    }

    /// Our node ID.
    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    fn chitchat(&self) -> Arc<Mutex<chitchat::Chitchat>> {
        self.handle.chitchat()
    }

    /// Latest message on `channel` from every live node, as `(node_id, message)`.
    pub async fn latest(&self, channel: &str) -> Vec<(String, String)> {
        let key = channel_key(channel);
        let chitchat_arc = self.chitchat();
        let chitchat = chitchat_arc.lock().await;

        let mut messages: Vec<(String, String)> = chitchat
            .live_nodes()
            .filter_map(|id| {
                chitchat
                    .node_state(id)
                    .and_then(|state| state.get(&key))
                    .map(|value| (id.node_id.clone(), value.to_string()))
            })
            .collect();
        messages.sort();
        messages
    }

    /// IDs of all live nodes, including this one.
    pub async fn live_nodes(&self) -> Vec<String> {
        let chitchat_arc = self.chitchat();
        let chitchat = chitchat_arc.lock().await;
        chitchat.live_nodes().map(|id| id.node_id.clone()).collect()
    }

    /// Leave the gossip cluster.
    pub async fn shutdown(self) -> Result<()> {
        info!(node_id = %self.node_id, "Shutting down gossip channel");
        self.handle
            .shutdown()
            .await
            .map_err(|e| SwarmGuardError::Cluster(format!("Shutdown error: {:?}", e)))
    }
}

#[async_trait]
impl EventChannel for GossipChannel {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let key = channel_key(channel);
        let chitchat_arc = self.chitchat();
        let mut chitchat = chitchat_arc.lock().await;
        chitchat.self_node_state().set(&key, message.to_string());
        debug!(key = %key, "Published to gossip state");
        Ok(())
    }
}
