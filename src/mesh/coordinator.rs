//! Cluster coordination through the shared store.
//!
//! Nodes register themselves, elect a primary without a consensus protocol
//! and publish per-key counts into a best-effort global view. Every mutating
//! step is guarded by a short-lived advisory lock taken with
//! `set_if_absent`; a node that fails to get a lock skips the step and tries
//! again on its next round. Two nodes may both believe they are primary for a
//! short while after a partition heals. That only duplicates idempotent
//! cleanup work, since admission never depends on leadership.

use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::channel::EventChannel;
use crate::audit::{self, AuditEvent, AuditSink, Severity, CATEGORY_CLUSTER};
use crate::clock::Clock;
use crate::config::ClusterConfig;
use crate::error::Result;
use crate::store::{get_json, set_json, CacheBackend};

/// Global limit entries older than this are garbage.
pub const GLOBAL_LIMIT_TTL_SECS: u64 = 86_400;

/// Channel carrying individual global limit updates.
pub const GLOBAL_LIMITS_CHANNEL: &str = "rate_limit:global_limits";

/// Channel carrying the primary's synchronization summaries.
pub const SYNC_CHANNEL: &str = "rate_limit:sync";

const NODES_INDEX: &str = "cluster:nodes";
const GLOBAL_LIMITS_INDEX: &str = "cluster:global_limits";
const PRIMARY_KEY: &str = "primary_coordinator";
const ELECTION_LOCK: &str = "coordinator_election";
const SYNC_LOCK: &str = "global_limits_sync";
const CLEANUP_LOCK: &str = "node_cleanup";

fn node_key(node_id: &str) -> String {
    format!("nodes:{}", node_id)
}

fn global_limit_key(key: &str) -> String {
    format!("global_limits:{}", key)
}

fn lock_key(name: &str) -> String {
    format!("lock:{}", name)
}

/// A registered service instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterNode {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub last_seen: f64,
    pub version: String,
}

impl Default for ClusterNode {
    fn default() -> Self {
        Self {
            id: String::new(),
            hostname: String::new(),
            ip: String::new(),
            last_seen: 0.0,
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// One node's last published count for a key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GlobalLimitState {
    pub key: String,
    pub count: u64,
    pub max: u64,
    pub window_secs: u64,
    pub updated_at: f64,
    pub node_id: String,
}

impl Default for GlobalLimitState {
    fn default() -> Self {
        Self {
            key: String::new(),
            count: 0,
            max: 0,
            window_secs: 0,
            updated_at: 0.0,
            node_id: String::new(),
        }
    }
}

/// Leadership as this node last observed it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinatorRole {
    Unelected,
    Primary,
    Secondary,
}

/// Outcome of one maintenance round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub role: CoordinatorRole,
    pub synchronized: usize,
    pub removed_nodes: usize,
}

/// Registers this node, tracks leadership and maintains the global view.
pub struct ClusterCoordinator {
    store: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    channel: Option<Arc<dyn EventChannel>>,
    config: ClusterConfig,
    role: RwLock<CoordinatorRole>,
    global_view: DashMap<String, GlobalLimitState>,
}

impl std::fmt::Debug for ClusterCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterCoordinator")
            .field("node_id", &self.config.node_id)
            .field("role", &*self.role.read())
            .field("single_node", &self.channel.is_none())
            .finish()
    }
}

impl ClusterCoordinator {
    /// Create a coordinator. Without an event channel the node runs in
    /// single-node mode: always primary, no cross-node notifications.
    pub fn new(
        store: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        channel: Option<Arc<dyn EventChannel>>,
        config: ClusterConfig,
    ) -> Self {
        let role = if channel.is_none() {
            warn!(
                node_id = %config.node_id,
                "No event channel available, running in single-node mode"
            );
            CoordinatorRole::Primary
        } else {
            CoordinatorRole::Unelected
        };

        Self {
            store,
            clock,
            audit,
            channel,
            config,
            role: RwLock::new(role),
            global_view: DashMap::new(),
        }
    }

    /// This node's id.
    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    /// Role as of the last election or primary check.
    pub fn role(&self) -> CoordinatorRole {
        *self.role.read()
    }

    /// Whether the coordinator runs without an event channel.
    pub fn is_single_node(&self) -> bool {
        self.channel.is_none()
    }

    fn set_role(&self, role: CoordinatorRole) {
        let previous = std::mem::replace(&mut *self.role.write(), role);
        if previous != role {
            info!(node_id = %self.config.node_id, from = ?previous, to = ?role, "Coordinator role changed");
            if role == CoordinatorRole::Primary {
                audit::emit(
                    self.audit.as_ref(),
                    AuditEvent::new(CATEGORY_CLUSTER, "primary_elected", Severity::Info)
                        .at(self.clock.now_utc())
                        .with("node_id", self.config.node_id.clone()),
                );
            }
        }
    }

    async fn try_lock(&self, name: &str, ttl_secs: u64) -> bool {
        match self
            .store
            .set_if_absent(&lock_key(name), &self.config.node_id, ttl_secs.max(1))
            .await
        {
            Ok(acquired) => {
                if !acquired {
                    debug!(lock = %name, "Lock held elsewhere, skipping");
                }
                acquired
            }
            Err(e) => {
                debug!(lock = %name, error = %e, "Lock acquisition failed");
                false
            }
        }
    }

    // Read and delete are separate calls. If the lock expires and is taken by
    // another node in between, that node's lock is released early.
    async fn unlock(&self, name: &str) {
        let key = lock_key(name);
        match self.store.get(&key).await {
            Ok(Some(owner)) if owner == self.config.node_id => {
                if let Err(e) = self.store.delete(&key).await {
                    debug!(lock = %name, error = %e, "Lock release failed");
                }
            }
            _ => {}
        }
    }

    async fn publish(&self, channel: &str, message: &str) {
        if let Some(events) = &self.channel {
            if let Err(e) = events.publish(channel, message).await {
                debug!(channel = %channel, error = %e, "Publish failed");
            }
        }
    }

    /// Write or refresh this node's registration without running an election.
    pub async fn heartbeat(&self) -> Result<ClusterNode> {
        let node = ClusterNode {
            id: self.config.node_id.clone(),
            hostname: self.config.hostname.clone(),
            ip: self.config.ip.clone(),
            last_seen: self.clock.now(),
            ..ClusterNode::default()
        };
        set_json(
            self.store.as_ref(),
            &node_key(&node.id),
            &node,
            Some(self.config.max_node_age_secs.max(1)),
        )
        .await?;
        self.store.zadd(NODES_INDEX, &node.id, node.last_seen).await?;
        Ok(node)
    }

    /// Register this node and settle its role.
    pub async fn register_node(&self) -> Result<CoordinatorRole> {
        let node = self.heartbeat().await?;
        let role = self.elect_primary().await;

        info!(node_id = %node.id, hostname = %node.hostname, role = ?role, "Node registered");
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(CATEGORY_CLUSTER, "node_registered", Severity::Info)
                .at(self.clock.now_utc())
                .with("node_id", node.id)
                .with("hostname", node.hostname)
                .with("ip", node.ip),
        );
        Ok(role)
    }

    /// Remove this node's registration, giving up leadership.
    pub async fn deregister(&self) -> Result<()> {
        let node_id = self.config.node_id.clone();
        self.store.delete(&node_key(&node_id)).await?;
        if self.store.get(PRIMARY_KEY).await?.as_deref() == Some(node_id.as_str()) {
            self.store.delete(PRIMARY_KEY).await?;
        }
        if !self.is_single_node() {
            self.set_role(CoordinatorRole::Unelected);
        }

        info!(node_id = %node_id, "Node deregistered");
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(CATEGORY_CLUSTER, "node_deregistered", Severity::Info)
                .at(self.clock.now_utc())
                .with("node_id", node_id),
        );
        Ok(())
    }

    /// Ids of nodes whose registration record still exists, sorted.
    async fn registered_node_ids(&self) -> Result<Vec<String>> {
        let indexed = self.store.zrange(NODES_INDEX, 0, -1).await?;
        let lookups = indexed.iter().map(|(id, _)| {
            let key = node_key(id);
            async move { self.store.get(&key).await }
        });
        let records = join_all(lookups).await;

        let mut ids: Vec<String> = indexed
            .into_iter()
            .zip(records)
            .filter_map(|((id, _), record)| matches!(record, Ok(Some(_))).then_some(id))
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// Run the election and return the resulting role. If the election lock
    /// is held elsewhere the current role is kept.
    pub async fn elect_primary(&self) -> CoordinatorRole {
        if self.is_single_node() {
            return CoordinatorRole::Primary;
        }
        if !self.try_lock(ELECTION_LOCK, self.config.election_lock_ttl_secs).await {
            return self.role();
        }

        let outcome = self.run_election().await;
        self.unlock(ELECTION_LOCK).await;

        match outcome {
            Ok(role) => {
                self.set_role(role);
                role
            }
            Err(e) => {
                warn!(node_id = %self.config.node_id, error = %e, "Election failed");
                self.role()
            }
        }
    }

    async fn run_election(&self) -> Result<CoordinatorRole> {
        let me = self.config.node_id.as_str();
        let nodes = self.registered_node_ids().await?;

        if nodes.is_empty() {
            self.store.set(PRIMARY_KEY, me, None).await?;
            return Ok(CoordinatorRole::Primary);
        }

        match self.store.get(PRIMARY_KEY).await? {
            Some(current) if current == me => return Ok(CoordinatorRole::Primary),
            Some(current) if nodes.contains(&current) => {
                debug!(primary = %current, "Active primary found");
                return Ok(CoordinatorRole::Secondary);
            }
            _ => {}
        }

        // No live primary: the smallest registered id takes over
        let elected = &nodes[0];
        self.store.set(PRIMARY_KEY, elected, None).await?;
        info!(primary = %elected, "New primary coordinator elected");

        Ok(if elected == me {
            CoordinatorRole::Primary
        } else {
            CoordinatorRole::Secondary
        })
    }

    /// Whether this node is currently the primary.
    pub async fn is_primary_coordinator(&self) -> bool {
        if self.is_single_node() {
            return true;
        }
        match self.store.get(PRIMARY_KEY).await {
            Ok(Some(primary)) => {
                let is_primary = primary == self.config.node_id;
                if !is_primary && self.role() == CoordinatorRole::Primary {
                    self.set_role(CoordinatorRole::Secondary);
                }
                is_primary
            }
            Ok(None) => false,
            Err(_) => self.role() == CoordinatorRole::Primary,
        }
    }

    /// All registered nodes keyed by id.
    pub async fn get_nodes(&self) -> Result<HashMap<String, ClusterNode>> {
        let indexed = self.store.zrange(NODES_INDEX, 0, -1).await?;
        let lookups = indexed.iter().map(|(id, _)| {
            let key = node_key(id);
            async move { get_json::<ClusterNode>(self.store.as_ref(), &key).await }
        });

        Ok(join_all(lookups)
            .await
            .into_iter()
            .filter_map(|record| record.ok().flatten())
            .map(|node| (node.id.clone(), node))
            .collect())
    }

    /// Publish this node's count for a key. Returns false when the key's lock
    /// is held elsewhere or the store rejects the write.
    pub async fn update_global_limit(&self, key: &str, count: u64, max: u64, window_secs: u64) -> bool {
        let lock = global_limit_key(key);
        if !self.try_lock(&lock, self.config.lock_ttl_secs).await {
            return false;
        }

        let state = GlobalLimitState {
            key: key.to_string(),
            count,
            max,
            window_secs,
            updated_at: self.clock.now(),
            node_id: self.config.node_id.clone(),
        };
        let written = self.write_global_limit(&state).await;
        self.unlock(&lock).await;

        match written {
            Ok(()) => {
                if let Ok(message) = serde_json::to_string(&state) {
                    self.publish(GLOBAL_LIMITS_CHANNEL, &message).await;
                }
                true
            }
            Err(e) => {
                debug!(key = %key, error = %e, "Global limit update failed");
                false
            }
        }
    }

    async fn write_global_limit(&self, state: &GlobalLimitState) -> Result<()> {
        set_json(
            self.store.as_ref(),
            &global_limit_key(&state.key),
            state,
            Some(GLOBAL_LIMIT_TTL_SECS),
        )
        .await?;
        self.store
            .zadd(GLOBAL_LIMITS_INDEX, &state.key, state.updated_at)
            .await
    }

    /// The last published state for a key, if any.
    pub async fn get_global_limit(&self, key: &str) -> Option<GlobalLimitState> {
        match get_json(self.store.as_ref(), &global_limit_key(key)).await {
            Ok(state) => state,
            Err(e) => {
                debug!(key = %key, error = %e, "Unreadable global limit");
                None
            }
        }
    }

    /// The global view gathered by the last synchronization on this node.
    /// Informational only; admission never consults it.
    pub fn global_view(&self) -> HashMap<String, GlobalLimitState> {
        self.global_view
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }

    /// Collect fresh global limit states and purge stale ones. Primary only;
    /// returns the number of live entries gathered.
    pub async fn synchronize_global_limits(&self) -> usize {
        if !self.is_primary_coordinator().await {
            return 0;
        }
        if !self.try_lock(SYNC_LOCK, self.config.lock_ttl_secs).await {
            return 0;
        }

        let result = self.collect_global_limits().await;
        self.unlock(SYNC_LOCK).await;

        match result {
            Ok((synchronized, purged)) => {
                debug!(synchronized = synchronized, purged = purged, "Global limits synchronized");
                synchronized
            }
            Err(e) => {
                warn!(error = %e, "Global limit synchronization failed");
                0
            }
        }
    }

    async fn collect_global_limits(&self) -> Result<(usize, usize)> {
        let cutoff = self.clock.now() - GLOBAL_LIMIT_TTL_SECS as f64;
        let indexed = self.store.zrange(GLOBAL_LIMITS_INDEX, 0, -1).await?;
        let (stale, fresh): (Vec<_>, Vec<_>) =
            indexed.into_iter().partition(|(_, updated_at)| *updated_at <= cutoff);

        for (key, _) in &stale {
            self.store.delete(&global_limit_key(key)).await?;
        }
        let purged = self
            .store
            .zrem_range_by_score(GLOBAL_LIMITS_INDEX, f64::NEG_INFINITY, cutoff)
            .await? as usize;

        let lookups = fresh.iter().map(|(key, _)| self.get_global_limit(key));
        let states: Vec<GlobalLimitState> = join_all(lookups)
            .await
            .into_iter()
            .flatten()
            .filter(|state| state.updated_at > cutoff)
            .collect();

        self.global_view.clear();
        let mut total = 0u64;
        for state in states {
            total = total.saturating_add(state.count);
            self.global_view.insert(state.key.clone(), state);
        }
        let synchronized = self.global_view.len();

        let summary = serde_json::json!({
            "node_id": self.config.node_id,
            "keys": synchronized,
            "total_count": total,
            "purged": purged,
        });
        self.publish(SYNC_CHANNEL, &summary.to_string()).await;

        Ok((synchronized, purged))
    }

    /// Remove nodes not seen for `max_age_secs`. Primary only; returns the
    /// number of nodes removed.
    pub async fn cleanup_inactive_nodes(&self, max_age_secs: u64) -> usize {
        if !self.is_primary_coordinator().await {
            return 0;
        }
        if !self.try_lock(CLEANUP_LOCK, self.config.lock_ttl_secs).await {
            return 0;
        }

        let result = self.remove_inactive_nodes(max_age_secs).await;
        self.unlock(CLEANUP_LOCK).await;

        match result {
            Ok(removed) => {
                if !removed.is_empty() {
                    info!(count = removed.len(), nodes = ?removed, "Removed inactive nodes");
                    audit::emit(
                        self.audit.as_ref(),
                        AuditEvent::new(CATEGORY_CLUSTER, "inactive_nodes_removed", Severity::Warning)
                            .at(self.clock.now_utc())
                            .with("count", removed.len())
                            .with("nodes", removed.clone()),
                    );
                }
                removed.len()
            }
            Err(e) => {
                warn!(error = %e, "Node cleanup failed");
                0
            }
        }
    }

    async fn remove_inactive_nodes(&self, max_age_secs: u64) -> Result<Vec<String>> {
        let me = self.config.node_id.as_str();
        let cutoff = self.clock.now() - max_age_secs as f64;
        let indexed = self.store.zrange(NODES_INDEX, 0, -1).await?;

        let stale: Vec<(String, f64)> = indexed
            .into_iter()
            .filter(|(_, last_seen)| *last_seen < cutoff)
            .collect();
        let Some(newest_stale) = stale.iter().map(|(_, seen)| *seen).reduce(f64::max) else {
            return Ok(Vec::new());
        };

        let mut removed = Vec::new();
        let mut self_entry = None;
        for (id, last_seen) in stale {
            if id == me {
                self_entry = Some(last_seen);
                continue;
            }
            self.store.delete(&node_key(&id)).await?;
            removed.push(id);
        }
        self.store
            .zrem_range_by_score(NODES_INDEX, f64::NEG_INFINITY, newest_stale)
            .await?;
        if let Some(last_seen) = self_entry {
            self.store.zadd(NODES_INDEX, me, last_seen).await?;
        }
        Ok(removed)
    }

    /// Heartbeat, settle leadership and, on the primary, run synchronization
    /// and node cleanup.
    pub async fn run_maintenance(&self) -> MaintenanceReport {
        if let Err(e) = self.heartbeat().await {
            warn!(node_id = %self.config.node_id, error = %e, "Heartbeat failed");
        }
        let role = self.elect_primary().await;

        let (synchronized, removed_nodes) = if role == CoordinatorRole::Primary {
            (
                self.synchronize_global_limits().await,
                self.cleanup_inactive_nodes(self.config.max_node_age_secs).await,
            )
        } else {
            (0, 0)
        };

        MaintenanceReport {
            role,
            synchronized,
            removed_nodes,
        }
    }
}
