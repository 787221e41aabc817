//! Cluster coordination and cross-node notification.
//!
//! The coordinator keeps node registrations, leadership and the global
//! limit view in the shared store. Event channels carry best-effort
//! notifications between nodes, either in-process or over Chitchat gossip.

mod channel;
mod coordinator;
mod gossip;

pub use channel::{BroadcastChannel, ChannelMessage, EventChannel};
pub use coordinator::{
    ClusterCoordinator, ClusterNode, CoordinatorRole, GlobalLimitState, MaintenanceReport,
    GLOBAL_LIMITS_CHANNEL, GLOBAL_LIMIT_TTL_SECS, SYNC_CHANNEL,
};
pub use gossip::GossipChannel;
