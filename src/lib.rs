//! Swarmguard - Adaptive, cluster-aware rate limiting
//!
//! This crate decides whether an attempt by an identity (IP, user, endpoint
//! or custom key) is admitted within a rolling window. Limits tighten as an
//! identity's behavior looks more automated, and multiple service instances
//! share a best-effort view of their counts through a common cache backend.

pub mod audit;
pub mod clock;
pub mod config;
pub mod error;
pub mod mesh;
pub mod ratelimit;
pub mod store;
