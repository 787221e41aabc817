//! Adaptive rate limiter.
//!
//! Combines the sliding window counter, the behavior profiler and the rule
//! engine into one admission decision per attempt. Rules and progressive
//! throttling only ever tighten the nominal limit; the nominal counter makes
//! the final, recorded decision.

use std::sync::Arc;
use tracing::{debug, trace, warn};

use super::behavior::BehaviorProfiler;
use super::key::RateLimitKey;
use super::rules::{RateLimiterRule, RuleEngine, RuleSet, RuleUpdate};
use super::window::SlidingWindowCounter;
use crate::audit::{self, AuditEvent, AuditSink, Severity, CATEGORY_RATE_LIMIT};
use crate::clock::Clock;
use crate::config::SwarmGuardConfig;
use crate::error::{Result, SwarmGuardError};
use crate::mesh::ClusterCoordinator;
use crate::store::CacheBackend;

/// Scores above this trigger progressive throttling.
const PROGRESSIVE_THRESHOLD: f64 = 0.6;

/// Per-attempt information supplied by the caller.
#[derive(Debug, Clone, Default)]
pub struct AttemptContext {
    pub user_agent: Option<String>,
}

impl AttemptContext {
    /// Context carrying a user agent.
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self {
            user_agent: Some(user_agent.into()),
        }
    }
}

/// Why an attempt was refused.
#[derive(Debug, Clone, PartialEq)]
pub enum DenialReason {
    /// A behavior rule tightened the limit and it was reached.
    StricterRule { rule: Option<String>, limit: u64 },
    /// The anomaly score shrank the limit and it was reached.
    ProgressiveLimit { limit: u64 },
    /// The nominal limit was reached.
    LimitExceeded,
}

/// The outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    Admitted { remaining: u64, score: f64 },
    Denied { reason: DenialReason, retry_after: u64 },
}

impl Decision {
    /// Whether the attempt was let through.
    pub fn is_admitted(&self) -> bool {
        matches!(self, Decision::Admitted { .. })
    }
}

/// The limit applied once the anomaly score passes the progressive threshold.
fn progressive_limit(nominal: u64, score: f64) -> u64 {
    ((nominal as f64) * (1.0 - score * 0.5)).round().max(1.0) as u64
}

/// Admission control for one key.
pub struct AdaptiveLimiter {
    counter: SlidingWindowCounter,
    profiler: BehaviorProfiler,
    rules: RuleEngine,
    coordinator: Option<Arc<ClusterCoordinator>>,
    audit: Arc<dyn AuditSink>,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AdaptiveLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdaptiveLimiter")
            .field("counter", &self.counter)
            .field("clustered", &self.coordinator.is_some())
            .finish()
    }
}

impl AdaptiveLimiter {
    /// Build a limiter for `key`. Fails if the store does not answer a ping
    /// or the configured rules file cannot be read.
    ///
    /// The coordinator receives this key's local count on every attempt that
    /// reaches the nominal counter, but only when `cluster.enabled` is set.
    pub async fn connect(
        key: RateLimitKey,
        config: &SwarmGuardConfig,
        store: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        coordinator: Option<Arc<ClusterCoordinator>>,
    ) -> Result<Self> {
        store
            .ping()
            .await
            .map_err(|e| SwarmGuardError::Backend(format!("Cache backend unreachable: {}", e)))?;

        let extra_rules = match &config.limiter.rules_path {
            Some(path) => RuleSet::from_file(path)?.rules,
            None => Vec::new(),
        };

        let coordinator = match coordinator {
            Some(_) if !config.cluster.enabled => {
                debug!(key = %key, "Cluster coordination disabled, not publishing counts");
                None
            }
            coordinator => coordinator,
        };

        let max_attempts = config.limiter.max_attempts;
        let window_secs = config.limiter.window_secs;
        debug!(
            key = %key,
            max_attempts = max_attempts,
            window_secs = window_secs,
            extra_rules = extra_rules.len(),
            clustered = coordinator.is_some(),
            "Rate limiter created"
        );

        Ok(Self {
            counter: SlidingWindowCounter::new(
                store.clone(),
                clock.clone(),
                key.clone(),
                max_attempts,
                window_secs,
            ),
            profiler: BehaviorProfiler::new(store.clone(), config.behavior.clone()),
            rules: RuleEngine::new(store, clock.clone(), audit.clone(), key, max_attempts, window_secs)
                .with_extra_rules(extra_rules),
            coordinator,
            audit,
            clock,
        })
    }

    /// Whether local counts are published to a coordinator.
    pub fn is_clustered(&self) -> bool {
        self.coordinator.is_some()
    }

    /// The limited key.
    pub fn key(&self) -> &RateLimitKey {
        self.counter.key()
    }

    /// Nominal limit.
    pub fn max_attempts(&self) -> u64 {
        self.counter.max_attempts()
    }

    /// Window length in seconds.
    pub fn window_secs(&self) -> u64 {
        self.counter.window_secs()
    }

    fn tracking_id(&self) -> String {
        self.key().tracking_id()
    }

    fn audit_event(&self, action: &str, severity: Severity) -> AuditEvent {
        AuditEvent::new(CATEGORY_RATE_LIMIT, action, severity)
            .at(self.clock.now_utc())
            .with("key", self.key().cache_key())
    }

    async fn denied(&self, reason: DenialReason) -> Result<Decision> {
        let retry_after = self.counter.retry_after().await?;
        debug!(key = %self.key(), reason = ?reason, retry_after = retry_after, "Attempt denied");
        Ok(Decision::Denied {
            reason,
            retry_after,
        })
    }

    /// Decide one attempt. Only an admission is recorded.
    pub async fn check(&self, ctx: &AttemptContext) -> Result<Decision> {
        let nominal = self.counter.max_attempts();
        let tracking_id = self.tracking_id();
        let score = self.profiler.score(&tracking_id).await;

        let rule_set = self.rules.rule_set().await;
        let adjusted = rule_set.adjusted_limit(nominal, score);
        trace!(key = %self.key(), score = score, adjusted = adjusted, "Evaluating attempt");

        if adjusted < nominal && !self.counter.with_limit(adjusted).would_admit().await? {
            let rule = rule_set.strictest(score).map(|r| r.name().to_string());
            audit::emit(
                self.audit.as_ref(),
                self.audit_event("stricter_rule_applied", Severity::Warning)
                    .with("rule", rule.clone())
                    .with("limit", adjusted)
                    .with("score", score),
            );
            return self
                .denied(DenialReason::StricterRule {
                    rule,
                    limit: adjusted,
                })
                .await;
        }

        if score > PROGRESSIVE_THRESHOLD {
            let limit = progressive_limit(nominal, score);
            if limit < nominal && !self.counter.with_limit(limit).would_admit().await? {
                audit::emit(
                    self.audit.as_ref(),
                    self.audit_event("progressive_limit_applied", Severity::Warning)
                        .with("limit", limit)
                        .with("score", score),
                );
                return self.denied(DenialReason::ProgressiveLimit { limit }).await;
            }
        }

        if let Some(coordinator) = &self.coordinator {
            self.publish_count(coordinator.clone());
        }

        if !self.counter.attempt().await? {
            audit::emit(
                self.audit.as_ref(),
                self.audit_event("normal_limit_exceeded", Severity::Warning)
                    .with("limit", nominal)
                    .with("score", score),
            );
            return self.denied(DenialReason::LimitExceeded).await;
        }

        let now = self.clock.now();
        let score = match self
            .profiler
            .record_success(&tracking_id, now, ctx.user_agent.as_deref())
            .await
        {
            Ok(updated) => updated,
            Err(e) => {
                warn!(key = %self.key(), error = %e, "Failed to update behavior profile");
                score
            }
        };

        Ok(Decision::Admitted {
            remaining: self.counter.remaining().await?,
            score,
        })
    }

    /// Push the local count to the cluster without waiting for it.
    fn publish_count(&self, coordinator: Arc<ClusterCoordinator>) {
        let counter = self.counter.clone();
        tokio::spawn(async move {
            let key = counter.key().cache_key();
            match counter.count().await {
                Ok(count) => {
                    coordinator
                        .update_global_limit(&key, count, counter.max_attempts(), counter.window_secs())
                        .await;
                }
                Err(e) => debug!(key = %key, error = %e, "Skipping global limit update"),
            }
        });
    }

    /// Whether the attempt is admitted.
    pub async fn attempt(&self, ctx: &AttemptContext) -> Result<bool> {
        Ok(self.check(ctx).await?.is_admitted())
    }

    /// Attempts left in the current window.
    pub async fn remaining(&self) -> Result<u64> {
        self.counter.remaining().await
    }

    /// Seconds until the oldest attempt leaves the window.
    pub async fn retry_after(&self) -> Result<u64> {
        self.counter.retry_after().await
    }

    /// Whether the nominal limit is currently reached.
    pub async fn is_exceeded(&self) -> Result<bool> {
        self.counter.is_exceeded().await
    }

    /// Clear the attempt history for this key.
    pub async fn reset(&self) -> Result<()> {
        self.counter.reset().await?;
        audit::emit(self.audit.as_ref(), self.audit_event("rate_limit_reset", Severity::Info));
        Ok(())
    }

    /// Current anomaly score for this key.
    pub async fn behavior_score(&self) -> f64 {
        self.profiler.score(&self.tracking_id()).await
    }

    /// Add or replace a rule.
    pub async fn add_rule(&self, rule: RateLimiterRule) -> Result<()> {
        self.rules.add_rule(rule).await
    }

    /// Remove a rule by id.
    pub async fn remove_rule(&self, id: &str) -> Result<bool> {
        self.rules.remove_rule(id).await
    }

    /// Update a rule by id.
    pub async fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<Option<RateLimiterRule>> {
        self.rules.update_rule(id, update).await
    }

    /// All rules by descending priority.
    pub async fn list_rules(&self) -> Vec<RateLimiterRule> {
        self.rules.list_rules().await
    }

    /// Rules that apply at the key's current anomaly score.
    pub async fn active_applicable_rules(&self) -> Vec<RateLimiterRule> {
        let score = self.behavior_score().await;
        self.rules.applicable_rules(score).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use crate::clock::ManualClock;
    use crate::config::{ClusterConfig, LimiterConfig};
    use crate::ratelimit::BehaviorProfile;
    use crate::store::{set_json, MemoryStore};

    struct Harness {
        clock: Arc<ManualClock>,
        store: Arc<MemoryStore>,
        audit: Arc<MemoryAuditSink>,
    }

    impl Harness {
        fn new() -> Self {
            let clock = Arc::new(ManualClock::new(1_000.0));
            Self {
                store: Arc::new(MemoryStore::with_clock(clock.clone())),
                clock,
                audit: Arc::new(MemoryAuditSink::new()),
            }
        }

        fn config(max_attempts: u64, cluster_enabled: bool) -> SwarmGuardConfig {
            SwarmGuardConfig {
                limiter: LimiterConfig {
                    max_attempts,
                    window_secs: 60,
                    rules_path: None,
                },
                cluster: ClusterConfig {
                    enabled: cluster_enabled,
                    ..ClusterConfig::default()
                },
                ..SwarmGuardConfig::default()
            }
        }

        async fn limiter(&self, key: RateLimitKey, max_attempts: u64) -> AdaptiveLimiter {
            AdaptiveLimiter::connect(
                key,
                &Self::config(max_attempts, false),
                self.store.clone(),
                self.clock.clone(),
                self.audit.clone(),
                None,
            )
            .await
            .unwrap()
        }

        async fn clustered(
            &self,
            key: RateLimitKey,
            max_attempts: u64,
            cluster_enabled: bool,
        ) -> (AdaptiveLimiter, Arc<ClusterCoordinator>) {
            let config = Self::config(max_attempts, cluster_enabled);
            let coordinator = Arc::new(ClusterCoordinator::new(
                self.store.clone(),
                self.clock.clone(),
                self.audit.clone(),
                None,
                config.cluster.clone(),
            ));
            let limiter = AdaptiveLimiter::connect(
                key,
                &config,
                self.store.clone(),
                self.clock.clone(),
                self.audit.clone(),
                Some(coordinator.clone()),
            )
            .await
            .unwrap();
            (limiter, coordinator)
        }

        async fn seed_score(&self, key: &RateLimitKey, score: f64) {
            let profile = BehaviorProfile {
                anomaly_score: score,
                ..BehaviorProfile::new(self.clock.now())
            };
            let profile_key = format!("behavior_profile:{}", key.tracking_id());
            set_json(self.store.as_ref(), &profile_key, &profile, Some(3600))
                .await
                .unwrap();
        }
    }

    #[test]
    fn test_progressive_limit() {
        assert_eq!(progressive_limit(100, 0.8), 60);
        assert_eq!(progressive_limit(5, 0.7), 3);
        assert_eq!(progressive_limit(1, 1.0), 1);
    }

    #[tokio::test]
    async fn test_end_to_end_window() {
        let h = Harness::new();
        let limiter = h.limiter(RateLimitKey::ip("10.0.0.1"), 5).await;
        let ctx = AttemptContext::with_user_agent("curl/8.0");

        for _ in 0..5 {
            assert!(limiter.attempt(&ctx).await.unwrap());
        }
        assert!(!limiter.attempt(&ctx).await.unwrap());
        assert_eq!(limiter.remaining().await.unwrap(), 0);
        assert_eq!(limiter.retry_after().await.unwrap(), 60);
        assert!(limiter.is_exceeded().await.unwrap());
        assert!(h.audit.actions().contains(&"normal_limit_exceeded".to_string()));

        h.clock.set(1_061.0);
        assert!(limiter.attempt(&ctx).await.unwrap());
        assert_eq!(limiter.remaining().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn test_admission_reports_remaining_and_score() {
        let h = Harness::new();
        let limiter = h.limiter(RateLimitKey::user("42"), 3).await;

        let decision = limiter.check(&AttemptContext::default()).await.unwrap();
        assert_eq!(
            decision,
            Decision::Admitted {
                remaining: 2,
                score: 0.25
            }
        );
        assert_eq!(limiter.behavior_score().await, 0.25);
    }

    #[tokio::test]
    async fn test_denied_attempts_are_not_recorded() {
        let h = Harness::new();
        let limiter = h.limiter(RateLimitKey::ip("10.0.0.2"), 2).await;
        let ctx = AttemptContext::default();

        for _ in 0..2 {
            assert!(limiter.attempt(&ctx).await.unwrap());
        }
        for _ in 0..3 {
            let decision = limiter.check(&ctx).await.unwrap();
            assert_eq!(
                decision,
                Decision::Denied {
                    reason: DenialReason::LimitExceeded,
                    retry_after: 60
                }
            );
        }
        assert_eq!(h.store.zcard("rate_limit:ip:10.0.0.2").await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_stricter_rule_denies() {
        let h = Harness::new();
        let key = RateLimitKey::ip("10.0.0.3");
        h.seed_score(&key, 0.8).await;
        let limiter = h.limiter(key, 10).await;
        let ctx = AttemptContext::default();

        for _ in 0..3 {
            assert!(limiter.attempt(&ctx).await.unwrap());
        }
        let decision = limiter.check(&ctx).await.unwrap();
        assert_eq!(
            decision,
            Decision::Denied {
                reason: DenialReason::StricterRule {
                    rule: Some("multiple_account_creation".to_string()),
                    limit: 3
                },
                retry_after: 60
            }
        );
        assert!(h.audit.actions().contains(&"stricter_rule_applied".to_string()));
        assert_eq!(limiter.remaining().await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_progressive_limit_denies() {
        let h = Harness::new();
        let key = RateLimitKey::custom("export");
        h.seed_score(&key, 0.7).await;
        let limiter = h.limiter(key, 5).await;
        assert!(limiter.remove_rule("custom_burst_traffic").await.unwrap());
        let ctx = AttemptContext::default();

        for _ in 0..3 {
            assert!(limiter.attempt(&ctx).await.unwrap());
        }
        let decision = limiter.check(&ctx).await.unwrap();
        assert!(matches!(
            decision,
            Decision::Denied {
                reason: DenialReason::ProgressiveLimit { limit: 3 },
                ..
            }
        ));
        assert!(h.audit.actions().contains(&"progressive_limit_applied".to_string()));
    }

    #[tokio::test]
    async fn test_active_applicable_rules() {
        let h = Harness::new();
        let key = RateLimitKey::ip("10.0.0.4");
        let limiter = h.limiter(key.clone(), 10).await;
        assert!(limiter.active_applicable_rules().await.is_empty());

        h.seed_score(&key, 0.8).await;
        let names: Vec<String> = limiter
            .active_applicable_rules()
            .await
            .iter()
            .map(|r| r.name().to_string())
            .collect();
        assert_eq!(
            names,
            vec!["suspicious_activity", "multiple_account_creation", "burst_traffic"]
        );
    }

    #[tokio::test]
    async fn test_reset_clears_history() {
        let h = Harness::new();
        let limiter = h.limiter(RateLimitKey::endpoint("/login"), 1).await;
        let ctx = AttemptContext::default();

        assert!(limiter.attempt(&ctx).await.unwrap());
        assert!(!limiter.attempt(&ctx).await.unwrap());
        limiter.reset().await.unwrap();
        assert!(limiter.attempt(&ctx).await.unwrap());
        assert!(h.audit.actions().contains(&"rate_limit_reset".to_string()));
    }

    #[tokio::test]
    async fn test_connect_fails_when_store_down() {
        let h = Harness::new();
        h.store.set_available(false);
        let result = AdaptiveLimiter::connect(
            RateLimitKey::ip("10.0.0.5"),
            &SwarmGuardConfig::default(),
            h.store.clone(),
            h.clock.clone(),
            h.audit.clone(),
            None,
        )
        .await;
        assert!(matches!(result, Err(SwarmGuardError::Backend(_))));
    }

    #[tokio::test]
    async fn test_cluster_enabled_publishes_global_count() {
        let h = Harness::new();
        let (limiter, coordinator) = h.clustered(RateLimitKey::user("7"), 5, true).await;
        assert!(limiter.is_clustered());
        let ctx = AttemptContext::default();

        for _ in 0..3 {
            assert!(limiter.attempt(&ctx).await.unwrap());
        }

        let mut state = None;
        for _ in 0..50 {
            tokio::task::yield_now().await;
            state = coordinator.get_global_limit("rate_limit:user:7").await;
            if matches!(&state, Some(s) if s.count == 3) {
                break;
            }
        }
        // Spawned updates read the count when they run
        let state = state.unwrap();
        assert_eq!(state.count, 3);
        assert_eq!(state.max, 5);
        assert_eq!(state.window_secs, 60);
        assert!(h
            .store
            .get("global_limits:rate_limit:user:7")
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn test_cluster_disabled_keeps_counts_local() {
        let h = Harness::new();
        let (limiter, coordinator) = h.clustered(RateLimitKey::user("8"), 5, false).await;
        assert!(!limiter.is_clustered());
        let ctx = AttemptContext::default();

        for _ in 0..3 {
            assert!(limiter.attempt(&ctx).await.unwrap());
        }
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }

        assert!(coordinator.get_global_limit("rate_limit:user:8").await.is_none());
        assert_eq!(
            h.store.get("global_limits:rate_limit:user:8").await.unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_audit_events_use_limiter_clock() {
        let h = Harness::new();
        let limiter = h.limiter(RateLimitKey::ip("10.0.0.6"), 1).await;
        let ctx = AttemptContext::default();

        assert!(limiter.attempt(&ctx).await.unwrap());
        h.clock.advance(5.0);
        assert!(!limiter.attempt(&ctx).await.unwrap());

        let events = h.audit.events();
        let denial = events
            .iter()
            .find(|e| e.action == "normal_limit_exceeded")
            .unwrap();
        assert_eq!(denial.timestamp.timestamp(), 1_005);
    }
}
