//! Adaptive rule definitions and evaluation.
//!
//! A rule tightens the nominal limit once the behavior score reaches its
//! threshold. When several rules apply the strictest limit wins; priority only
//! orders listings and breaks ties between equal limits.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::key::{KeyType, RateLimitKey};
use crate::audit::{self, AuditEvent, AuditSink, Severity, CATEGORY_RULES};
use crate::clock::Clock;
use crate::error::{Result, SwarmGuardError};
use crate::store::{get_json, set_json, CacheBackend};

/// Lifetime of a cached rule set in the shared store.
pub const RULES_TTL_SECS: u64 = 3600;

const RULE_RECORD_VERSION: u32 = 1;

/// A threshold-triggered limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(into = "RuleRecord", from = "RuleRecord")]
pub struct RateLimiterRule {
    id: String,
    name: String,
    description: String,
    max_attempts: u64,
    window_secs: u64,
    threshold: f64,
    conditions: HashMap<String, Value>,
    active: bool,
    priority: i32,
    last_modified: DateTime<Utc>,
}

impl RateLimiterRule {
    /// Create an active rule with a generated id. Out-of-range inputs are clamped.
    pub fn new(name: impl Into<String>, max_attempts: u64, window_secs: u64, threshold: f64) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            description: String::new(),
            max_attempts: max_attempts.max(1),
            window_secs: window_secs.max(1),
            threshold: clamp_threshold(threshold),
            conditions: HashMap::new(),
            active: true,
            priority: 0,
            last_modified: Utc::now(),
        }
    }

    /// Replace the generated id.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Set the priority; higher sorts first.
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Add a condition. Conditions are stored but not evaluated.
    pub fn with_condition(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.conditions.insert(key.into(), value.into());
        self
    }

    /// Stable rule identifier.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Human-readable name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Free-form description.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Limit enforced while the rule applies.
    pub fn max_attempts(&self) -> u64 {
        self.max_attempts
    }

    /// Window the limit was defined for.
    pub fn window_secs(&self) -> u64 {
        self.window_secs
    }

    /// Minimum behavior score at which the rule applies.
    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Attached conditions.
    pub fn conditions(&self) -> &HashMap<String, Value> {
        &self.conditions
    }

    /// Whether the rule takes part in evaluation.
    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Ordering and tie-break priority.
    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// When the rule was last changed.
    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Stamp the rule as modified at `at`.
    pub fn touch_at(&mut self, at: DateTime<Utc>) {
        self.last_modified = at;
    }

    fn touch(&mut self) {
        self.touch_at(Utc::now());
    }

    /// Rename the rule.
    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = name.into();
        self.touch();
    }

    /// Replace the description.
    pub fn set_description(&mut self, description: impl Into<String>) {
        self.description = description.into();
        self.touch();
    }

    /// Change the limit, raising values below 1 to 1.
    pub fn set_max_attempts(&mut self, max_attempts: u64) {
        self.max_attempts = max_attempts.max(1);
        self.touch();
    }

    /// Change the window, raising values below 1 to 1.
    pub fn set_window_secs(&mut self, window_secs: u64) {
        self.window_secs = window_secs.max(1);
        self.touch();
    }

    /// Change the threshold, clamped to [0, 1].
    pub fn set_threshold(&mut self, threshold: f64) {
        self.threshold = clamp_threshold(threshold);
        self.touch();
    }

    /// Replace all conditions.
    pub fn set_conditions(&mut self, conditions: HashMap<String, Value>) {
        self.conditions = conditions;
        self.touch();
    }

    /// Enable or disable the rule.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
        self.touch();
    }

    /// Change the priority.
    pub fn set_priority(&mut self, priority: i32) {
        self.priority = priority;
        self.touch();
    }

    /// Whether the rule fires for a behavior score.
    pub fn applies_to(&self, score: f64) -> bool {
        self.active && score >= self.threshold
    }

    /// Versioned record form.
    pub fn to_record(&self) -> RuleRecord {
        self.clone().into()
    }

    /// Rebuild a rule from its record form.
    pub fn from_record(record: RuleRecord) -> Self {
        record.into()
    }
}

fn clamp_threshold(threshold: f64) -> f64 {
    if threshold.is_nan() {
        1.0
    } else {
        threshold.clamp(0.0, 1.0)
    }
}

/// Persisted form of a rule. Every field has a default so partial or older
/// records still load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleRecord {
    pub version: u32,
    pub id: String,
    pub name: String,
    pub description: String,
    pub max_attempts: u64,
    pub window_secs: u64,
    pub threshold: f64,
    pub conditions: HashMap<String, Value>,
    pub active: bool,
    pub priority: i32,
    pub last_modified: Option<DateTime<Utc>>,
}

impl Default for RuleRecord {
    fn default() -> Self {
        Self {
            version: RULE_RECORD_VERSION,
            id: String::new(),
            name: String::new(),
            description: String::new(),
            max_attempts: 1,
            window_secs: 60,
            threshold: 1.0,
            conditions: HashMap::new(),
            active: true,
            priority: 0,
            last_modified: None,
        }
    }
}

impl From<RateLimiterRule> for RuleRecord {
    fn from(rule: RateLimiterRule) -> Self {
        Self {
            version: RULE_RECORD_VERSION,
            id: rule.id,
            name: rule.name,
            description: rule.description,
            max_attempts: rule.max_attempts,
            window_secs: rule.window_secs,
            threshold: rule.threshold,
            conditions: rule.conditions,
            active: rule.active,
            priority: rule.priority,
            last_modified: Some(rule.last_modified),
        }
    }
}

impl From<RuleRecord> for RateLimiterRule {
    fn from(record: RuleRecord) -> Self {
        let id = if record.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            record.id
        };
        Self {
            id,
            name: record.name,
            description: record.description,
            max_attempts: record.max_attempts.max(1),
            window_secs: record.window_secs.max(1),
            threshold: clamp_threshold(record.threshold),
            conditions: record.conditions,
            active: record.active,
            priority: record.priority,
            last_modified: record.last_modified.unwrap_or_else(Utc::now),
        }
    }
}

/// A collection of rules for one limiter key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub rules: Vec<RateLimiterRule>,
}

impl RuleSet {
    /// Wrap a list of rules.
    pub fn new(rules: Vec<RateLimiterRule>) -> Self {
        Self { rules }
    }

    /// Default rules for a key type, scaled from the nominal limit.
    pub fn defaults(key_type: KeyType, nominal_max: u64, window_secs: u64) -> Self {
        let scaled = |fraction: f64| ((nominal_max as f64 * fraction).floor() as u64).max(1);
        let rule = |name: &str, fraction: f64, threshold: f64, priority: i32, description: &str| {
            RateLimiterRule::new(name, scaled(fraction), window_secs, threshold)
                .with_id(format!("{}_{}", key_type, name))
                .with_description(description)
                .with_priority(priority)
        };

        let mut rules = vec![
            rule(
                "suspicious_activity",
                0.5,
                0.75,
                100,
                "Halve the limit for highly anomalous traffic",
            ),
            rule(
                "burst_traffic",
                0.7,
                0.6,
                80,
                "Tighten the limit during request bursts",
            ),
        ];

        match key_type {
            KeyType::Ip => rules.push(
                rule(
                    "multiple_account_creation",
                    0.3,
                    0.8,
                    90,
                    "Throttle addresses creating many accounts",
                )
                .with_condition("action", "register"),
            ),
            KeyType::User => rules.push(rule(
                "rapid_account_activity",
                0.6,
                0.7,
                85,
                "Throttle accounts acting faster than a person can",
            )),
            KeyType::Endpoint => rules.push(rule(
                "endpoint_abuse",
                0.4,
                0.65,
                95,
                "Protect endpoints hammered by automated clients",
            )),
            KeyType::Custom => {}
        }

        Self { rules }
    }

    /// Load rules from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limiter rules");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load rules from YAML: either a bare list or a `rules:` mapping.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        if let Ok(rules) = serde_yaml::from_str::<Vec<RateLimiterRule>>(yaml) {
            return Ok(Self { rules });
        }

        serde_yaml::from_str(yaml)
            .map_err(|e| SwarmGuardError::Config(format!("Failed to parse rules: {}", e)))
    }

    /// Rules ordered by descending priority, then name.
    pub fn sorted(&self) -> Vec<RateLimiterRule> {
        let mut rules = self.rules.clone();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority).then_with(|| a.name.cmp(&b.name)));
        rules
    }

    /// Active rules whose threshold the score reaches, by descending priority.
    pub fn applicable(&self, score: f64) -> Vec<RateLimiterRule> {
        self.sorted()
            .into_iter()
            .filter(|r| r.applies_to(score))
            .collect()
    }

    /// The applicable rule with the lowest limit; higher priority wins ties.
    pub fn strictest(&self, score: f64) -> Option<RateLimiterRule> {
        self.applicable(score)
            .into_iter()
            .fold(None, |best: Option<RateLimiterRule>, rule| match best {
                Some(b) if b.max_attempts <= rule.max_attempts => Some(b),
                _ => Some(rule),
            })
    }

    /// Effective limit for a score, never above `nominal_max`.
    pub fn adjusted_limit(&self, nominal_max: u64, score: f64) -> u64 {
        match self.strictest(score) {
            Some(rule) => rule.max_attempts.min(nominal_max),
            None => nominal_max,
        }
    }

    fn upsert(&mut self, rule: RateLimiterRule) {
        match self.rules.iter_mut().find(|r| r.id == rule.id) {
            Some(existing) => *existing = rule,
            None => self.rules.push(rule),
        }
    }
}

/// Partial update applied through the rule setters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleUpdate {
    pub name: Option<String>,
    pub description: Option<String>,
    pub max_attempts: Option<u64>,
    pub window_secs: Option<u64>,
    pub threshold: Option<f64>,
    pub conditions: Option<HashMap<String, Value>>,
    pub active: Option<bool>,
    pub priority: Option<i32>,
}

impl RuleUpdate {
    /// Apply to a rule and return the names of the fields that were set.
    fn apply(self, rule: &mut RateLimiterRule) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if let Some(name) = self.name {
            rule.set_name(name);
            changed.push("name");
        }
        if let Some(description) = self.description {
            rule.set_description(description);
            changed.push("description");
        }
        if let Some(max_attempts) = self.max_attempts {
            rule.set_max_attempts(max_attempts);
            changed.push("max_attempts");
        }
        if let Some(window_secs) = self.window_secs {
            rule.set_window_secs(window_secs);
            changed.push("window_secs");
        }
        if let Some(threshold) = self.threshold {
            rule.set_threshold(threshold);
            changed.push("threshold");
        }
        if let Some(conditions) = self.conditions {
            rule.set_conditions(conditions);
            changed.push("conditions");
        }
        if let Some(active) = self.active {
            rule.set_active(active);
            changed.push("active");
        }
        if let Some(priority) = self.priority {
            rule.set_priority(priority);
            changed.push("priority");
        }
        changed
    }
}

/// Rule evaluation and management for one limiter key.
///
/// The rule set is cached in the shared store for [`RULES_TTL_SECS`] and
/// rehydrated lazily: the store copy is preferred, then the last copy this
/// engine saw, then the defaults for the key type.
pub struct RuleEngine {
    store: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    audit: Arc<dyn AuditSink>,
    key: RateLimitKey,
    nominal_max: u64,
    window_secs: u64,
    extra_rules: Vec<RateLimiterRule>,
    local: RwLock<Option<RuleSet>>,
}

impl RuleEngine {
    /// Create an engine for `key`. Rule changes are stamped with `clock`.
    pub fn new(
        store: Arc<dyn CacheBackend>,
        clock: Arc<dyn Clock>,
        audit: Arc<dyn AuditSink>,
        key: RateLimitKey,
        nominal_max: u64,
        window_secs: u64,
    ) -> Self {
        Self {
            store,
            clock,
            audit,
            key,
            nominal_max: nominal_max.max(1),
            window_secs: window_secs.max(1),
            extra_rules: Vec::new(),
            local: RwLock::new(None),
        }
    }

    /// Rules seeded alongside the defaults when no cached set exists.
    pub fn with_extra_rules(mut self, rules: Vec<RateLimiterRule>) -> Self {
        self.extra_rules = rules;
        self
    }

    fn cache_key(&self) -> String {
        format!("rate_limiter_rules:{}", self.key.tracking_id())
    }

    fn seed(&self) -> RuleSet {
        let mut set = RuleSet::defaults(self.key.key_type(), self.nominal_max, self.window_secs);
        let now = self.clock.now_utc();
        for rule in &mut set.rules {
            rule.touch_at(now);
        }
        for rule in &self.extra_rules {
            set.upsert(rule.clone());
        }
        set
    }

    async fn persist(&self, set: &RuleSet) -> Result<()> {
        set_json(self.store.as_ref(), &self.cache_key(), &set.rules, Some(RULES_TTL_SECS)).await?;
        *self.local.write() = Some(set.clone());
        Ok(())
    }

    /// The current rule set, rehydrating it if the cached copy expired.
    pub async fn rule_set(&self) -> RuleSet {
        match get_json::<Vec<RateLimiterRule>>(self.store.as_ref(), &self.cache_key()).await {
            Ok(Some(rules)) => {
                let set = RuleSet::new(rules);
                *self.local.write() = Some(set.clone());
                return set;
            }
            Ok(None) => {}
            Err(e) => debug!(key = %self.key, error = %e, "Cached rule set unreadable"),
        }

        let local = self.local.read().clone();
        let set = local.unwrap_or_else(|| self.seed());
        if let Err(e) = self.persist(&set).await {
            warn!(key = %self.key, error = %e, "Failed to cache rule set");
            *self.local.write() = Some(set.clone());
        }
        set
    }

    /// Add a rule, replacing any rule with the same id.
    pub async fn add_rule(&self, mut rule: RateLimiterRule) -> Result<()> {
        let mut set = self.rule_set().await;
        let now = self.clock.now_utc();
        rule.touch_at(now);
        let event = AuditEvent::new(CATEGORY_RULES, "rule_added", Severity::Info)
            .at(now)
            .with("key", self.key.cache_key())
            .with("rule_id", rule.id.clone())
            .with("rule_name", rule.name.clone())
            .with("max_attempts", rule.max_attempts)
            .with("threshold", rule.threshold);
        set.upsert(rule);
        self.persist(&set).await?;
        audit::emit(self.audit.as_ref(), event);
        Ok(())
    }

    /// Remove a rule by id. Returns whether it existed.
    pub async fn remove_rule(&self, id: &str) -> Result<bool> {
        let mut set = self.rule_set().await;
        let before = set.rules.len();
        set.rules.retain(|r| r.id != id);
        if set.rules.len() == before {
            return Ok(false);
        }
        self.persist(&set).await?;
        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(CATEGORY_RULES, "rule_removed", Severity::Warning)
                .at(self.clock.now_utc())
                .with("key", self.key.cache_key())
                .with("rule_id", id),
        );
        Ok(true)
    }

    /// Apply an update to a rule. Returns the updated rule, or `None` if absent.
    pub async fn update_rule(&self, id: &str, update: RuleUpdate) -> Result<Option<RateLimiterRule>> {
        let mut set = self.rule_set().await;
        let Some(rule) = set.rules.iter_mut().find(|r| r.id == id) else {
            return Ok(None);
        };
        let now = self.clock.now_utc();
        let changed = update.apply(rule);
        if !changed.is_empty() {
            rule.touch_at(now);
        }
        let updated = rule.clone();
        self.persist(&set).await?;

        audit::emit(
            self.audit.as_ref(),
            AuditEvent::new(CATEGORY_RULES, "rule_updated", Severity::Info)
                .at(now)
                .with("key", self.key.cache_key())
                .with("rule_id", id)
                .with("fields", changed),
        );
        Ok(Some(updated))
    }

    /// All rules by descending priority.
    pub async fn list_rules(&self) -> Vec<RateLimiterRule> {
        self.rule_set().await.sorted()
    }

    /// Active rules the score reaches, by descending priority.
    pub async fn applicable_rules(&self, score: f64) -> Vec<RateLimiterRule> {
        self.rule_set().await.applicable(score)
    }

    /// The applicable rule with the lowest limit.
    pub async fn strictest_rule(&self, score: f64) -> Option<RateLimiterRule> {
        self.rule_set().await.strictest(score)
    }

    /// Effective limit for a score, never above `nominal_max`.
    pub async fn adjusted_limit(&self, nominal_max: u64, score: f64) -> u64 {
        self.rule_set().await.adjusted_limit(nominal_max, score)
    }
}
