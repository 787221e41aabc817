//! Behavior profiling and anomaly scoring.
//!
//! A profile keeps the last [`MAX_INTERVALS`] gaps between admitted requests
//! for one tracking identity. Once enough gaps are known, their statistics
//! produce a raw anomaly signal which is folded into the persisted score with
//! an exponential moving average.
//!
//! The scoring is a fixed statistical heuristic. The optional advanced pass
//! layers more heuristics on top; neither involves a trained model.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace};

use crate::config::BehaviorConfig;
use crate::error::Result;
use crate::store::{get_json, set_json, CacheBackend};

/// Score reported for identities without a usable profile.
pub const NEUTRAL_SCORE: f64 = 0.25;

/// Capacity of the interval ring buffer.
pub const MAX_INTERVALS: usize = 20;

/// Intervals required before statistics and scoring kick in.
const MIN_INTERVALS: usize = 5;

/// Gaps shorter than this count as rapid.
const RAPID_INTERVAL_SECS: f64 = 1.0;

/// Weight of the previous score in the moving average.
const SMOOTHING: f64 = 0.7;

const PROFILE_VERSION: u32 = 1;

/// Rolling statistics for one tracking identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BehaviorProfile {
    pub version: u32,
    pub request_count: u64,
    pub first_seen: f64,
    pub last_seen: f64,
    pub last_request_time: Option<f64>,
    pub intervals: VecDeque<f64>,
    pub avg_interval: f64,
    pub interval_variance: f64,
    pub rapid_request_ratio: f64,
    pub request_rate: f64,
    pub anomaly_score: f64,
    pub user_agent: Option<String>,
}

impl Default for BehaviorProfile {
    fn default() -> Self {
        Self {
            version: PROFILE_VERSION,
            request_count: 0,
            first_seen: 0.0,
            last_seen: 0.0,
            last_request_time: None,
            intervals: VecDeque::with_capacity(MAX_INTERVALS),
            avg_interval: 0.0,
            interval_variance: 0.0,
            rapid_request_ratio: 0.0,
            request_rate: 0.0,
            anomaly_score: NEUTRAL_SCORE,
            user_agent: None,
        }
    }
}

impl BehaviorProfile {
    /// A fresh profile first seen at `now`.
    pub fn new(now: f64) -> Self {
        Self {
            first_seen: now,
            last_seen: now,
            ..Self::default()
        }
    }

    /// Whether enough intervals exist for statistics and scoring.
    pub fn is_established(&self) -> bool {
        self.intervals.len() >= MIN_INTERVALS
    }

    /// Record one admitted request and refresh the derived statistics.
    /// The anomaly score is left untouched.
    pub fn record_request(&mut self, now: f64, user_agent: Option<&str>) {
        self.request_count = self.request_count.saturating_add(1);
        self.last_seen = now;
        if let Some(ua) = user_agent {
            self.user_agent = Some(ua.to_string());
        }

        if let Some(previous) = self.last_request_time {
            if self.intervals.len() == MAX_INTERVALS {
                self.intervals.pop_front();
            }
            self.intervals.push_back((now - previous).max(0.0));
        }
        self.last_request_time = Some(now);

        let elapsed = (now - self.first_seen).max(1.0);
        self.request_rate = self.request_count as f64 / elapsed;

        if self.is_established() {
            let n = self.intervals.len() as f64;
            let mean = self.intervals.iter().sum::<f64>() / n;
            let variance = self.intervals.iter().map(|i| (i - mean).powi(2)).sum::<f64>() / n;
            let rapid = self
                .intervals
                .iter()
                .filter(|i| **i < RAPID_INTERVAL_SECS)
                .count() as f64;

            self.avg_interval = mean;
            self.interval_variance = variance;
            self.rapid_request_ratio = rapid / n;
        }
    }

    /// Anomaly signal from the current statistics, in [0, 1].
    pub fn raw_signal(&self) -> f64 {
        let mut signal = 0.4 * self.rapid_request_ratio;

        // Machine-regular and fast
        if self.interval_variance < 0.1 && self.avg_interval < 2.0 {
            signal += 0.3;
        }

        if self.request_rate > 0.2 {
            signal += (self.request_rate * 0.5).min(0.3);
        }

        clamp_score(signal)
    }

    /// Extra heuristic checks used by the advanced pass, in [0, 1].
    pub fn heuristic_signal(&self) -> f64 {
        let mut additional = 0.0;
        if self.rapid_request_ratio > 0.6 {
            additional += 0.15;
        }
        if self.interval_variance < 0.05 {
            additional += 0.2;
        }
        if self.request_rate > 0.5 {
            additional += (self.request_rate * 0.25).min(0.25);
        }
        clamp_score(additional)
    }

    /// Repair values that fell out of range, dropping the profile when it is
    /// beyond repair.
    fn sanitized(mut self) -> Option<Self> {
        let floats = [
            self.first_seen,
            self.last_seen,
            self.avg_interval,
            self.interval_variance,
            self.rapid_request_ratio,
            self.request_rate,
            self.anomaly_score,
        ];
        if floats.iter().any(|f| !f.is_finite()) || self.version > PROFILE_VERSION {
            return None;
        }

        self.anomaly_score = clamp_score(self.anomaly_score);
        self.intervals.retain(|i| i.is_finite() && *i >= 0.0);
        while self.intervals.len() > MAX_INTERVALS {
            self.intervals.pop_front();
        }
        Some(self)
    }
}

/// Historical score record kept separately from the profile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalySnapshot {
    pub score: f64,
    pub request_count: u64,
    pub recorded_at: f64,
}

fn clamp_score(score: f64) -> f64 {
    if score.is_nan() {
        NEUTRAL_SCORE
    } else {
        score.clamp(0.0, 1.0)
    }
}

fn profile_key(tracking_id: &str) -> String {
    format!("behavior_profile:{}", tracking_id)
}

fn snapshot_key(tracking_id: &str) -> String {
    format!("anomaly_score:{}", tracking_id)
}

/// Maintains behavior profiles in the shared store.
pub struct BehaviorProfiler {
    store: Arc<dyn CacheBackend>,
    config: BehaviorConfig,
}

impl BehaviorProfiler {
    /// Create a profiler over `store`.
    pub fn new(store: Arc<dyn CacheBackend>, config: BehaviorConfig) -> Self {
        Self { store, config }
    }

    /// Load a profile. Missing, unreadable and corrupt profiles are all `None`.
    pub async fn profile(&self, tracking_id: &str) -> Option<BehaviorProfile> {
        match get_json::<BehaviorProfile>(self.store.as_ref(), &profile_key(tracking_id)).await {
            Ok(profile) => profile.and_then(BehaviorProfile::sanitized),
            Err(e) => {
                debug!(tracking_id = %tracking_id, error = %e, "Ignoring unreadable behavior profile");
                None
            }
        }
    }

    /// Current anomaly score for an identity.
    pub async fn score(&self, tracking_id: &str) -> f64 {
        self.profile(tracking_id)
            .await
            .map(|p| p.anomaly_score)
            .unwrap_or(NEUTRAL_SCORE)
    }

    /// Latest persisted score snapshot.
    pub async fn last_snapshot(&self, tracking_id: &str) -> Option<AnomalySnapshot> {
        get_json(self.store.as_ref(), &snapshot_key(tracking_id))
            .await
            .ok()
            .flatten()
    }

    /// Fold an admitted request into the profile and return the new score.
    pub async fn record_success(
        &self,
        tracking_id: &str,
        now: f64,
        user_agent: Option<&str>,
    ) -> Result<f64> {
        let mut profile = self
            .profile(tracking_id)
            .await
            .unwrap_or_else(|| BehaviorProfile::new(now));
        profile.record_request(now, user_agent);

        if profile.is_established() {
            let mut raw = profile.raw_signal();
            if self.config.advanced_analysis {
                raw = clamp_score(0.7 * raw + 0.3 * profile.heuristic_signal());
            }
            let previous = profile.anomaly_score;
            profile.anomaly_score = clamp_score(SMOOTHING * previous + (1.0 - SMOOTHING) * raw);

            trace!(
                tracking_id = %tracking_id,
                raw = raw,
                previous = previous,
                score = profile.anomaly_score,
                "Anomaly score updated"
            );
        }

        set_json(
            self.store.as_ref(),
            &profile_key(tracking_id),
            &profile,
            Some(self.config.profile_ttl_secs),
        )
        .await?;

        let snapshot = AnomalySnapshot {
            score: profile.anomaly_score,
            request_count: profile.request_count,
            recorded_at: now,
        };
        set_json(
            self.store.as_ref(),
            &snapshot_key(tracking_id),
            &snapshot,
            Some(self.config.score_history_ttl_secs),
        )
        .await?;

        Ok(profile.anomaly_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;

    fn profiler(advanced: bool) -> (Arc<MemoryStore>, BehaviorProfiler) {
        let clock = Arc::new(ManualClock::new(0.0));
        let store = Arc::new(MemoryStore::with_clock(clock));
        let config = BehaviorConfig {
            advanced_analysis: advanced,
            ..BehaviorConfig::default()
        };
        (store.clone(), BehaviorProfiler::new(store, config))
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    /// A profile with the given statistics and nothing else.
    fn stats(rapid: f64, variance: f64, avg: f64, rate: f64) -> BehaviorProfile {
        BehaviorProfile {
            rapid_request_ratio: rapid,
            interval_variance: variance,
            avg_interval: avg,
            request_rate: rate,
            ..BehaviorProfile::new(0.0)
        }
    }

    /// Feed `count` admitted requests spaced 0.3s apart and return each score.
    async fn rapid_scores(profiler: &BehaviorProfiler, id: &str, count: usize) -> Vec<f64> {
        let mut scores = Vec::new();
        for i in 0..count {
            scores.push(profiler.record_success(id, i as f64 * 0.3, None).await.unwrap());
        }
        scores
    }

    #[test]
    fn test_interval_buffer_is_bounded() {
        let mut profile = BehaviorProfile::new(0.0);
        for i in 0..50 {
            profile.record_request(i as f64 * 2.0, None);
        }
        assert_eq!(profile.intervals.len(), MAX_INTERVALS);
        assert_eq!(profile.request_count, 50);
    }

    #[test]
    fn test_oldest_interval_dropped_first() {
        let mut profile = BehaviorProfile::new(0.0);
        let mut now = 0.0;
        profile.record_request(now, None);
        // First gap is distinctive, the rest are 1s
        now += 9.0;
        profile.record_request(now, None);
        for _ in 0..MAX_INTERVALS {
            now += 1.0;
            profile.record_request(now, None);
        }
        assert!(profile.intervals.iter().all(|i| *i == 1.0));
    }

    #[test]
    fn test_uniform_rapid_intervals() {
        let mut profile = BehaviorProfile::new(0.0);
        for i in 0..=20 {
            profile.record_request(i as f64 * 0.3, None);
        }
        assert_eq!(profile.intervals.len(), 20);
        assert_eq!(profile.rapid_request_ratio, 1.0);
        assert!(profile.interval_variance < 1e-9);
        assert_close(profile.avg_interval, 0.3);
        assert_close(profile.request_rate, 3.5);
        assert_close(profile.raw_signal(), 1.0);
        assert_close(profile.heuristic_signal(), 0.6);
    }

    #[test]
    fn test_raw_signal_weights() {
        // Rapid ratio alone
        assert_close(stats(0.5, 1.0, 5.0, 0.1).raw_signal(), 0.2);
        // Regular and fast
        assert_close(stats(0.0, 0.05, 1.0, 0.1).raw_signal(), 0.3);
        assert_close(stats(0.0, 0.05, 2.0, 0.1).raw_signal(), 0.0);
        assert_close(stats(0.0, 0.1, 1.0, 0.1).raw_signal(), 0.0);
        // Rate term, then its cap
        assert_close(stats(0.0, 1.0, 5.0, 0.2).raw_signal(), 0.0);
        assert_close(stats(0.0, 1.0, 5.0, 0.4).raw_signal(), 0.2);
        assert_close(stats(0.0, 1.0, 5.0, 0.9).raw_signal(), 0.3);
        // All three
        assert_close(stats(0.5, 0.05, 1.0, 0.4).raw_signal(), 0.7);
    }

    #[test]
    fn test_heuristic_signal_weights() {
        assert_close(stats(0.7, 1.0, 5.0, 0.1).heuristic_signal(), 0.15);
        assert_close(stats(0.6, 1.0, 5.0, 0.1).heuristic_signal(), 0.0);
        assert_close(stats(0.0, 0.04, 5.0, 0.1).heuristic_signal(), 0.2);
        assert_close(stats(0.0, 0.05, 5.0, 0.1).heuristic_signal(), 0.0);
        assert_close(stats(0.0, 1.0, 5.0, 0.5).heuristic_signal(), 0.0);
        assert_close(stats(0.0, 1.0, 5.0, 0.6).heuristic_signal(), 0.15);
        assert_close(stats(0.0, 1.0, 5.0, 2.0).heuristic_signal(), 0.25);
        assert_close(stats(0.7, 0.04, 5.0, 0.6).heuristic_signal(), 0.5);
    }

    #[test]
    fn test_stats_wait_for_enough_intervals() {
        let mut profile = BehaviorProfile::new(0.0);
        for i in 0..4 {
            profile.record_request(i as f64 * 0.1, None);
        }
        assert!(!profile.is_established());
        assert_eq!(profile.rapid_request_ratio, 0.0);
    }

    #[test]
    fn test_pathological_inputs_stay_in_range() {
        let mut profile = BehaviorProfile::new(0.0);
        profile.request_count = u64::MAX - 1;
        for _ in 0..30 {
            profile.record_request(0.0, None);
        }
        assert!((0.0..=1.0).contains(&profile.raw_signal()));
        assert!((0.0..=1.0).contains(&profile.heuristic_signal()));

        // Clock moving backwards yields zero-length gaps
        profile.record_request(-100.0, None);
        assert!(profile.intervals.iter().all(|i| *i >= 0.0));
    }

    #[tokio::test]
    async fn test_smoothing_step_is_exact() {
        let (_store, profiler) = profiler(false);
        let scores = rapid_scores(&profiler, "ip:9.9.9.9", 7).await;

        // Five intervals are needed before the prior moves
        for score in &scores[..5] {
            assert_eq!(*score, NEUTRAL_SCORE);
        }

        // Sixth request: 5 gaps of 0.3s, rate 6 / 1.5s, raw 1.0
        let profile = profiler.profile("ip:9.9.9.9").await.unwrap();
        assert_close(profile.request_rate, 4.0);
        assert_close(profile.raw_signal(), 1.0);
        assert_close(scores[5], 0.7 * NEUTRAL_SCORE + 0.3 * 1.0);
        assert_close(scores[5], 0.475);
        assert_close(scores[6], 0.7 * 0.475 + 0.3 * 1.0);

        let snapshot = profiler.last_snapshot("ip:9.9.9.9").await.unwrap();
        assert_close(snapshot.score, scores[6]);
        assert_eq!(snapshot.request_count, 7);
    }

    #[tokio::test]
    async fn test_advanced_blend_is_exact() {
        let (_store, profiler) = profiler(true);
        let scores = rapid_scores(&profiler, "user:blend", 6).await;

        let profile = profiler.profile("user:blend").await.unwrap();
        let raw = profile.raw_signal();
        let additional = profile.heuristic_signal();
        assert_close(raw, 1.0);
        assert_close(additional, 0.6);

        let blended = 0.7 * raw + 0.3 * additional;
        assert_close(scores[5], 0.7 * NEUTRAL_SCORE + 0.3 * blended);
        assert_close(scores[5], 0.439);
    }

    #[tokio::test]
    async fn test_missing_profile_is_neutral() {
        let (_store, profiler) = profiler(false);
        assert_eq!(profiler.score("ip:1.2.3.4").await, NEUTRAL_SCORE);
    }

    #[tokio::test]
    async fn test_corrupt_profile_is_neutral() {
        let (store, profiler) = profiler(false);
        store
            .set("behavior_profile:ip:1.2.3.4", "{not json", None)
            .await
            .unwrap();
        assert_eq!(profiler.score("ip:1.2.3.4").await, NEUTRAL_SCORE);

        store
            .set("behavior_profile:ip:1.2.3.4", r#"{"anomaly_score": 7.5}"#, None)
            .await
            .unwrap();
        assert_eq!(profiler.score("ip:1.2.3.4").await, 1.0);

        // A corrupt profile is replaced on the next update
        store
            .set("behavior_profile:ip:1.2.3.4", "42", None)
            .await
            .unwrap();
        let score = profiler.record_success("ip:1.2.3.4", 10.0, None).await.unwrap();
        assert_eq!(score, NEUTRAL_SCORE);
        assert_eq!(profiler.profile("ip:1.2.3.4").await.unwrap().request_count, 1);
    }

    #[tokio::test]
    async fn test_missing_fields_are_defaulted() {
        let (store, profiler) = profiler(false);
        store
            .set("behavior_profile:user:7", r#"{"request_count": 3}"#, None)
            .await
            .unwrap();
        let profile = profiler.profile("user:7").await.unwrap();
        assert_eq!(profile.request_count, 3);
        assert_eq!(profile.anomaly_score, NEUTRAL_SCORE);
        assert!(profile.intervals.is_empty());
    }

    #[tokio::test]
    async fn test_burst_raises_score_smoothly() {
        let (_store, profiler) = profiler(false);
        let id = "ip:9.9.9.9";

        let mut previous = NEUTRAL_SCORE;
        let mut now = 0.0;
        for _ in 0..=MIN_INTERVALS {
            previous = profiler.record_success(id, now, Some("bot/1.0")).await.unwrap();
            now += 0.3;
        }
        let next = profiler.record_success(id, now, Some("bot/1.0")).await.unwrap();

        assert!(next > previous);
        // A single update moves at most 30% of the distance
        assert!(next - previous <= 0.3 + 1e-9);

        let profile = profiler.profile(id).await.unwrap();
        assert_eq!(profile.user_agent.as_deref(), Some("bot/1.0"));

        let snapshot = profiler.last_snapshot(id).await.unwrap();
        assert_eq!(snapshot.score, next);
        assert_eq!(snapshot.request_count, profile.request_count);
    }

    #[tokio::test]
    async fn test_slow_regular_traffic_decays_score() {
        let (_store, profiler) = profiler(false);
        let id = "user:calm";
        let mut score = NEUTRAL_SCORE;
        for i in 0..30 {
            // Irregular gaps between 10 and 40 seconds
            let now = i as f64 * 25.0 + if i % 2 == 0 { 0.0 } else { 15.0 };
            score = profiler.record_success(id, now, None).await.unwrap();
        }
        assert!(score < NEUTRAL_SCORE);
        assert!(score >= 0.0);
    }

    #[tokio::test]
    async fn test_advanced_analysis_stays_in_range() {
        let (_store, profiler) = profiler(true);
        let id = "endpoint:/login";
        for i in 0..100 {
            let score = profiler.record_success(id, i as f64 * 0.01, None).await.unwrap();
            assert!((0.0..=1.0).contains(&score));
        }
        assert!(profiler.score(id).await > NEUTRAL_SCORE);
    }

    #[tokio::test]
    async fn test_profile_expiry_is_set() {
        let (store, profiler) = profiler(false);
        profiler.record_success("ip:a", 0.0, None).await.unwrap();
        assert_eq!(store.ttl("behavior_profile:ip:a").await.unwrap(), Some(86_400));
        assert_eq!(store.ttl("anomaly_score:ip:a").await.unwrap(), Some(604_800));
    }
}
