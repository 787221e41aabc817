//! Rate limiting: sliding windows, behavior profiling and adaptive rules.

mod adaptive;
mod behavior;
mod key;
mod rules;
mod window;

pub use adaptive::{AdaptiveLimiter, AttemptContext, Decision, DenialReason};
pub use behavior::{AnomalySnapshot, BehaviorProfile, BehaviorProfiler, MAX_INTERVALS, NEUTRAL_SCORE};
pub use key::{KeyType, RateLimitKey};
pub use rules::{RateLimiterRule, RuleEngine, RuleRecord, RuleSet, RuleUpdate, RULES_TTL_SECS};
pub use window::SlidingWindowCounter;
