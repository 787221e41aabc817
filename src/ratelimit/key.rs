//! Rate limit key generation and handling.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::SwarmGuardError;

/// The kind of identity a limit is tracked under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyType {
    Ip,
    User,
    Endpoint,
    Custom,
}

impl KeyType {
    /// Lowercase name used in cache keys.
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyType::Ip => "ip",
            KeyType::User => "user",
            KeyType::Endpoint => "endpoint",
            KeyType::Custom => "custom",
        }
    }
}

impl FromStr for KeyType {
    type Err = SwarmGuardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "ip" => Ok(KeyType::Ip),
            "user" => Ok(KeyType::User),
            "endpoint" => Ok(KeyType::Endpoint),
            "custom" => Ok(KeyType::Custom),
            other => Err(SwarmGuardError::Config(format!("unknown key type: {}", other))),
        }
    }
}

impl std::fmt::Display for KeyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key that uniquely identifies a rate limited identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RateLimitKey {
    key_type: KeyType,
    identifier: String,
}

impl RateLimitKey {
    /// Create a key of any type.
    pub fn new(key_type: KeyType, identifier: impl Into<String>) -> Self {
        Self {
            key_type,
            identifier: identifier.into(),
        }
    }

    /// Key for a client address.
    pub fn ip(addr: impl Into<String>) -> Self {
        Self::new(KeyType::Ip, addr)
    }

    /// Key for an account.
    pub fn user(id: impl Into<String>) -> Self {
        Self::new(KeyType::User, id)
    }

    /// Key for a route or endpoint.
    pub fn endpoint(path: impl Into<String>) -> Self {
        Self::new(KeyType::Endpoint, path)
    }

    /// Key for any other identity.
    pub fn custom(name: impl Into<String>) -> Self {
        Self::new(KeyType::Custom, name)
    }

    /// The key's type.
    pub fn key_type(&self) -> KeyType {
        self.key_type
    }

    /// The raw identifier.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Namespaced cache key holding the attempt window.
    pub fn cache_key(&self) -> String {
        format!("rate_limit:{}:{}", self.key_type, self.identifier)
    }

    /// Identity under which behavior is profiled.
    pub fn tracking_id(&self) -> String {
        format!("{}:{}", self.key_type, self.identifier)
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.cache_key())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cache_key_format() {
        let key = RateLimitKey::ip("10.0.0.1");
        assert_eq!(key.cache_key(), "rate_limit:ip:10.0.0.1");
        assert_eq!(key.tracking_id(), "ip:10.0.0.1");
        assert_eq!(key.to_string(), "rate_limit:ip:10.0.0.1");
    }

    #[test]
    fn test_constructors() {
        assert_eq!(RateLimitKey::user("42").key_type(), KeyType::User);
        assert_eq!(RateLimitKey::endpoint("/login").cache_key(), "rate_limit:endpoint:/login");
        assert_eq!(RateLimitKey::custom("batch").identifier(), "batch");
    }

    #[test]
    fn test_key_type_parsing() {
        assert_eq!("IP".parse::<KeyType>().unwrap(), KeyType::Ip);
        assert_eq!("endpoint".parse::<KeyType>().unwrap(), KeyType::Endpoint);
        assert!("planet".parse::<KeyType>().is_err());
    }

    #[test]
    fn test_key_equality() {
        assert_eq!(RateLimitKey::user("a"), RateLimitKey::user("a"));
        assert_ne!(RateLimitKey::user("a"), RateLimitKey::ip("a"));
    }
}
