//! Configuration types for the session layer.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{SessionError, SessionResult};

/// MQTT protocol version.
///
/// A version is identified on the wire by the protocol name / level pair
/// carried in CONNECT.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    /// MQTT 3.1
    #[serde(rename = "3.1")]
    V31,
    /// MQTT 3.1.1
    #[serde(rename = "3.1.1")]
    V311,
}

impl ProtocolVersion {
    /// Get the protocol name used in CONNECT.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::V31 => "MQIsdp",
            Self::V311 => "MQTT",
        }
    }

    /// Get the protocol level byte.
    #[must_use]
    pub fn level(&self) -> u8 {
        match self {
            Self::V31 => 3,
            Self::V311 => 4,
        }
    }

    /// Resolve the version a CONNECT announces, if the name/level pair is
    /// one we know.
    pub fn from_connect(name: &str, level: u8) -> Option<Self> {
        match (name, level) {
            ("MQIsdp", 3) => Some(Self::V31),
            ("MQTT", 4) => Some(Self::V311),
            _ => None,
        }
    }
}

/// Session layer configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Protocol versions a broker session accepts.
    pub versions: Vec<ProtocolVersion>,

    /// Keep-alive interval used when the caller does not pick one.
    #[serde(with = "humantime_serde")]
    pub default_keep_alive: Duration,

    /// Maximum client identifier length a broker session accepts.
    pub max_client_id_len: usize,

    /// Maximum subscriptions per session; filters beyond this are refused
    /// in the SUBACK rather than closing the session.
    pub max_subscriptions: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            versions: vec![ProtocolVersion::V311, ProtocolVersion::V31],
            default_keep_alive: Duration::from_secs(60),
            max_client_id_len: 256,
            max_subscriptions: 100,
        }
    }
}

impl SessionConfig {
    /// Parse a configuration from raw TOML.
    pub fn from_toml(raw: &str) -> SessionResult<Self> {
        toml::from_str(raw).map_err(|e| SessionError::Config(e.to_string()))
    }

    /// Whether the given protocol name/level pair is accepted.
    pub fn accepts_version(&self, name: &str, level: u8) -> bool {
        ProtocolVersion::from_connect(name, level)
            .map(|v| self.versions.contains(&v))
            .unwrap_or(false)
    }
}
