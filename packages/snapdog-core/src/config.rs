//! The immutable configuration value the core consumes (SPEC_FULL.md §6).
//!
//! Loading this value from CLI flags, a config file and environment overrides
//! is an external collaborator's job (`apps/snapdog-server::config`); this
//! module only defines the shape the core itself is built against.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::model::{ClientIndex, ZoneIndex};
use crate::policy::{Backoff, RetryPolicy};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ZoneConfig {
    pub index: ZoneIndex,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientConfig {
    pub index: ClientIndex,
    pub name: String,
    pub mac: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapcastConfig {
    pub host: String,
    pub json_rpc_port: u16,
    pub websocket_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MqttConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive_secs: u16,
    pub base_topic: String,
}

/// Which side of a telegram a [`KnxGroupMapping`] describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum KnxEntity {
    Zone,
    Client,
}

/// The handful of zone/client facts wired onto the bus; DPT per SPEC_FULL.md
/// §6 ("1.001 boolean, 5.001 0-100%"): `Volume` is scaled, `Mute`/`Playback`
/// are boolean.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "camelCase")]
pub enum KnxSignal {
    Volume,
    Mute,
    Playback,
}

/// One entry of the declarative group-address map (SPEC_FULL.md §4.12/§6:
/// "group-address map declared per command/status").
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnxGroupMapping {
    pub entity: KnxEntity,
    pub index: u32,
    pub signal: KnxSignal,
    pub address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KnxConfig {
    pub gateway: String,
    pub port: u16,
    #[serde(default)]
    pub group_addresses: Vec<KnxGroupMapping>,
}

/// Resilience policy knobs, shaped exactly as SPEC_FULL.md §6 names them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResiliencePolicyConfig {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff: BackoffConfig,
    pub use_jitter: bool,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffConfig {
    Exponential,
    Linear,
    Constant,
}

impl From<ResiliencePolicyConfig> for RetryPolicy {
    fn from(cfg: ResiliencePolicyConfig) -> Self {
        RetryPolicy {
            max_attempts: cfg.max_retries,
            base_delay: Duration::from_millis(cfg.base_delay_ms),
            max_delay: Duration::from_millis(cfg.max_delay_ms),
            backoff: match cfg.backoff {
                BackoffConfig::Exponential => Backoff::Exponential,
                BackoffConfig::Linear => Backoff::Linear,
                BackoffConfig::Constant => Backoff::Constant,
            },
            use_jitter: cfg.use_jitter,
            attempt_timeout: Some(Duration::from_secs(cfg.timeout_seconds)),
        }
    }
}

impl Default for ResiliencePolicyConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff: BackoffConfig::Exponential,
            use_jitter: true,
            timeout_seconds: 10,
        }
    }
}

/// The core's entire view of the world, assembled once at startup and never
/// mutated afterward (SPEC_FULL.md §1 Non-goals: no persistence, no
/// cross-broker consensus — configuration plus the Snapcast projection is the
/// whole of the core's state).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    pub base_topic: String,
    pub mqtt: MqttConfig,
    pub snapcast: SnapcastConfig,
    pub knx: KnxConfig,
    pub zones: Vec<ZoneConfig>,
    pub clients: Vec<ClientConfig>,
    pub resilience: ResiliencePolicyConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resilience_default_matches_startup_step_shape() {
        let cfg = ResiliencePolicyConfig::default();
        assert_eq!(cfg.max_retries, 5);
        assert_eq!(cfg.max_delay_ms, 30_000);
    }

    #[test]
    fn resilience_config_converts_to_retry_policy() {
        let cfg = ResiliencePolicyConfig::default();
        let policy: RetryPolicy = cfg.into();
        assert_eq!(policy.max_attempts, 5);
        assert!(matches!(policy.backoff, Backoff::Exponential));
    }
}
