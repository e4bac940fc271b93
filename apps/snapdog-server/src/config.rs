//! Server configuration.
//!
//! Supports loading from a YAML file with environment variable overrides,
//! then converting into [`snapdog_core::Config`] — the shape the core itself
//! is built against (SPEC_FULL.md §6).

use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;
use snapdog_core::config::{
    BackoffConfig, ClientConfig, KnxConfig, KnxGroupMapping, MqttConfig, ResiliencePolicyConfig,
    SnapcastConfig, ZoneConfig,
};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub base_topic: String,

    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_username: Option<String>,
    pub mqtt_password: Option<String>,
    pub mqtt_keep_alive_secs: u16,

    pub snapcast_host: String,
    pub snapcast_json_rpc_port: u16,
    pub snapcast_websocket_url: Option<String>,

    pub knx_gateway: String,
    pub knx_port: u16,
    pub knx_group_addresses: Vec<KnxGroupMapping>,

    pub zones: Vec<ZoneConfig>,
    pub clients: Vec<ClientConfig>,

    pub resilience_max_retries: u32,
    pub resilience_base_delay_ms: u64,
    pub resilience_max_delay_ms: u64,
    pub resilience_backoff: BackoffConfig,
    pub resilience_use_jitter: bool,
    pub resilience_timeout_seconds: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_topic: "snapdog".to_string(),
            mqtt_host: "localhost".to_string(),
            mqtt_port: 1883,
            mqtt_username: None,
            mqtt_password: None,
            mqtt_keep_alive_secs: 30,
            snapcast_host: "localhost".to_string(),
            snapcast_json_rpc_port: 1705,
            snapcast_websocket_url: None,
            knx_gateway: "localhost".to_string(),
            knx_port: 3671,
            knx_group_addresses: Vec::new(),
            zones: Vec::new(),
            clients: Vec::new(),
            resilience_max_retries: 5,
            resilience_base_delay_ms: 1_000,
            resilience_max_delay_ms: 30_000,
            resilience_backoff: BackoffConfig::Exponential,
            resilience_use_jitter: true,
            resilience_timeout_seconds: 10,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from an optional YAML file, then applies
    /// environment variable overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies the environment overrides named in SPEC_FULL.md §6.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SNAPDOG_BASE_TOPIC") {
            self.base_topic = val;
        }
        if let Ok(val) = std::env::var("SNAPDOG_MQTT_HOST") {
            self.mqtt_host = val;
        }
        if let Ok(val) = std::env::var("SNAPDOG_MQTT_PORT") {
            if let Ok(port) = val.parse() {
                self.mqtt_port = port;
            }
        }
        if let Ok(val) = std::env::var("SNAPDOG_SNAPCAST_HOST") {
            self.snapcast_host = val;
        }
        if let Ok(val) = std::env::var("SNAPDOG_SNAPCAST_JSONRPC_PORT") {
            if let Ok(port) = val.parse() {
                self.snapcast_json_rpc_port = port;
            }
        }
        if let Ok(val) = std::env::var("SNAPDOG_KNX_GATEWAY") {
            self.knx_gateway = val;
        }
        // SNAPDOG_LOG_LEVEL is read directly by main.rs's CLI default, not here.
    }

    /// Converts to `snapdog-core`'s [`snapdog_core::Config`] type.
    pub fn to_core_config(&self) -> snapdog_core::Config {
        snapdog_core::Config {
            base_topic: self.base_topic.clone(),
            mqtt: MqttConfig {
                host: self.mqtt_host.clone(),
                port: self.mqtt_port,
                username: self.mqtt_username.clone(),
                password: self.mqtt_password.clone(),
                keep_alive_secs: self.mqtt_keep_alive_secs,
                base_topic: self.base_topic.clone(),
            },
            snapcast: SnapcastConfig {
                host: self.snapcast_host.clone(),
                json_rpc_port: self.snapcast_json_rpc_port,
                websocket_url: self.snapcast_websocket_url.clone(),
            },
            knx: KnxConfig {
                gateway: self.knx_gateway.clone(),
                port: self.knx_port,
                group_addresses: self.knx_group_addresses.clone(),
            },
            zones: self.zones.clone(),
            clients: self.clients.clone(),
            resilience: ResiliencePolicyConfig {
                max_retries: self.resilience_max_retries,
                base_delay_ms: self.resilience_base_delay_ms,
                max_delay_ms: self.resilience_max_delay_ms,
                backoff: self.resilience_backoff,
                use_jitter: self.resilience_use_jitter,
                timeout_seconds: self.resilience_timeout_seconds,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_converts_to_core_config() {
        let config = ServerConfig::default();
        let core = config.to_core_config();
        assert_eq!(core.base_topic, "snapdog");
        assert_eq!(core.mqtt.port, 1883);
        assert_eq!(core.snapcast.json_rpc_port, 1705);
    }
}
