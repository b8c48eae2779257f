use serde::Deserialize;
use std::fs;
use std::time::Duration;

use crate::channel::ChannelConfig;
use crate::engine::EngineConfig;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: Server,
    #[serde(default)]
    pub general: General,
    #[serde(default)]
    pub timeouts: Timeouts,
    #[serde(default)]
    pub reconnect: Reconnect,
    #[serde(default)]
    pub engine: Engine,
}

#[derive(Debug, Deserialize)]
pub struct Server {
    pub base_url: String,
    pub ws_url: String,
}

#[derive(Debug, Deserialize)]
pub struct General {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for General {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Timeouts {
    #[serde(default = "default_request_secs")]
    pub request_secs: u64,
    #[serde(default = "default_bid_echo_secs")]
    pub bid_echo_secs: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            request_secs: default_request_secs(),
            bid_echo_secs: default_bid_echo_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Reconnect {
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
}

impl Default for Reconnect {
    fn default() -> Self {
        Self {
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct Engine {
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_load_retry_secs")]
    pub load_retry_secs: u64,
    #[serde(default = "default_load_retry_max_secs")]
    pub load_retry_max_secs: u64,
    #[serde(default = "default_load_failures_before_warn")]
    pub load_failures_before_warn: u32,
    #[serde(default = "default_bid_history_limit")]
    pub bid_history_limit: usize,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval_secs(),
            load_retry_secs: default_load_retry_secs(),
            load_retry_max_secs: default_load_retry_max_secs(),
            load_failures_before_warn: default_load_failures_before_warn(),
            bid_history_limit: default_bid_history_limit(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_request_secs() -> u64 {
    10
}
fn default_bid_echo_secs() -> u64 {
    2
}
fn default_base_delay_secs() -> u64 {
    5
}
fn default_max_delay_secs() -> u64 {
    30
}
fn default_poll_interval_secs() -> u64 {
    10
}
fn default_load_retry_secs() -> u64 {
    3
}
fn default_load_retry_max_secs() -> u64 {
    30
}
fn default_load_failures_before_warn() -> u32 {
    3
}
fn default_bid_history_limit() -> usize {
    50
}

impl Config {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.request_secs)
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            base_delay: Duration::from_secs(self.reconnect.base_delay_secs),
            max_delay: Duration::from_secs(self.reconnect.max_delay_secs),
        }
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            poll_interval: Duration::from_secs(self.engine.poll_interval_secs),
            load_retry_delay: Duration::from_secs(self.engine.load_retry_secs),
            load_retry_max_delay: Duration::from_secs(self.engine.load_retry_max_secs),
            load_failures_before_warn: self.engine.load_failures_before_warn,
            bid_history_limit: self.engine.bid_history_limit,
            echo_timeout: Duration::from_secs(self.timeouts.bid_echo_secs),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_config_uses_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            base_url = "http://localhost:8000"
            ws_url = "ws://localhost:8000"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.general.log_level, "info");
        assert_eq!(cfg.request_timeout(), Duration::from_secs(10));
        assert_eq!(cfg.channel_config().base_delay, Duration::from_secs(5));
        assert_eq!(cfg.engine_config().bid_history_limit, 50);
    }

    #[test]
    fn test_overrides_apply() {
        let cfg: Config = toml::from_str(
            r#"
            [server]
            base_url = "http://localhost:8000"
            ws_url = "ws://localhost:8000"

            [reconnect]
            base_delay_secs = 1
            max_delay_secs = 8

            [engine]
            poll_interval_secs = 2
            "#,
        )
        .unwrap();
        let channel = cfg.channel_config();
        assert_eq!(channel.base_delay, Duration::from_secs(1));
        assert_eq!(channel.max_delay, Duration::from_secs(8));
        assert_eq!(
            cfg.engine_config().poll_interval,
            Duration::from_secs(2)
        );
    }
}
