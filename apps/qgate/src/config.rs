use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use qgate_common::RelaySettings;
use qgate_relay::{Channel, PriceTable};

#[derive(Debug, Deserialize)]
pub(crate) struct GatewayConfig {
    #[serde(default)]
    pub(crate) server: ServerConfig,
    #[serde(default)]
    pub(crate) settings: RelaySettings,
    pub(crate) users: Vec<UserConfig>,
    pub(crate) channels: Vec<Channel>,
    #[serde(default)]
    pub(crate) prices: PriceTable,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ServerConfig {
    #[serde(default = "default_host")]
    pub(crate) host: String,
    #[serde(default = "default_port")]
    pub(crate) port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

#[derive(Debug, Deserialize)]
pub(crate) struct UserConfig {
    pub(crate) id: i64,
    pub(crate) name: String,
    #[serde(default = "default_group")]
    pub(crate) group: String,
    pub(crate) quota: i64,
    pub(crate) keys: Vec<String>,
}

fn default_group() -> String {
    "default".to_string()
}

pub(crate) fn load(path: impl AsRef<Path>) -> anyhow::Result<GatewayConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("read config file {}", path.display()))?;
    let config: GatewayConfig =
        serde_json::from_str(&raw).with_context(|| format!("parse {}", path.display()))?;
    config
        .settings
        .validate()
        .context("invalid relay settings")?;
    if config.channels.is_empty() {
        anyhow::bail!("config declares no channels");
    }
    Ok(config)
}
