use std::net::SocketAddr;

use serde::Deserialize;

/// Server configuration. Everything has a default so `concordd` starts with
/// no environment at all; see `Config::from_env`.
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
    /// address the combined HTTP + websocket listener binds
    pub bind: SocketAddr,
    /// the externally visible websocket URL handed out by `GET /api/gateway`
    pub gateway_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: ([127, 0, 0, 1], 8080).into(),
            gateway_url: "ws://127.0.0.1:8080".into(),
        }
    }
}

impl Config {
    /// Read configuration from `CONCORD_BIND` / `CONCORD_GATEWAY_URL`,
    /// falling back to the defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Self::default();
        if let Ok(bind) = std::env::var("CONCORD_BIND") {
            config.bind = bind.parse()?;
        }
        if let Ok(url) = std::env::var("CONCORD_GATEWAY_URL") {
            config.gateway_url = url;
        }
        Ok(config)
    }
}
