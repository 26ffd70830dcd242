use std::env;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use url::Url;

fn get_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn get_env_u64(key: &str, default: u64) -> Result<u64> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u64>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_u32(key: &str, default: u32) -> Result<u32> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<u32>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_usize(key: &str, default: usize) -> Result<usize> {
    match get_env(key) {
        None => Ok(default),
        Some(v) => Ok(v
            .parse::<usize>()
            .map_err(|e| anyhow!("{key} invalid int: {e}"))?),
    }
}

fn get_env_string(key: &str, default: &str) -> String {
    get_env(key).unwrap_or_else(|| default.to_string())
}

pub fn derive_ws_url(api_base: &str) -> Result<String> {
    let mut url = Url::parse(api_base).with_context(|| format!("API_BASE invalid url {api_base}"))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(anyhow!("API_BASE unsupported scheme {other}")),
    };
    url.set_scheme(scheme)
        .map_err(|_| anyhow!("API_BASE cannot switch scheme to {scheme}"))?;
    url.set_path("/ws");
    url.set_query(None);
    url.set_fragment(None);
    Ok(url.to_string())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    // Network
    pub api_base: String,
    pub ws_url: String,

    // Market data
    pub market_symbol: String,

    // Reconnect policy
    pub max_reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,

    // Loop timing
    pub poll_interval_secs: u64,
    pub heartbeat_interval_secs: u64,
    pub ws_connect_timeout_ms: u64,

    // Request/response channel
    pub order_history_limit: usize,
    pub http_timeout_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base: "http://127.0.0.1:8000".to_string(),
            ws_url: "ws://127.0.0.1:8000/ws".to_string(),
            market_symbol: "MES".to_string(),
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 2000,
            poll_interval_secs: 30,
            heartbeat_interval_secs: 60,
            ws_connect_timeout_ms: 10_000,
            order_history_limit: 10,
            http_timeout_ms: 10_000,
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        let d = Self::default();
        let api_base = get_env_string("API_BASE", &d.api_base)
            .trim_end_matches('/')
            .to_string();
        let ws_url = match get_env("WS_URL") {
            Some(u) => u,
            None => derive_ws_url(&api_base)?,
        };

        let s = Self {
            api_base,
            ws_url,
            market_symbol: get_env_string("MARKET_SYMBOL", &d.market_symbol).to_uppercase(),
            max_reconnect_attempts: get_env_u32("MAX_RECONNECT_ATTEMPTS", d.max_reconnect_attempts)?,
            reconnect_delay_ms: get_env_u64("RECONNECT_DELAY_MS", d.reconnect_delay_ms)?,
            poll_interval_secs: get_env_u64("POLL_INTERVAL_SECS", d.poll_interval_secs)?,
            heartbeat_interval_secs: get_env_u64("HEARTBEAT_INTERVAL_SECS", d.heartbeat_interval_secs)?,
            ws_connect_timeout_ms: get_env_u64("WS_CONNECT_TIMEOUT_MS", d.ws_connect_timeout_ms)?,
            order_history_limit: get_env_usize("ORDER_HISTORY_LIMIT", d.order_history_limit)?,
            http_timeout_ms: get_env_u64("HTTP_TIMEOUT_MS", d.http_timeout_ms)?,
        };

        s.validate()?;
        Ok(s)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn ws_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.ws_connect_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        Url::parse(&self.api_base).with_context(|| format!("API_BASE invalid url {}", self.api_base))?;
        let ws = Url::parse(&self.ws_url).with_context(|| format!("WS_URL invalid url {}", self.ws_url))?;
        if !matches!(ws.scheme(), "ws" | "wss") {
            return Err(anyhow!("WS_URL must use ws:// or wss:// (got {})", self.ws_url));
        }
        if self.market_symbol.is_empty() {
            return Err(anyhow!("MARKET_SYMBOL must not be empty"));
        }
        if self.reconnect_delay_ms < 1 {
            return Err(anyhow!(
                "RECONNECT_DELAY_MS must be >= 1 (got {})",
                self.reconnect_delay_ms
            ));
        }
        if self.poll_interval_secs < 1 {
            return Err(anyhow!(
                "POLL_INTERVAL_SECS must be >= 1 (got {})",
                self.poll_interval_secs
            ));
        }
        if self.heartbeat_interval_secs < 1 {
            return Err(anyhow!(
                "HEARTBEAT_INTERVAL_SECS must be >= 1 (got {})",
                self.heartbeat_interval_secs
            ));
        }
        if self.order_history_limit < 1 {
            return Err(anyhow!(
                "ORDER_HISTORY_LIMIT must be >= 1 (got {})",
                self.order_history_limit
            ));
        }
        if self.ws_connect_timeout_ms < 1 {
            return Err(anyhow!(
                "WS_CONNECT_TIMEOUT_MS must be >= 1 (got {})",
                self.ws_connect_timeout_ms
            ));
        }
        if self.http_timeout_ms < 1 {
            return Err(anyhow!("HTTP_TIMEOUT_MS must be >= 1 (got {})", self.http_timeout_ms));
        }
        Ok(())
    }
}
