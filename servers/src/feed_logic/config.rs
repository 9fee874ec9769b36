use anyhow::{bail, Result};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lib_marketfeed::cache::CacheConfig;
use lib_marketfeed::{MultiplexerConfig, RestConfig};

const DEFAULT_CONFIG_FILE: &str = "server_feed.conf";

#[derive(Parser, Deserialize, Serialize, Clone, Default)]
#[clap(about = "Polygon market data feed server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "FEED_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "FEED_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "POLYGON_API_KEY", hide_env_values = true, help = "Polygon API key used for both WebSocket and REST.")]
    pub api_key: Option<String>,

    #[clap(long, env = "FEED_SYMBOLS", value_delimiter = ',', help = "Comma separated symbols to stream.")]
    pub symbols: Option<Vec<String>>,

    #[clap(long, env = "FEED_REALTIME", help = "Use the real-time cluster instead of the delayed one.")]
    pub realtime: Option<bool>,

    #[clap(long, env = "FEED_CHANNEL_PREFIX", help = "Channel prefix: A (per-second) or AM (per-minute).")]
    pub channel_prefix: Option<String>,

    #[clap(long, env = "POLYGON_WS_URL", help = "Override of the upstream WebSocket URL.")]
    pub ws_url: Option<String>,

    #[clap(long, env = "POLYGON_REST_URL", help = "Base URL of the Polygon REST API.")]
    pub rest_url: Option<String>,

    #[clap(long, env = "FEED_RECONNECT_BASE_DELAY_MS", help = "Base delay in milliseconds for upstream reconnect attempts.")]
    pub reconnect_base_delay_ms: Option<u64>,

    #[clap(long, env = "FEED_RECONNECT_MAX_ATTEMPTS", help = "Reconnect attempts before giving up.")]
    pub reconnect_max_attempts: Option<u32>,

    #[clap(long, env = "FEED_AUTH_TIMEOUT_MS", help = "Milliseconds allowed for connect plus authentication.")]
    pub auth_timeout_ms: Option<u64>,

    #[clap(long, env = "FEED_CACHE_MAX_ENTRIES", help = "Capacity of the REST response cache.")]
    pub cache_max_entries: Option<usize>,

    #[clap(long, env = "FEED_CACHE_SWEEP_INTERVAL_SECONDS", help = "Interval in seconds between expired-entry sweeps.")]
    pub cache_sweep_interval_seconds: Option<u64>,

    #[clap(long, env = "FEED_STATUS_INTERVAL_SECONDS", help = "Interval in seconds between status reports.")]
    pub status_interval_seconds: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            api_key: other.api_key.or(self.api_key),
            symbols: other.symbols.or(self.symbols),
            realtime: other.realtime.or(self.realtime),
            channel_prefix: other.channel_prefix.or(self.channel_prefix),
            ws_url: other.ws_url.or(self.ws_url),
            rest_url: other.rest_url.or(self.rest_url),
            reconnect_base_delay_ms: other.reconnect_base_delay_ms.or(self.reconnect_base_delay_ms),
            reconnect_max_attempts: other.reconnect_max_attempts.or(self.reconnect_max_attempts),
            auth_timeout_ms: other.auth_timeout_ms.or(self.auth_timeout_ms),
            cache_max_entries: other.cache_max_entries.or(self.cache_max_entries),
            cache_sweep_interval_seconds: other.cache_sweep_interval_seconds.or(self.cache_sweep_interval_seconds),
            status_interval_seconds: other.status_interval_seconds.or(self.status_interval_seconds),
        }
    }

    fn defaults() -> Config {
        let mux = MultiplexerConfig::default();
        let cache = CacheConfig::default();
        Config {
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            symbols: Some(vec!["AAPL".to_string(), "MSFT".to_string(), "NVDA".to_string()]),
            realtime: Some(false),
            channel_prefix: Some(mux.channel_prefix),
            rest_url: Some(RestConfig::default().base_url),
            reconnect_base_delay_ms: Some(mux.reconnect.base_delay_ms),
            reconnect_max_attempts: Some(mux.reconnect.max_attempts),
            auth_timeout_ms: Some(mux.auth_timeout_ms),
            cache_max_entries: Some(cache.max_entries),
            cache_sweep_interval_seconds: Some(cache.sweep_interval_secs),
            status_interval_seconds: Some(30),
            ..Default::default()
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> &str {
        self.log_level.as_deref().unwrap_or("info")
    }

    /// Configured symbols, trimmed, with blanks and duplicates dropped.
    pub fn symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = Vec::new();
        for symbol in self.symbols.iter().flatten() {
            let symbol = symbol.trim();
            if !symbol.is_empty() && !symbols.iter().any(|s| s == symbol) {
                symbols.push(symbol.to_string());
            }
        }
        symbols
    }

    pub fn status_interval(&self) -> Duration {
        Duration::from_secs(self.status_interval_seconds.unwrap_or(30).max(1))
    }

    pub fn multiplexer_config(&self) -> Result<MultiplexerConfig> {
        let api_key = match self.api_key.as_deref().map(str::trim) {
            Some(key) if !key.is_empty() => key,
            _ => bail!("POLYGON_API_KEY is not set"),
        };

        let mut mux = MultiplexerConfig::for_feed(api_key, self.realtime.unwrap_or(false));
        if let Some(url) = &self.ws_url {
            mux.url = url.clone();
        }
        if let Some(prefix) = &self.channel_prefix {
            mux.channel_prefix = prefix.clone();
        }
        if let Some(timeout) = self.auth_timeout_ms {
            mux.auth_timeout_ms = timeout;
        }
        if let Some(base) = self.reconnect_base_delay_ms {
            mux.reconnect.base_delay_ms = base;
        }
        if let Some(attempts) = self.reconnect_max_attempts {
            mux.reconnect.max_attempts = attempts;
        }
        Ok(mux)
    }

    pub fn cache_config(&self) -> CacheConfig {
        let defaults = CacheConfig::default();
        CacheConfig {
            max_entries: self.cache_max_entries.unwrap_or(defaults.max_entries),
            sweep_interval_secs: self.cache_sweep_interval_seconds.unwrap_or(defaults.sweep_interval_secs),
        }
    }

    pub fn rest_config(&self) -> RestConfig {
        let defaults = RestConfig::default();
        RestConfig {
            base_url: self.rest_url.clone().unwrap_or(defaults.base_url),
            api_key: self.api_key.clone().unwrap_or_default(),
            ..defaults
        }
    }
}

pub fn load_config() -> Config {
    resolve(Config::parse())
}

/// Layers built-in defaults, the JSON config file and the CLI/environment
/// values, in that order of increasing precedence.
pub fn resolve(cli: Config) -> Config {
    let config_file_path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }
    current_config.merge(cli)
}

fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    let config_str = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            return None;
        }
    };
    match serde_json::from_str::<Config>(&config_str) {
        Ok(config) => Some(config),
        Err(e) => {
            log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}
