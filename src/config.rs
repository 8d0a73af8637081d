use serde::{Deserialize, Serialize};

/// Engine configuration, read from environment variables.
///
/// Credentials are only required when running against the live exchange;
/// paper mode needs none of them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub base_url: String,
    pub api_key: String,
    pub api_secret: String,
    pub tick_interval_secs: u64,
    pub slippage_tolerance: f64,
    pub limit_offset: f64,
    pub twap_jitter: bool,
}

const DEFAULT_BASE_URL: &str = "https://testnet.binancefuture.com";

impl Default for Config {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            tick_interval_secs: 5,
            slippage_tolerance: 0.01, // 1% max drift before a TWAP slice is skipped
            limit_offset: 0.001,      // 0.1% peg offset for limit-mode slices
            twap_jitter: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();

        Self {
            base_url: std::env::var("BINANCE_BASE_URL").unwrap_or(defaults.base_url),
            api_key: std::env::var("BINANCE_API_KEY").unwrap_or_default(),
            api_secret: std::env::var("BINANCE_API_SECRET").unwrap_or_default(),
            tick_interval_secs: env_parse("TICK_INTERVAL_SECS", defaults.tick_interval_secs),
            slippage_tolerance: env_parse("SLIPPAGE_TOLERANCE", defaults.slippage_tolerance),
            limit_offset: env_parse("LIMIT_OFFSET", defaults.limit_offset),
            twap_jitter: env_parse("TWAP_JITTER", false),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.tick_interval_secs, 5);
        assert_eq!(config.slippage_tolerance, 0.01);
        assert!(!config.twap_jitter);
        assert!(!config.has_credentials());
    }

    #[test]
    fn test_has_credentials() {
        let config = Config {
            api_key: "key".to_string(),
            api_secret: "secret".to_string(),
            ..Config::default()
        };
        assert!(config.has_credentials());
    }
}
