//! Process configuration read from `TETHER_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::warn;

use tether_core::{Schema, TetherError, TetherResult};

use crate::relations::RetryPolicy;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_PROPAGATION_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_PROPAGATION_BASE_DELAY_MS: u64 = 25;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TetherConfig {
    pub bind_addr: String,
    /// JSON schema document. An empty schema is used when unset.
    pub schema_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub cache_prefix: Option<String>,
    pub propagation_max_attempts: u32,
    pub propagation_base_delay: Duration,
    /// Run the consistency sweep on this interval when set.
    pub sweep_interval: Option<Duration>,
}

impl Default for TetherConfig {
    fn default() -> Self {
        Self {
            bind_addr: DEFAULT_BIND_ADDR.to_string(),
            schema_path: None,
            redis_url: None,
            cache_prefix: None,
            propagation_max_attempts: DEFAULT_PROPAGATION_MAX_ATTEMPTS,
            propagation_base_delay: Duration::from_millis(DEFAULT_PROPAGATION_BASE_DELAY_MS),
            sweep_interval: None,
        }
    }
}

impl TetherConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let defaults = Self::default();

        Self {
            bind_addr: get("TETHER_BIND_ADDR").unwrap_or(defaults.bind_addr),
            schema_path: get("TETHER_SCHEMA_PATH").map(PathBuf::from),
            redis_url: get("TETHER_REDIS_URL"),
            cache_prefix: get("TETHER_CACHE_PREFIX"),
            propagation_max_attempts: parse_or(
                "TETHER_PROPAGATION_MAX_ATTEMPTS",
                get("TETHER_PROPAGATION_MAX_ATTEMPTS"),
                DEFAULT_PROPAGATION_MAX_ATTEMPTS,
            )
            .max(1),
            propagation_base_delay: Duration::from_millis(parse_or(
                "TETHER_PROPAGATION_BASE_DELAY_MS",
                get("TETHER_PROPAGATION_BASE_DELAY_MS"),
                DEFAULT_PROPAGATION_BASE_DELAY_MS,
            )),
            sweep_interval: get("TETHER_SWEEP_INTERVAL_SECS")
                .and_then(|raw| parse_opt::<u64>("TETHER_SWEEP_INTERVAL_SECS", &raw))
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.propagation_max_attempts,
            base_delay: self.propagation_base_delay,
            ..RetryPolicy::default()
        }
    }

    /// Read the configured schema document, or an empty schema.
    pub fn load_schema(&self) -> TetherResult<Schema> {
        let Some(path) = &self.schema_path else {
            warn!("TETHER_SCHEMA_PATH not set; starting with an empty schema");
            return Ok(Schema::new());
        };
        let text = std::fs::read_to_string(path).map_err(|e| {
            TetherError::not_found(format!("schema document {}: {e}", path.display()))
        })?;
        Schema::from_json_str(&text)
    }
}

fn parse_opt<T: FromStr>(key: &str, raw: &str) -> Option<T> {
    match raw.parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = raw, "ignoring invalid configuration value");
            None
        }
    }
}

fn parse_or<T: FromStr>(key: &str, raw: Option<String>, default: T) -> T {
    raw.and_then(|raw| parse_opt(key, &raw)).unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> TetherConfig {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        TetherConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        assert_eq!(config(&[]), TetherConfig::default());
        assert_eq!(TetherConfig::default().bind_addr, "0.0.0.0:8080");
    }

    #[test]
    fn reads_every_variable() {
        let cfg = config(&[
            ("TETHER_BIND_ADDR", "127.0.0.1:9000"),
            ("TETHER_SCHEMA_PATH", "/etc/tether/schema.json"),
            ("TETHER_REDIS_URL", "redis://localhost:6379"),
            ("TETHER_CACHE_PREFIX", "app"),
            ("TETHER_PROPAGATION_MAX_ATTEMPTS", "5"),
            ("TETHER_PROPAGATION_BASE_DELAY_MS", "10"),
            ("TETHER_SWEEP_INTERVAL_SECS", "60"),
        ]);

        assert_eq!(cfg.bind_addr, "127.0.0.1:9000");
        assert_eq!(cfg.schema_path, Some(PathBuf::from("/etc/tether/schema.json")));
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://localhost:6379"));
        assert_eq!(cfg.cache_prefix.as_deref(), Some("app"));
        assert_eq!(cfg.sweep_interval, Some(Duration::from_secs(60)));

        let retry = cfg.retry_policy();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay, Duration::from_millis(10));
    }

    #[test]
    fn invalid_numbers_fall_back_to_defaults() {
        let cfg = config(&[
            ("TETHER_PROPAGATION_MAX_ATTEMPTS", "lots"),
            ("TETHER_PROPAGATION_BASE_DELAY_MS", "-1"),
            ("TETHER_SWEEP_INTERVAL_SECS", "soon"),
        ]);
        assert_eq!(cfg.propagation_max_attempts, DEFAULT_PROPAGATION_MAX_ATTEMPTS);
        assert_eq!(
            cfg.propagation_base_delay,
            Duration::from_millis(DEFAULT_PROPAGATION_BASE_DELAY_MS)
        );
        assert_eq!(cfg.sweep_interval, None);
    }

    #[test]
    fn blank_values_count_as_unset() {
        let cfg = config(&[("TETHER_BIND_ADDR", "  "), ("TETHER_SWEEP_INTERVAL_SECS", "0")]);
        assert_eq!(cfg.bind_addr, DEFAULT_BIND_ADDR);
        assert_eq!(cfg.sweep_interval, None);
    }

    #[test]
    fn missing_schema_path_yields_an_empty_schema() {
        assert!(TetherConfig::default().load_schema().unwrap().is_empty());

        let cfg = config(&[("TETHER_SCHEMA_PATH", "/definitely/not/here.json")]);
        assert!(matches!(cfg.load_schema(), Err(TetherError::NotFound(_))));
    }
}
