use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::persist::PersistOptions;

/// Process settings, read once at startup from `DRIVETIME_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub max_connections: usize,
    pub metrics_port: Option<u16>,
    pub persist_retries: u32,
    pub persist_backoff_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".into(),
            port: 5480,
            data_dir: PathBuf::from("./data"),
            max_connections: 256,
            metrics_port: None,
            persist_retries: 3,
            persist_backoff_ms: 50,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or unparsable values fall back to the defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| lookup(key).and_then(|v| v.trim().parse().ok());
        Self {
            bind: lookup("DRIVETIME_BIND").unwrap_or(defaults.bind),
            port: parse_or(&lookup, "DRIVETIME_PORT", defaults.port),
            data_dir: lookup("DRIVETIME_DATA_DIR").map_or(defaults.data_dir, PathBuf::from),
            max_connections: parse_or(&lookup, "DRIVETIME_MAX_CONNECTIONS", defaults.max_connections),
            metrics_port: parsed("DRIVETIME_METRICS_PORT"),
            persist_retries: parse_or(&lookup, "DRIVETIME_PERSIST_RETRIES", defaults.persist_retries),
            persist_backoff_ms: parse_or(
                &lookup,
                "DRIVETIME_PERSIST_BACKOFF_MS",
                defaults.persist_backoff_ms,
            ),
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn persist_options(&self) -> PersistOptions {
        PersistOptions {
            retries: self.persist_retries,
            backoff: Duration::from_millis(self.persist_backoff_ms),
        }
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_when_unset() {
        let c = config(&[]);
        assert_eq!(c, Config::default());
        assert_eq!(c.addr(), "0.0.0.0:5480");
        assert_eq!(c.persist_options().retries, 3);
        assert_eq!(c.persist_options().backoff, Duration::from_millis(50));
    }

    #[test]
    fn overrides() {
        let c = config(&[
            ("DRIVETIME_BIND", "127.0.0.1"),
            ("DRIVETIME_PORT", "6000"),
            ("DRIVETIME_DATA_DIR", "/var/lib/drivetime"),
            ("DRIVETIME_MAX_CONNECTIONS", "8"),
            ("DRIVETIME_METRICS_PORT", "9100"),
            ("DRIVETIME_PERSIST_RETRIES", "5"),
            ("DRIVETIME_PERSIST_BACKOFF_MS", "200"),
        ]);
        assert_eq!(c.addr(), "127.0.0.1:6000");
        assert_eq!(c.data_dir, PathBuf::from("/var/lib/drivetime"));
        assert_eq!(c.max_connections, 8);
        assert_eq!(c.metrics_port, Some(9100));
        assert_eq!(c.persist_options().retries, 5);
        assert_eq!(c.persist_options().backoff, Duration::from_millis(200));
    }

    #[test]
    fn garbage_falls_back() {
        let c = config(&[("DRIVETIME_PORT", "http"), ("DRIVETIME_METRICS_PORT", "")]);
        assert_eq!(c.port, 5480);
        assert_eq!(c.metrics_port, None);
    }
}
