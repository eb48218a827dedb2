pub const DEFAULT_DATA_DIR: &str = "./shale-data";
pub const DEFAULT_SYNC_LOG_CAP: u64 = 1_000_000;

// Wire protocol guard rails.
pub const DEFAULT_MAX_ARGS: usize = 1024 * 1024;
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;
pub const DEFAULT_MAX_LINE_LEN: usize = 64 * 1024;

pub struct Config {
    pub port: u16,
    pub host: String,
    /// RocksDB directory holding the whole keyspace (sync log included).
    pub data_dir: String,
    pub metrics_port: u16,
    pub metrics_host: String,
    /// Sync-log retention, in entries. Older sequences fall off the trailing
    /// edge and force reconnecting slaves into a full resync.
    pub sync_log_cap: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 6380,
            host: "0.0.0.0".to_string(),
            data_dir: DEFAULT_DATA_DIR.to_string(),
            metrics_port: 9090,
            metrics_host: "0.0.0.0".to_string(),
            sync_log_cap: DEFAULT_SYNC_LOG_CAP,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_vars(
            std::env::var("SHALE_PORT").ok().as_deref(),
            std::env::var("SHALE_HOST").ok().as_deref(),
            std::env::var("SHALE_DATA_DIR").ok().as_deref(),
            std::env::var("SHALE_METRICS_PORT").ok().as_deref(),
            std::env::var("SHALE_METRICS_HOST").ok().as_deref(),
            std::env::var("SHALE_SYNC_LOG_CAP").ok().as_deref(),
        )
    }

    fn from_vars(
        port: Option<&str>,
        host: Option<&str>,
        data_dir: Option<&str>,
        metrics_port: Option<&str>,
        metrics_host: Option<&str>,
        sync_log_cap: Option<&str>,
    ) -> Self {
        let defaults = Self::default();
        Self {
            port: port.and_then(|s| s.parse().ok()).unwrap_or(defaults.port),
            host: host.map(|s| s.to_string()).unwrap_or(defaults.host),
            data_dir: data_dir
                .map(|s| s.to_string())
                .unwrap_or(defaults.data_dir),
            metrics_port: metrics_port
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.metrics_port),
            metrics_host: metrics_host
                .map(|s| s.to_string())
                .unwrap_or(defaults.metrics_host),
            sync_log_cap: sync_log_cap
                .and_then(|s| s.parse().ok())
                .filter(|cap| *cap > 0)
                .unwrap_or(defaults.sync_log_cap),
        }
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn metrics_listen_addr(&self) -> String {
        format!("{}:{}", self.metrics_host, self.metrics_port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_correct() {
        let c = Config::default();
        assert_eq!(c.port, 6380);
        assert_eq!(c.host, "0.0.0.0");
        assert_eq!(c.data_dir, DEFAULT_DATA_DIR);
        assert_eq!(c.sync_log_cap, DEFAULT_SYNC_LOG_CAP);
    }

    #[test]
    fn from_vars_all_none_returns_defaults() {
        let c = Config::from_vars(None, None, None, None, None, None);
        assert_eq!(c.port, 6380);
        assert_eq!(c.listen_addr(), "0.0.0.0:6380");
    }

    #[test]
    fn from_vars_overrides() {
        let c = Config::from_vars(
            Some("7000"),
            Some("127.0.0.1"),
            Some("/tmp/shale"),
            Some("9100"),
            None,
            Some("500"),
        );
        assert_eq!(c.port, 7000);
        assert_eq!(c.host, "127.0.0.1");
        assert_eq!(c.data_dir, "/tmp/shale");
        assert_eq!(c.metrics_listen_addr(), "0.0.0.0:9100");
        assert_eq!(c.sync_log_cap, 500);
    }

    #[test]
    fn from_vars_bad_values_fall_back() {
        let c = Config::from_vars(Some("nope"), None, None, None, None, Some("0"));
        assert_eq!(c.port, 6380);
        assert_eq!(c.sync_log_cap, DEFAULT_SYNC_LOG_CAP, "zero cap is refused");
    }
}
