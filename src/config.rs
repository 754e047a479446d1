//! Configuration
//!
//! Every option is a long flag with a `POSTKEYS_*` environment fallback,
//! so the binary works equally from a shell, a unit file, or a container
//! spec. Durations accept `ms`/`s`/`m`/`h` suffixes (a bare number is
//! seconds).

use crate::cache::PolicyConfig;
use clap::Parser;
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::time::Duration;
use tokio_postgres::config::SslMode;

/// Command-line and environment configuration.
#[derive(Parser, Debug, Clone)]
#[command(
    name = "postkeys",
    version,
    about = "A Redis-wire-compatible server backed by PostgreSQL"
)]
pub struct Config {
    /// TCP address to serve the RESP protocol on
    #[arg(long, env = "POSTKEYS_LISTEN_ADDR", default_value = "127.0.0.1:6379")]
    pub listen_addr: String,

    /// Shared password; when set, clients must AUTH before anything else
    #[arg(long, env = "POSTKEYS_AUTH_PASSWORD")]
    pub auth_password: Option<String>,

    /// Metrics listen address (accepted for compatibility; no exporter
    /// is built in)
    #[arg(long, env = "POSTKEYS_METRICS_ADDR")]
    pub metrics_addr: Option<String>,

    /// PostgreSQL host
    #[arg(long, env = "POSTKEYS_DB_HOST", default_value = "127.0.0.1")]
    pub db_host: String,

    /// PostgreSQL port
    #[arg(long, env = "POSTKEYS_DB_PORT", default_value_t = 5432)]
    pub db_port: u16,

    /// PostgreSQL user
    #[arg(long, env = "POSTKEYS_DB_USER", default_value = "postgres")]
    pub db_user: String,

    /// PostgreSQL password
    #[arg(long, env = "POSTKEYS_DB_PASSWORD", default_value = "")]
    pub db_password: String,

    /// Database name
    #[arg(long, env = "POSTKEYS_DB_DATABASE", default_value = "postkeys")]
    pub db_database: String,

    /// SSL mode: disable | prefer | require
    #[arg(long, env = "POSTKEYS_DB_SSLMODE", default_value = "disable")]
    pub db_sslmode: String,

    /// Connection pool size shared by every session
    #[arg(long, env = "POSTKEYS_DB_POOL_SIZE", default_value_t = 16)]
    pub db_pool_size: usize,

    /// Enable the in-process string read cache
    #[arg(long, env = "POSTKEYS_CACHE_ENABLED", default_value_t = true,
          action = clap::ArgAction::Set)]
    pub cache_enabled: bool,

    /// Cache entry TTL
    #[arg(long, env = "POSTKEYS_CACHE_TTL", default_value = "5s",
          value_parser = parse_duration)]
    pub cache_ttl: Duration,

    /// Cache entry cap; 0 means unbounded
    #[arg(long, env = "POSTKEYS_CACHE_MAX_SIZE", default_value_t = 10_000)]
    pub cache_max_size: usize,

    /// Broadcast invalidations to other front-ends over the database
    #[arg(long, env = "POSTKEYS_CACHE_DISTRIBUTED_INVALIDATION",
          default_value_t = true, action = clap::ArgAction::Set)]
    pub cache_distributed_invalidation: bool,

    /// Enable the per-key admission policy
    #[arg(long, env = "POSTKEYS_CACHE_SMART_POLICY", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub cache_smart_policy: bool,

    /// Keys written with a shorter TTL are not cached
    #[arg(long, env = "POSTKEYS_CACHE_MIN_TTL", default_value = "1s",
          value_parser = parse_duration)]
    pub cache_min_ttl: Duration,

    /// Writes per second before a key counts as hot and skips the cache
    #[arg(long, env = "POSTKEYS_CACHE_MAX_WRITE_FREQ", default_value_t = 10.0)]
    pub cache_max_write_freq: f64,

    /// Rolling window for the write-frequency tracker
    #[arg(long, env = "POSTKEYS_CACHE_WRITE_TRACKING_WINDOW", default_value = "10s",
          value_parser = parse_duration)]
    pub cache_write_tracking_window: Duration,

    /// Comma-separated glob patterns never cached
    #[arg(long, env = "POSTKEYS_CACHE_EXCLUDE_PATTERNS", value_delimiter = ',')]
    pub cache_exclude_patterns: Vec<String>,

    /// Comma-separated glob patterns always cached (wins over everything)
    #[arg(long, env = "POSTKEYS_CACHE_INCLUDE_PATTERNS", value_delimiter = ',')]
    pub cache_include_patterns: Vec<String>,

    /// Per-session outbound delivery budget for pub/sub frames
    #[arg(long, env = "POSTKEYS_PUBSUB_OUTBOUND_BUFFER", default_value_t = 64)]
    pub pubsub_outbound_buffer: usize,

    /// Debug logging
    #[arg(long, env = "POSTKEYS_DEBUG", default_value_t = false,
          action = clap::ArgAction::Set)]
    pub debug: bool,

    /// SQL statement trace verbosity, 0-3
    #[arg(long, env = "POSTKEYS_SQL_TRACE_LEVEL", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=3))]
    pub sql_trace_level: u8,

    /// RESP frame trace verbosity, 0-3
    #[arg(long, env = "POSTKEYS_RESP_TRACE_LEVEL", default_value_t = 0,
          value_parser = clap::value_parser!(u8).range(0..=3))]
    pub resp_trace_level: u8,
}

impl Config {
    /// The tokio-postgres config for pool and listener connections.
    pub fn pg_config(&self) -> tokio_postgres::Config {
        let mut config = tokio_postgres::Config::new();
        config
            .host(&self.db_host)
            .port(self.db_port)
            .user(&self.db_user)
            .password(&self.db_password)
            .dbname(&self.db_database)
            .application_name("postkeys");
        config.ssl_mode(match self.db_sslmode.as_str() {
            "require" => SslMode::Require,
            "prefer" => SslMode::Prefer,
            _ => SslMode::Disable,
        });
        config
    }

    /// Builds the shared connection pool.
    pub fn build_pool(&self) -> anyhow::Result<Pool> {
        let manager = Manager::from_config(
            self.pg_config(),
            tokio_postgres::NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        Ok(Pool::builder(manager)
            .max_size(self.db_pool_size.max(2))
            .build()?)
    }

    /// The cache admission policy derived from the `cache-*` options.
    pub fn policy_config(&self) -> PolicyConfig {
        PolicyConfig {
            min_ttl: (!self.cache_min_ttl.is_zero()).then_some(self.cache_min_ttl),
            max_write_freq: (self.cache_max_write_freq > 0.0).then_some(self.cache_max_write_freq),
            write_tracking_window: self.cache_write_tracking_window,
            include: self
                .cache_include_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| bytes::Bytes::from(p.clone()))
                .collect(),
            exclude: self
                .cache_exclude_patterns
                .iter()
                .filter(|p| !p.is_empty())
                .map(|p| bytes::Bytes::from(p.clone()))
                .collect(),
        }
    }

    /// Tracing filter directives built from the debug/trace options.
    pub fn log_filter(&self) -> String {
        let base = if self.debug { "debug" } else { "info" };
        let mut filter = format!("postkeys={base},warn");
        if self.resp_trace_level >= 2 {
            filter.push_str(",postkeys::protocol=trace,postkeys::server=trace");
        }
        if self.sql_trace_level >= 2 {
            filter.push_str(",postkeys::storage=trace");
        }
        filter
    }
}

/// Parses `100ms`, `5s`, `2m`, `1h`, or a bare number of seconds.
fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    let (number, unit): (&str, &str) = match raw.find(|c: char| c.is_ascii_alphabetic()) {
        Some(pos) => (&raw[..pos], &raw[pos..]),
        None => (raw, "s"),
    };
    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid duration '{raw}'"))?;
    if value < 0.0 {
        return Err(format!("invalid duration '{raw}'"));
    }
    let seconds = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return Err(format!("invalid duration unit '{unit}'")),
    };
    Ok(Duration::from_secs_f64(seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("100ms").unwrap(), Duration::from_millis(100));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration("30").unwrap(), Duration::from_secs(30));
        assert!(parse_duration("abc").is_err());
        assert!(parse_duration("5d").is_err());
        assert!(parse_duration("-1s").is_err());
    }

    #[test]
    fn test_defaults() {
        let config = Config::parse_from(["postkeys"]);
        assert_eq!(config.listen_addr, "127.0.0.1:6379");
        assert_eq!(config.db_port, 5432);
        assert!(config.cache_enabled);
        assert_eq!(config.cache_ttl, Duration::from_secs(5));
        assert_eq!(config.cache_max_size, 10_000);
        assert!(!config.cache_smart_policy);
        assert_eq!(config.sql_trace_level, 0);
    }

    #[test]
    fn test_pattern_lists_split_on_commas() {
        let config = Config::parse_from([
            "postkeys",
            "--cache-exclude-patterns",
            "session:*,tmp:*",
        ]);
        let policy = config.policy_config();
        assert_eq!(policy.exclude.len(), 2);
        assert_eq!(policy.exclude[0], bytes::Bytes::from("session:*"));
    }

    #[test]
    fn test_bool_flags_take_values() {
        let config = Config::parse_from(["postkeys", "--cache-enabled", "false"]);
        assert!(!config.cache_enabled);
    }

    #[test]
    fn test_log_filter_levels() {
        let config = Config::parse_from(["postkeys"]);
        assert!(config.log_filter().starts_with("postkeys=info"));
        let config = Config::parse_from(["postkeys", "--debug", "true", "--resp-trace-level", "3"]);
        let filter = config.log_filter();
        assert!(filter.contains("postkeys=debug"));
        assert!(filter.contains("postkeys::protocol=trace"));
    }
}
