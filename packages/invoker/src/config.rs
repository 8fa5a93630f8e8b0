// ABOUTME: Environment-driven configuration for the invoker process
// ABOUTME: Every knob has a default; invalid values fail startup instead of being silently ignored

use std::collections::HashMap;
use std::env;
use std::num::ParseIntError;
use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {var}: {source}")]
    InvalidNumber {
        var: &'static str,
        source: ParseIntError,
    },

    #[error("invalid POOL_PREWARM entry {0:?}, expected kind=count")]
    InvalidPrewarm(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub redis: RedisConfig,
    pub docker: DockerConfig,
    pub invoker: InvokerSettings,
    pub pool: PoolSettings,
    pub resources: ResourceSettings,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone)]
pub struct DockerConfig {
    pub host: String,
    pub network_name: String,
    pub container_prefix: String,
}

#[derive(Debug, Clone)]
pub struct InvokerSettings {
    pub id: String,
    pub max_concurrent: usize,
    pub heartbeat_interval: Duration,
    /// How long shutdown waits for in-flight activations.
    pub drain_deadline: Duration,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    pub max_size: usize,
    pub idle_timeout: Duration,
    pub cleanup_interval: Duration,
    /// Stem cells to create at startup, per runtime kind.
    pub prewarm: HashMap<String, usize>,
}

#[derive(Debug, Clone)]
pub struct ResourceSettings {
    pub memory_mb: i64,
    pub cpu_shares: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            redis: RedisConfig {
                host: string_var("REDIS_HOST", "redis"),
                port: int_var("REDIS_PORT", 6379u16)?,
            },
            docker: DockerConfig {
                host: string_var("DOCKER_HOST", "unix:///var/run/docker.sock"),
                network_name: string_var("DOCKER_NETWORK_NAME", "penguinwhisk"),
                container_prefix: string_var("DOCKER_CONTAINER_PREFIX", "penguinwhisk"),
            },
            invoker: InvokerSettings {
                id: string_var("INVOKER_ID", "invoker0"),
                max_concurrent: int_var("INVOKER_MAX_CONCURRENT", 10usize)?,
                heartbeat_interval: Duration::from_secs(int_var(
                    "INVOKER_HEARTBEAT_INTERVAL_SECS",
                    10u64,
                )?),
                drain_deadline: Duration::from_secs(int_var(
                    "INVOKER_DRAIN_DEADLINE_SECS",
                    30u64,
                )?),
            },
            pool: PoolSettings {
                max_size: int_var("POOL_MAX_SIZE", 100usize)?,
                idle_timeout: Duration::from_secs(int_var("POOL_IDLE_TIMEOUT_SECS", 600u64)?),
                cleanup_interval: Duration::from_secs(int_var(
                    "POOL_CLEANUP_INTERVAL_SECS",
                    60u64,
                )?),
                prewarm: parse_prewarm(&string_var("POOL_PREWARM", ""))?,
            },
            resources: ResourceSettings {
                memory_mb: int_var("RESOURCES_MEMORY_MB", 256i64)?,
                cpu_shares: int_var("RESOURCES_CPU_SHARES", 1024i64)?,
            },
        })
    }
}

fn string_var(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn int_var<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|source| ConfigError::InvalidNumber { var: name, source }),
        Err(_) => Ok(default),
    }
}

/// Parse `kind=count` pairs, e.g. `nodejs:20=2,python:3.12=1`.
fn parse_prewarm(raw: &str) -> Result<HashMap<String, usize>, ConfigError> {
    let mut prewarm = HashMap::new();
    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        // Runtime kinds contain ':' and may contain '='; the count never does.
        let (kind, count) = entry
            .rsplit_once('=')
            .ok_or_else(|| ConfigError::InvalidPrewarm(entry.to_string()))?;
        let count: usize = count
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidPrewarm(entry.to_string()))?;
        prewarm.insert(kind.trim().to_string(), count);
    }
    Ok(prewarm)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prewarm_parses_kind_count_pairs() {
        let prewarm = parse_prewarm("nodejs:20=2, python:3.12=1").unwrap();
        assert_eq!(prewarm.get("nodejs:20"), Some(&2));
        assert_eq!(prewarm.get("python:3.12"), Some(&1));
    }

    #[test]
    fn prewarm_accepts_empty_input() {
        assert!(parse_prewarm("").unwrap().is_empty());
        assert!(parse_prewarm(" , ").unwrap().is_empty());
    }

    #[test]
    fn prewarm_rejects_malformed_entries() {
        assert!(parse_prewarm("nodejs:20").is_err());
        assert!(parse_prewarm("nodejs:20=lots").is_err());
    }

    #[test]
    fn from_env_applies_overrides() {
        env::set_var("INVOKER_ID", "invoker7");
        env::set_var("POOL_MAX_SIZE", "5");
        env::set_var("POOL_PREWARM", "go:1.23=3");

        let config = Config::from_env().unwrap();
        assert_eq!(config.invoker.id, "invoker7");
        assert_eq!(config.pool.max_size, 5);
        assert_eq!(config.pool.prewarm.get("go:1.23"), Some(&3));

        env::remove_var("INVOKER_ID");
        env::remove_var("POOL_MAX_SIZE");
        env::remove_var("POOL_PREWARM");
    }

    #[test]
    fn from_env_rejects_invalid_numbers() {
        env::set_var("INVOKER_MAX_CONCURRENT", "many");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber { .. }));
        env::remove_var("INVOKER_MAX_CONCURRENT");
    }
}
