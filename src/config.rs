//! Process configuration from environment variables.
//!
//! Every setting except the shared secret has a default. Values that are
//! present but unparsable are errors rather than silently replaced by the
//! default.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;

use thiserror::Error;

use crate::dedupe::{DEFAULT_DEDUPE_CAPACITY, DEFAULT_DEDUPE_TTL_HOURS, MAX_DEDUPE_TTL_HOURS};
use crate::executor::{DEFAULT_SKILL_RUNNER, ExecutorSettings};
use crate::queue::{
    DEFAULT_MAX_ATTEMPTS, DEFAULT_RETAIN_COMPLETED, DEFAULT_RETAIN_FAILED, QueueConfig,
    RetentionPolicy, RetryPolicy,
};
use crate::worker::DEFAULT_CONCURRENCY;

pub const ENV_SECRET: &str = "DISPATCH_SECRET";
pub const ENV_LISTEN_ADDR: &str = "DISPATCH_LISTEN_ADDR";
pub const ENV_QUEUE_DIR: &str = "DISPATCH_QUEUE_DIR";
pub const ENV_CONCURRENCY: &str = "DISPATCH_CONCURRENCY";
pub const ENV_WORKFLOWS: &str = "DISPATCH_WORKFLOWS";
pub const ENV_MAX_ATTEMPTS: &str = "DISPATCH_MAX_ATTEMPTS";
pub const ENV_RETAIN_COMPLETED: &str = "DISPATCH_RETAIN_COMPLETED";
pub const ENV_RETAIN_FAILED: &str = "DISPATCH_RETAIN_FAILED";
pub const ENV_DEDUPE_TTL_HOURS: &str = "DISPATCH_DEDUPE_TTL_HOURS";
pub const ENV_DEDUPE_CAPACITY: &str = "DISPATCH_DEDUPE_CAPACITY";
pub const ENV_SKILL_RUNNER: &str = "DISPATCH_SKILL_RUNNER";
pub const ENV_LOG_IGNORED: &str = "DISPATCH_LOG_IGNORED";

const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:3000";
const DEFAULT_QUEUE_DIR: &str = "./queue";
const DEFAULT_WORKFLOWS: &str = "workflows.yaml";

/// Errors from reading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var} has invalid value {value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Complete process configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub secret: Vec<u8>,
    pub listen_addr: SocketAddr,
    pub queue_dir: PathBuf,
    pub concurrency: usize,
    pub workflows_path: PathBuf,
    pub max_attempts: u32,
    pub retain_completed: usize,
    pub retain_failed: usize,
    pub dedupe_ttl_hours: i64,
    pub dedupe_capacity: usize,
    pub skill_runner: String,
    pub log_ignored: bool,
}

impl Config {
    /// Reads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads configuration through `lookup`, which returns a variable's value
    /// if set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let secret = get(ENV_SECRET).ok_or(ConfigError::Missing(ENV_SECRET))?;

        let concurrency: usize = parse_or(&get, ENV_CONCURRENCY, DEFAULT_CONCURRENCY)?;
        if concurrency == 0 {
            return Err(invalid(ENV_CONCURRENCY, "0", "must be at least 1"));
        }

        let max_attempts: u32 = parse_or(&get, ENV_MAX_ATTEMPTS, DEFAULT_MAX_ATTEMPTS)?;
        if max_attempts == 0 {
            return Err(invalid(ENV_MAX_ATTEMPTS, "0", "must be at least 1"));
        }

        let dedupe_ttl_hours: i64 = parse_or(&get, ENV_DEDUPE_TTL_HOURS, DEFAULT_DEDUPE_TTL_HOURS)?;
        if !(1..=MAX_DEDUPE_TTL_HOURS).contains(&dedupe_ttl_hours) {
            return Err(invalid(
                ENV_DEDUPE_TTL_HOURS,
                &dedupe_ttl_hours.to_string(),
                &format!("must be between 1 and {MAX_DEDUPE_TTL_HOURS}"),
            ));
        }

        Ok(Config {
            secret: secret.into_bytes(),
            listen_addr: parse_or(
                &get,
                ENV_LISTEN_ADDR,
                SocketAddr::from_str(DEFAULT_LISTEN_ADDR)
                    .map_err(|e| invalid(ENV_LISTEN_ADDR, DEFAULT_LISTEN_ADDR, &e.to_string()))?,
            )?,
            queue_dir: get(ENV_QUEUE_DIR)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_QUEUE_DIR)),
            concurrency,
            workflows_path: get(ENV_WORKFLOWS)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKFLOWS)),
            max_attempts,
            retain_completed: parse_or(&get, ENV_RETAIN_COMPLETED, DEFAULT_RETAIN_COMPLETED)?,
            retain_failed: parse_or(&get, ENV_RETAIN_FAILED, DEFAULT_RETAIN_FAILED)?,
            dedupe_ttl_hours,
            dedupe_capacity: parse_or(&get, ENV_DEDUPE_CAPACITY, DEFAULT_DEDUPE_CAPACITY)?,
            skill_runner: get(ENV_SKILL_RUNNER).unwrap_or_else(|| DEFAULT_SKILL_RUNNER.to_string()),
            log_ignored: parse_bool(&get, ENV_LOG_IGNORED)?,
        })
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig::new(&self.queue_dir)
            .with_retention(RetentionPolicy {
                completed: self.retain_completed,
                failed: self.retain_failed,
            })
            .with_retry(RetryPolicy {
                max_attempts: self.max_attempts,
                ..RetryPolicy::default()
            })
    }

    pub fn executor_settings(&self) -> ExecutorSettings {
        ExecutorSettings {
            skill_runner: self.skill_runner.clone(),
            ..ExecutorSettings::default()
        }
    }

    pub fn dedupe_ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.dedupe_ttl_hours.clamp(1, MAX_DEDUPE_TTL_HOURS))
    }
}

fn invalid(var: &'static str, value: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        var,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_or<T, G>(get: &G, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    G: Fn(&str) -> Option<String>,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| invalid(var, &raw, &e.to_string())),
    }
}

fn parse_bool<G>(get: &G, var: &'static str) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(var).map(|v| v.trim().to_ascii_lowercase()) {
        None => Ok(false),
        Some(v) => match v.as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(invalid(var, &v, "expected true or false")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults() {
        let config = config(&[(ENV_SECRET, "s3cret")]).unwrap();
        assert_eq!(config.secret, b"s3cret");
        assert_eq!(config.listen_addr, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.queue_dir, PathBuf::from("./queue"));
        assert_eq!(config.concurrency, 3);
        assert_eq!(config.workflows_path, PathBuf::from("workflows.yaml"));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.retain_completed, 100);
        assert_eq!(config.retain_failed, 500);
        assert_eq!(config.dedupe_ttl_hours, 24);
        assert_eq!(config.dedupe_capacity, 100_000);
        assert_eq!(config.skill_runner, "skill-runner");
        assert!(!config.log_ignored);
    }

    #[test]
    fn secret_required() {
        assert!(matches!(config(&[]), Err(ConfigError::Missing(ENV_SECRET))));
        assert!(matches!(
            config(&[(ENV_SECRET, "  ")]),
            Err(ConfigError::Missing(ENV_SECRET))
        ));
    }

    #[test]
    fn overrides() {
        let config = config(&[
            (ENV_SECRET, "s"),
            (ENV_LISTEN_ADDR, "127.0.0.1:8080"),
            (ENV_QUEUE_DIR, "/var/lib/dispatch"),
            (ENV_CONCURRENCY, "8"),
            (ENV_MAX_ATTEMPTS, "5"),
            (ENV_LOG_IGNORED, "true"),
            (ENV_SKILL_RUNNER, "/usr/local/bin/skills"),
        ])
        .unwrap();
        assert_eq!(config.listen_addr.port(), 8080);
        assert_eq!(config.concurrency, 8);
        assert!(config.log_ignored);

        let queue = config.queue_config();
        assert_eq!(queue.dir, PathBuf::from("/var/lib/dispatch"));
        assert_eq!(queue.retry.max_attempts, 5);
        assert_eq!(config.executor_settings().skill_runner, "/usr/local/bin/skills");
    }

    #[test]
    fn zero_concurrency_rejected() {
        let err = config(&[(ENV_SECRET, "s"), (ENV_CONCURRENCY, "0")]).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                var: ENV_CONCURRENCY,
                ..
            }
        ));
    }

    #[test]
    fn unparsable_values_rejected() {
        for (var, value) in [
            (ENV_CONCURRENCY, "many"),
            (ENV_LISTEN_ADDR, "not-an-addr"),
            (ENV_LOG_IGNORED, "maybe"),
            (ENV_DEDUPE_TTL_HOURS, "-1"),
            (ENV_DEDUPE_TTL_HOURS, "10000000000"),
            (ENV_DEDUPE_TTL_HOURS, "3000000000000"),
        ] {
            let result = config(&[(ENV_SECRET, "s"), (var, value)]);
            assert!(result.is_err(), "{var}={value} should be rejected");
        }
    }

    #[test]
    fn dedupe_ttl_bounds() {
        let longest = MAX_DEDUPE_TTL_HOURS.to_string();
        let config = config(&[(ENV_SECRET, "s"), (ENV_DEDUPE_TTL_HOURS, &longest)]).unwrap();
        assert_eq!(
            config.dedupe_ttl(),
            chrono::Duration::hours(MAX_DEDUPE_TTL_HOURS)
        );

        let mut config = config;
        config.dedupe_ttl_hours = i64::MAX;
        assert_eq!(
            config.dedupe_ttl(),
            chrono::Duration::hours(MAX_DEDUPE_TTL_HOURS)
        );
    }
}
