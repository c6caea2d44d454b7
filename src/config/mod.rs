//! Typed configuration from environment variables.
//!
//! Loads once at startup, fails fast if required vars are missing or
//! unparseable. Sensitive values wrapped in secrecy::SecretString to
//! prevent log leaks. Every orchestrator tunable has a default; production
//! overrides come in through `CONDUCTOR_*` variables.

pub mod secrets;

use crate::error::{Error, Result};
use secrecy::SecretString;
use std::time::Duration;

#[derive(Debug)]
pub struct Config {
    pub database_url: SecretString,
    /// Optional. Without it the intent classifier runs keyword-only.
    pub anthropic_api_key: Option<SecretString>,
    /// Optional. Signature verification is enforced when set.
    pub webhook_secret: Option<SecretString>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
    pub orchestrator: OrchestratorSettings,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    /// In production, systemd EnvironmentFile provides the vars.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            database_url: SecretString::from(required_var("DATABASE_URL")?),
            anthropic_api_key: std::env::var("ANTHROPIC_API_KEY")
                .ok()
                .map(SecretString::from),
            webhook_secret: std::env::var("WEBHOOK_SECRET").ok().map(SecretString::from),
            otel_endpoint: std::env::var("OTEL_ENDPOINT").ok(),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            orchestrator: OrchestratorSettings::from_env()?,
        })
    }
}

/// Orchestrator tunables. Retry budget, backoff shape, lock cooldown,
/// dedup retention, checkpoint size cap, and the lane definitions.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    /// Re-enqueue budget for transient failures. The first delivery plus
    /// this many retries, then dead-letter.
    pub max_retries: u32,
    pub base_backoff: Duration,
    /// Single long delay used when a downstream provider signals overload.
    pub overload_backoff: Duration,
    /// Window after a lock release during which re-acquisition is refused.
    pub lock_cooldown: Duration,
    /// How long an acquire waits on an active holder before giving up.
    pub lock_timeout: Duration,
    pub idempotency_ttl: Duration,
    pub checkpoint_cap_bytes: usize,
    /// Fallback reactivation source when a task has no completed run.
    pub default_snapshot_ref: String,
    /// Routing key used when an event doesn't select a workflow.
    pub default_workflow: String,
    pub lanes: LaneSettings,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_backoff: Duration::from_secs(30),
            overload_backoff: Duration::from_secs(900),
            lock_cooldown: Duration::from_secs(5),
            lock_timeout: Duration::from_secs(10),
            idempotency_ttl: Duration::from_secs(24 * 3600),
            checkpoint_cap_bytes: 64 * 1024,
            default_snapshot_ref: "main".to_string(),
            default_workflow: "default".to_string(),
            lanes: LaneSettings::default(),
        }
    }
}

impl OrchestratorSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_retries: parsed_var("CONDUCTOR_MAX_RETRIES", defaults.max_retries)?,
            base_backoff: secs_var("CONDUCTOR_BASE_BACKOFF_SECS", defaults.base_backoff)?,
            overload_backoff: secs_var(
                "CONDUCTOR_OVERLOAD_BACKOFF_SECS",
                defaults.overload_backoff,
            )?,
            lock_cooldown: secs_var("CONDUCTOR_LOCK_COOLDOWN_SECS", defaults.lock_cooldown)?,
            lock_timeout: secs_var("CONDUCTOR_LOCK_TIMEOUT_SECS", defaults.lock_timeout)?,
            idempotency_ttl: secs_var("CONDUCTOR_IDEMPOTENCY_TTL_SECS", defaults.idempotency_ttl)?,
            checkpoint_cap_bytes: parsed_var(
                "CONDUCTOR_CHECKPOINT_CAP_BYTES",
                defaults.checkpoint_cap_bytes,
            )?,
            default_snapshot_ref: std::env::var("CONDUCTOR_DEFAULT_SNAPSHOT_REF")
                .unwrap_or(defaults.default_snapshot_ref),
            default_workflow: std::env::var("CONDUCTOR_DEFAULT_WORKFLOW")
                .unwrap_or(defaults.default_workflow),
            lanes: LaneSettings::from_env()?,
        })
    }
}

/// The three lanes every deployment carries. Dead-letter is reserved:
/// nothing consumes it automatically.
#[derive(Debug, Clone)]
pub struct LaneSettings {
    pub ingress: LaneConfig,
    pub work: LaneConfig,
    pub dead_letter: LaneConfig,
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self {
            ingress: LaneConfig {
                name: "ingress".to_string(),
                max_priority: 5,
                message_ttl: Duration::from_secs(3600),
            },
            work: LaneConfig {
                name: "work".to_string(),
                max_priority: 10,
                message_ttl: Duration::from_secs(6 * 3600),
            },
            dead_letter: LaneConfig {
                name: "dead_letter".to_string(),
                max_priority: 0,
                message_ttl: Duration::from_secs(30 * 24 * 3600),
            },
        }
    }
}

impl LaneSettings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            ingress: LaneConfig::from_env("CONDUCTOR_INGRESS", defaults.ingress)?,
            work: LaneConfig::from_env("CONDUCTOR_WORK", defaults.work)?,
            dead_letter: LaneConfig::from_env("CONDUCTOR_DEAD_LETTER", defaults.dead_letter)?,
        })
    }
}

/// One named pgmq lane: a priority ceiling and a message TTL.
#[derive(Debug, Clone)]
pub struct LaneConfig {
    pub name: String,
    /// Published priorities are clamped to this.
    pub max_priority: i32,
    /// Messages older than this at read time are archived, never executed.
    pub message_ttl: Duration,
}

impl LaneConfig {
    fn from_env(prefix: &str, defaults: Self) -> Result<Self> {
        Ok(Self {
            name: defaults.name,
            max_priority: parsed_var(&format!("{prefix}_MAX_PRIORITY"), defaults.max_priority)?,
            message_ttl: secs_var(&format!("{prefix}_TTL_SECS"), defaults.message_ttl)?,
        })
    }
}

fn required_var(name: &str) -> Result<String> {
    std::env::var(name)
        .map_err(|_| Error::Config(format!("required environment variable {name} is not set")))
}

fn parsed_var<T: std::str::FromStr>(name: &str, default: T) -> Result<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("cannot parse {name}={raw}"))),
        Err(_) => Ok(default),
    }
}

fn secs_var(name: &str, default: Duration) -> Result<Duration> {
    Ok(Duration::from_secs(parsed_var(
        name,
        default.as_secs(),
    )?))
}
