//! Configuration loading and validation.
//!
//! Loads [`TrioConfig`] from `./trio.toml` (or `$TRIO_CONFIG_PATH`).
//! Environment variables override file values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

// ── Top-level config ────────────────────────────────────────────

/// Top-level engine configuration loaded from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TrioConfig {
    /// Per-channel timeout and retry policies.
    pub channels: ChannelsConfig,
    /// Feature flags.
    pub features: FeaturesConfig,
    /// Error escalation, circuit breaker and history limits.
    pub recovery: RecoveryConfig,
    /// Outbound email provider settings.
    pub email: EmailConfig,
    /// Persistent storage paths.
    pub storage: StorageConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

impl TrioConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// If the file does not exist, defaults are used.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        let mut config = Self::load_from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Load from a TOML file only, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                Self::from_toml(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Resolve the config path using a custom env resolver.
    pub fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("TRIO_CONFIG_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("trio.toml"))
    }

    /// Parse a TOML string into config.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: TrioConfig = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        override_parsed(&env, "TRIO_EMAIL_TIMEOUT_MS", &mut self.channels.email.timeout_ms);
        override_parsed(&env, "TRIO_EMAIL_RETRIES", &mut self.channels.email.retries);
        override_parsed(
            &env,
            "TRIO_MESSAGE_TIMEOUT_MS",
            &mut self.channels.message.timeout_ms,
        );
        override_parsed(&env, "TRIO_MESSAGE_RETRIES", &mut self.channels.message.retries);
        override_parsed(
            &env,
            "TRIO_SOCKET_TIMEOUT_MS",
            &mut self.channels.socket.timeout_ms,
        );
        override_parsed(&env, "TRIO_SOCKET_RETRIES", &mut self.channels.socket.retries);
        override_parsed(
            &env,
            "TRIO_ENABLE_ROLLBACK",
            &mut self.features.enable_rollback,
        );

        if let Some(v) = env("TRIO_EMAIL_ENDPOINT") {
            self.email.endpoint = Some(v);
        }
        if let Some(v) = env("TRIO_MESSAGE_DB") {
            self.storage.message_db = PathBuf::from(v);
        }
        if let Some(v) = env("TRIO_LOG_LEVEL") {
            self.logging.level = v;
        }
    }

    /// Range-check values once at process start.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> Result<()> {
        for (name, policy) in [
            ("email", &self.channels.email),
            ("message", &self.channels.message),
            ("socket", &self.channels.socket),
        ] {
            if policy.timeout_ms == 0 {
                anyhow::bail!("channels.{name}.timeout_ms must be greater than zero");
            }
            if !(1..=MAX_RETRIES).contains(&policy.retries) {
                anyhow::bail!(
                    "channels.{name}.retries must be between 1 and {MAX_RETRIES}, got {}",
                    policy.retries
                );
            }
        }

        let r = &self.recovery;
        if !(0.0..=1.0).contains(&r.stats_reset_probability) {
            anyhow::bail!(
                "recovery.stats_reset_probability must be within [0, 1], got {}",
                r.stats_reset_probability
            );
        }
        if r.history_trim_to > r.history_limit {
            anyhow::bail!(
                "recovery.history_trim_to ({}) must not exceed recovery.history_limit ({})",
                r.history_trim_to,
                r.history_limit
            );
        }
        if r.circuit_threshold == 0 || r.escalation_threshold == 0 {
            anyhow::bail!("recovery thresholds must be greater than zero");
        }
        Ok(())
    }
}

/// Upper bound on any per-channel retry count.
const MAX_RETRIES: u32 = 10;

fn override_parsed<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    slot: &mut T,
) {
    if let Some(v) = env(var) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Channels ────────────────────────────────────────────────────

/// Timeout and retry policy for each of the three channels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    /// Outbound email send.
    pub email: ChannelPolicy,
    /// Persisted message write.
    pub message: ChannelPolicy,
    /// Real-time push, applied per recipient.
    pub socket: ChannelPolicy,
}

impl Default for ChannelsConfig {
    fn default() -> Self {
        Self {
            email: ChannelPolicy {
                timeout_ms: 10_000,
                retries: 3,
                base_delay_ms: 1_000,
            },
            message: ChannelPolicy {
                timeout_ms: 5_000,
                retries: 2,
                base_delay_ms: 1_000,
            },
            socket: ChannelPolicy {
                timeout_ms: 3_000,
                retries: 2,
                base_delay_ms: 500,
            },
        }
    }
}

/// Hard timeout plus bounded exponential-backoff retry for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelPolicy {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Total number of attempts before giving up.
    pub retries: u32,
    /// Backoff base; attempt `n` waits `base_delay_ms * 2^(n-1)` before the next try.
    pub base_delay_ms: u64,
}

impl ChannelPolicy {
    /// Per-attempt timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Delay to wait after a failed `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.base_delay_ms.saturating_mul(1_u64 << exp))
    }

    /// Apply per-call overrides, keeping configured values for `None`.
    pub fn with_overrides(self, timeout_ms: Option<u64>, retries: Option<u32>) -> Self {
        Self {
            timeout_ms: timeout_ms.unwrap_or(self.timeout_ms),
            retries: retries.unwrap_or(self.retries).max(1),
            base_delay_ms: self.base_delay_ms,
        }
    }
}

// ── Features ────────────────────────────────────────────────────

/// Feature flags.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FeaturesConfig {
    /// Compensate already-performed operations when a step fails.
    pub enable_rollback: bool,
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            enable_rollback: true,
        }
    }
}

// ── Recovery ────────────────────────────────────────────────────

/// Error escalation and circuit breaker tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Failures per `(service, type)` key after which the circuit breaker is forced.
    pub escalation_threshold: u64,
    /// Breaker failures within the reset window that open the circuit.
    pub circuit_threshold: u32,
    /// Quiet period after which a breaker resets, in seconds.
    pub circuit_reset_secs: u64,
    /// Recovery history size that triggers trimming.
    pub history_limit: usize,
    /// Entries kept after trimming.
    pub history_trim_to: usize,
    /// Chance that recording an error clears all error counters.
    pub stats_reset_probability: f64,
    /// Delay used by the deferred-retry strategy, in seconds.
    pub deferred_retry_secs: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            escalation_threshold: 3,
            circuit_threshold: 5,
            circuit_reset_secs: 60,
            history_limit: 1_000,
            history_trim_to: 500,
            stats_reset_probability: 0.01,
            deferred_retry_secs: 300,
        }
    }
}

// ── Email provider ──────────────────────────────────────────────

/// Outbound email provider settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    /// HTTP endpoint of the transactional email provider. `None` logs instead of sending.
    pub endpoint: Option<String>,
    /// Environment variable holding the provider API key.
    pub api_key_env: String,
    /// Sender address.
    pub from: String,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            api_key_env: "TRIO_EMAIL_API_KEY".to_owned(),
            from: "no-reply@localhost".to_owned(),
        }
    }
}

// ── Storage ─────────────────────────────────────────────────────

/// Persistent storage paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// SQLite database holding persisted messages.
    pub message_db: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            message_db: PathBuf::from("trio.db"),
        }
    }
}

// ── Logging ─────────────────────────────────────────────────────

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Directory for rotated JSON logs. `None` logs to stderr only.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_owned(),
            dir: None,
        }
    }
}
