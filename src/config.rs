use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// File name used under `$HOME` when `GATOR_CONFIG` is not set.
pub const CONFIG_FILE_NAME: &str = ".gatorconfig.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("cannot locate config file: neither GATOR_CONFIG nor HOME is set")]
    NoConfigLocation,

    #[error("no database URL configured (set db_url or DATABASE_URL)")]
    MissingDatabaseUrl,

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("invalid duration {input:?}: {reason}")]
    InvalidDuration { input: String, reason: &'static str },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub db_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_user_name: Option<String>,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Deadline for a single feed fetch, in seconds
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Consecutive repository failures before the scheduler escalates to error logs
    #[serde(default = "default_repository_failure_threshold")]
    pub repository_failure_threshold: u32,
}

fn default_user_agent() -> String {
    format!("gator/{}", env!("CARGO_PKG_VERSION"))
}

fn default_fetch_timeout_secs() -> u64 {
    10
}

fn default_repository_failure_threshold() -> u32 {
    5
}

impl Config {
    pub fn new(db_url: impl Into<String>) -> Self {
        Self {
            db_url: db_url.into(),
            current_user_name: None,
            user_agent: default_user_agent(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            repository_failure_threshold: default_repository_failure_threshold(),
        }
    }

    /// Resolve the config file location: `$GATOR_CONFIG`, else `$HOME/.gatorconfig.toml`.
    pub fn default_path() -> Result<PathBuf, ConfigError> {
        if let Some(path) = std::env::var_os("GATOR_CONFIG") {
            return Ok(PathBuf::from(path));
        }
        std::env::var_os("HOME")
            .map(|home| PathBuf::from(home).join(CONFIG_FILE_NAME))
            .ok_or(ConfigError::NoConfigLocation)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_str(&content)
    }

    /// Parse config from a TOML string (useful for testing)
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn set_user(&mut self, name: &str) {
        self.current_user_name = Some(name.to_string());
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.fetch_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "fetch_timeout_secs must be greater than zero".to_string(),
            ));
        }
        if self.repository_failure_threshold == 0 {
            return Err(ConfigError::Invalid(
                "repository_failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.user_agent.trim().is_empty() {
            return Err(ConfigError::Invalid("user_agent must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Parse a duration such as `30s`, `1m`, `250ms` or `1h30m`.
///
/// Accepted units are `ns`, `us` (or `µs`), `ms`, `s`, `m` and `h`. Every
/// number needs a unit, fractions are allowed (`1.5h`), and the total must be
/// greater than zero.
pub fn parse_duration(input: &str) -> Result<Duration, ConfigError> {
    let invalid = |reason| ConfigError::InvalidDuration {
        input: input.to_string(),
        reason,
    };

    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(invalid("empty duration"));
    }
    if trimmed.starts_with('-') {
        return Err(invalid("duration must be positive"));
    }

    let mut rest = trimmed.strip_prefix('+').unwrap_or(trimmed);
    let mut total_nanos: u128 = 0;

    while !rest.is_empty() {
        let number_end = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(rest.len());
        let number = &rest[..number_end];
        rest = &rest[number_end..];

        let unit_end = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let unit = &rest[..unit_end];
        rest = &rest[unit_end..];

        let unit_nanos: u128 = match unit {
            "ns" => 1,
            "us" | "µs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60 * 1_000_000_000,
            "h" => 3_600 * 1_000_000_000,
            "" => return Err(invalid("missing unit")),
            _ => return Err(invalid("unknown unit")),
        };

        let (whole, fraction) = number.split_once('.').unwrap_or((number, ""));
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid("expected a number"));
        }

        let whole: u128 = if whole.is_empty() {
            0
        } else {
            whole.parse().map_err(|_| invalid("malformed number"))?
        };
        let mut nanos = whole
            .checked_mul(unit_nanos)
            .ok_or_else(|| invalid("duration out of range"))?;

        if !fraction.is_empty() {
            let digits: u128 = fraction
                .parse()
                .map_err(|_| invalid("malformed number"))?;
            let scale = 10u128
                .checked_pow(fraction.len() as u32)
                .ok_or_else(|| invalid("too many fractional digits"))?;
            let fraction_nanos = digits
                .checked_mul(unit_nanos)
                .ok_or_else(|| invalid("too many fractional digits"))?
                / scale;
            nanos += fraction_nanos;
        }

        total_nanos = total_nanos
            .checked_add(nanos)
            .ok_or_else(|| invalid("duration out of range"))?;
    }

    if total_nanos == 0 {
        return Err(invalid("duration must be greater than zero"));
    }

    let nanos = u64::try_from(total_nanos).map_err(|_| invalid("duration out of range"))?;
    Ok(Duration::from_nanos(nanos))
}
