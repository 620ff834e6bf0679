//! Trace capacity configuration.
//!
//! The capacity comes from a debug settings string of comma-separated `key=value` entries, e.g.
//! `eventtrace=256,sched=1`. Only the `eventtrace` key is read; other keys are left to whoever
//! owns them.

use alloc::string::{String, ToString};

/// Settings key holding the trace capacity.
pub const SETTINGS_KEY: &str = "eventtrace";

/// Environment variable read by [`TraceConfig::from_env`].
pub const ENV_VAR: &str = "PH_DEBUG";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("`eventtrace` needs a value, e.g. `eventtrace=128`")]
    MissingValue,
    #[error("invalid `eventtrace` capacity {value:?}")]
    InvalidCapacity { value: String },
    #[error("`PH_DEBUG` is not valid unicode")]
    NotUnicode,
}

/// How many records the trace keeps. Zero or negative disables tracing.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct TraceConfig {
    pub capacity: i64,
}

impl TraceConfig {
    pub const fn disabled() -> Self {
        Self { capacity: 0 }
    }

    pub const fn with_capacity(capacity: i64) -> Self {
        Self { capacity }
    }

    #[inline]
    pub const fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// Ring capacity in slots; `0` when disabled.
    pub fn slots(&self) -> usize {
        usize::try_from(self.capacity).unwrap_or(0)
    }

    /// Read the capacity out of a settings string. The last `eventtrace` entry wins; no entry
    /// means tracing stays disabled.
    pub fn parse(settings: &str) -> Result<Self, ConfigError> {
        let mut config = Self::disabled();
        for entry in settings.split(',').map(str::trim) {
            let (key, value) = match entry.split_once('=') {
                Some((key, value)) => (key.trim(), Some(value.trim())),
                None => (entry, None),
            };
            if key != SETTINGS_KEY {
                continue;
            }
            let value = value.ok_or(ConfigError::MissingValue)?;
            let capacity = value
                .parse::<i64>()
                .map_err(|_| ConfigError::InvalidCapacity {
                    value: value.to_string(),
                })?;
            config = Self::with_capacity(capacity);
        }
        Ok(config)
    }

    /// Parse the settings in [`ENV_VAR`]. Unset means disabled.
    #[cfg(feature = "std")]
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var(ENV_VAR) {
            Ok(settings) => Self::parse(&settings),
            Err(std::env::VarError::NotPresent) => Ok(Self::disabled()),
            Err(std::env::VarError::NotUnicode(_)) => Err(ConfigError::NotUnicode),
        }
    }
}
