//! Control loop configuration.

use std::time::Duration;

use cadence_telemetry::TracingFormat;

/// Errors produced while reading [`LoopConfig`] from the environment.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A numeric variable could not be parsed.
    #[error("{var} must be a non-negative integer, got `{value}`")]
    InvalidNumber {
        /// Variable name.
        var: &'static str,
        /// The rejected value.
        value: String,
    },

    /// The loop period was zero.
    #[error("{0} must be greater than zero")]
    ZeroPeriod(&'static str),

    /// The log format is not one of `pretty`, `compact` or `json`.
    #[error("unknown log format `{0}` (expected pretty, compact or json)")]
    UnknownFormat(String),
}

/// Settings for the robot control loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopConfig {
    /// Time between scheduler ticks.
    pub period: Duration,
    /// Number of ticks to run before exiting. `None` runs until interrupted.
    pub ticks: Option<u64>,
    /// Log output format.
    pub log_format: TracingFormat,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_millis(20),
            ticks: None,
            log_format: TracingFormat::Compact,
        }
    }
}

impl LoopConfig {
    /// Loop period in milliseconds.
    pub const PERIOD_VAR: &'static str = "CADENCE_PERIOD_MS";
    /// Tick limit.
    pub const TICKS_VAR: &'static str = "CADENCE_TICKS";
    /// Log format name.
    pub const LOG_FORMAT_VAR: &'static str = "CADENCE_LOG_FORMAT";

    /// Reads the configuration from process environment variables.
    ///
    /// Unset variables keep their defaults.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a variable is set to an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name
    /// to its value.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if a variable is set to an invalid value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(value) = lookup(Self::PERIOD_VAR) {
            let millis = parse_number(Self::PERIOD_VAR, &value)?;
            if millis == 0 {
                return Err(ConfigError::ZeroPeriod(Self::PERIOD_VAR));
            }
            config.period = Duration::from_millis(millis);
        }

        if let Some(value) = lookup(Self::TICKS_VAR) {
            config.ticks = Some(parse_number(Self::TICKS_VAR, &value)?);
        }

        if let Some(value) = lookup(Self::LOG_FORMAT_VAR) {
            config.log_format =
                TracingFormat::parse(&value).ok_or(ConfigError::UnknownFormat(value))?;
        }

        Ok(config)
    }
}

fn parse_number(var: &'static str, value: &str) -> Result<u64, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::InvalidNumber {
            var,
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |var| vars.get(var).cloned()
    }

    #[test]
    fn unset_variables_keep_defaults() {
        let config = LoopConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, LoopConfig::default());
        assert_eq!(config.period, Duration::from_millis(20));
    }

    #[test]
    fn reads_all_variables() {
        let config = LoopConfig::from_lookup(lookup(&[
            ("CADENCE_PERIOD_MS", "10"),
            ("CADENCE_TICKS", " 250 "),
            ("CADENCE_LOG_FORMAT", "JSON"),
        ]))
        .unwrap();

        assert_eq!(config.period, Duration::from_millis(10));
        assert_eq!(config.ticks, Some(250));
        assert_eq!(config.log_format, TracingFormat::Json);
    }

    #[test]
    fn rejects_invalid_values() {
        assert_eq!(
            LoopConfig::from_lookup(lookup(&[("CADENCE_TICKS", "-1")])),
            Err(ConfigError::InvalidNumber {
                var: "CADENCE_TICKS",
                value: "-1".to_string(),
            })
        );
        assert_eq!(
            LoopConfig::from_lookup(lookup(&[("CADENCE_PERIOD_MS", "0")])),
            Err(ConfigError::ZeroPeriod("CADENCE_PERIOD_MS"))
        );
        assert_eq!(
            LoopConfig::from_lookup(lookup(&[("CADENCE_LOG_FORMAT", "xml")])),
            Err(ConfigError::UnknownFormat("xml".to_string()))
        );
    }
}
