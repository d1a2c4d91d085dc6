//! Tracing subscriber setup.
//!
//! [`TracingSetup`] installs a global `tracing` subscriber for a control
//! loop process and reports the configuration it applied as a
//! [`TracingConfig`].
//!
//! # Example
//!
//! ```
//! use cadence_telemetry::{TracingFormat, TracingSetup};
//! use tracing::Level;
//!
//! // Development: pretty output with debug level
//! let config = TracingSetup::default()
//!     .with_level(Level::DEBUG)
//!     .with_format(TracingFormat::Pretty)
//!     .init();
//! assert_eq!(config.level, Level::DEBUG);
//!
//! // On the robot: compact lines, scheduler details only
//! let robot = TracingSetup::default()
//!     .with_format(TracingFormat::Compact)
//!     .with_env_filter("cadence_commands=debug,robot=info");
//! # let _ = robot;
//! ```

use tracing::Level;
use tracing_subscriber::{EnvFilter, Layer};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

// ─────────────────────────────────────────────────────────────────────────────
// TracingFormat
// ─────────────────────────────────────────────────────────────────────────────

/// Tracing output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingFormat {
    /// Human-readable colored output (default).
    #[default]
    Pretty,
    /// Compact single-line output.
    Compact,
    /// JSON structured output for log aggregation.
    Json,
}

impl TracingFormat {
    /// Parses a format name, case-insensitively.
    ///
    /// Accepts `pretty`, `compact`, and `json`.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pretty" => Some(Self::Pretty),
            "compact" => Some(Self::Compact),
            "json" => Some(Self::Json),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingConfig
// ─────────────────────────────────────────────────────────────────────────────

/// The configuration a [`TracingSetup`] applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TracingConfig {
    /// The configured log level.
    pub level: Level,
    /// The configured output format.
    pub format: TracingFormat,
}

// ─────────────────────────────────────────────────────────────────────────────
// TracingSetup
// ─────────────────────────────────────────────────────────────────────────────

/// Builder for the process-wide tracing subscriber.
///
/// Uses the [`tracing`] and [`tracing_subscriber`] crates under the hood.
/// Installing a subscriber twice is harmless: the second [`init`](Self::init)
/// leaves the first subscriber in place.
#[derive(Debug, Clone)]
pub struct TracingSetup {
    /// Maximum log level.
    level: Level,
    /// Output format.
    format: TracingFormat,
    /// Environment filter (e.g., "`cadence_commands=debug,robot=info`").
    env_filter: Option<String>,
    /// Whether to include span events (enter/exit).
    span_events: bool,
}

impl Default for TracingSetup {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: TracingFormat::Pretty,
            env_filter: None,
            span_events: false,
        }
    }
}

impl TracingSetup {
    /// Creates a new `TracingSetup` with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the maximum log level.
    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    /// Sets the output format.
    #[must_use]
    pub fn with_format(mut self, format: TracingFormat) -> Self {
        self.format = format;
        self
    }

    /// Sets a custom environment filter string.
    ///
    /// Format: `target=level,target=level,...`. An invalid filter falls back
    /// to the configured level.
    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Enables span enter/exit events in output.
    #[must_use]
    pub fn with_span_events(mut self, enabled: bool) -> Self {
        self.span_events = enabled;
        self
    }

    /// Returns the configuration this setup will apply.
    #[must_use]
    pub fn config(&self) -> TracingConfig {
        TracingConfig {
            level: self.level,
            format: self.format,
        }
    }

    fn env_filter(&self) -> EnvFilter {
        match &self.env_filter {
            Some(filter) => {
                EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(self.level.as_str()))
            }
            None => EnvFilter::new(self.level.as_str()),
        }
    }

    /// Installs the global subscriber.
    ///
    /// If a global subscriber is already installed it is left in place.
    pub fn init(self) -> TracingConfig {
        let span_events = if self.span_events {
            FmtSpan::ENTER | FmtSpan::EXIT
        } else {
            FmtSpan::NONE
        };

        let fmt = tracing_subscriber::fmt::layer().with_span_events(span_events);
        let output = match self.format {
            TracingFormat::Pretty => fmt.pretty().boxed(),
            TracingFormat::Compact => fmt.compact().boxed(),
            TracingFormat::Json => fmt.json().boxed(),
        };

        let installed = tracing_subscriber::registry()
            .with(self.env_filter())
            .with(output)
            .try_init()
            .is_ok();

        if installed {
            tracing::info!(
                level = %self.level,
                format = ?self.format,
                "Tracing initialized"
            );
        } else {
            tracing::debug!("Tracing subscriber already installed");
        }
        self.config()
    }
}
