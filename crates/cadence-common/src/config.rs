//! Operator configuration loaded from the environment
//!
//! | variable                          | default   |
//! |-----------------------------------|-----------|
//! | `POD_NAMESPACE`                   | `default` |
//! | `LOG_LEVEL`                       | `DEBUG`   |
//! | `CADENCE_SWEEP_SECONDS`           | `5`       |
//! | `CADENCE_COMMAND_TIMEOUT_SECONDS` | `30`      |

use std::time::Duration;

use crate::{Error, Result};

/// Namespace used when `POD_NAMESPACE` is unset
pub const DEFAULT_NAMESPACE: &str = "default";

/// Default conductor sweep timeout
pub const DEFAULT_SWEEP: Duration = Duration::from_secs(5);

/// Default coordinator convergence timeout
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Verbosity accepted by `LOG_LEVEL`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogLevel {
    /// Everything, including unregistered-job drops
    Trace,
    /// Patches and pod deltas
    #[default]
    Debug,
    /// Resource additions, modifications and deletions
    Info,
    /// Recoverable anomalies
    Warn,
    /// Failed reconciliations only
    Error,
}

impl LogLevel {
    /// `EnvFilter` directive for this level
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "TRACE" | "ALL" => Ok(Self::Trace),
            "DEBUG" => Ok(Self::Debug),
            "INFO" => Ok(Self::Info),
            "WARN" | "WARNING" => Ok(Self::Warn),
            "ERROR" | "FATAL" => Ok(Self::Error),
            other => Err(Error::validation_for_field(
                "LOG_LEVEL",
                format!("unknown log level '{}'", other),
            )),
        }
    }
}

/// Runtime settings of the operator
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Namespace watched and mutated
    pub namespace: String,
    /// Log verbosity
    pub log_level: LogLevel,
    /// How long the conductor waits on an empty queue before re-checking it
    pub sweep: Duration,
    /// How long a coordinator command waits for convergence
    pub command_timeout: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            log_level: LogLevel::default(),
            sweep: DEFAULT_SWEEP,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl OperatorConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let namespace = lookup("POD_NAMESPACE")
            .filter(|ns| !ns.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());

        let log_level = match lookup("LOG_LEVEL") {
            Some(level) => level.parse()?,
            None => LogLevel::default(),
        };

        let sweep = seconds(&lookup, "CADENCE_SWEEP_SECONDS")?.unwrap_or(DEFAULT_SWEEP);
        let command_timeout = seconds(&lookup, "CADENCE_COMMAND_TIMEOUT_SECONDS")?
            .unwrap_or(DEFAULT_COMMAND_TIMEOUT);

        Ok(Self {
            namespace,
            log_level,
            sweep,
            command_timeout,
        })
    }
}

fn seconds<F>(lookup: &F, key: &str) -> Result<Option<Duration>>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let secs: u64 = raw.trim().parse().map_err(|_| {
        Error::validation_for_field(key, format!("expected whole seconds, got '{}'", raw))
    })?;
    if secs == 0 {
        return Err(Error::validation_for_field(key, "must be at least 1 second"));
    }
    Ok(Some(Duration::from_secs(secs)))
}
