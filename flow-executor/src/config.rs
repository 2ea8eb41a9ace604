// Executor Configuration
// Batch and line execution settings, loadable from YAML files and the environment

use crate::error::{ExecutorError, ExecutorResult};

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

pub const ENV_WORKER_COUNT: &str = "FLOWEXEC_WORKER_COUNT";
pub const ENV_NODE_CONCURRENCY: &str = "FLOWEXEC_NODE_CONCURRENCY";
pub const ENV_LINE_TIMEOUT_SEC: &str = "FLOWEXEC_LINE_TIMEOUT_SEC";
pub const ENV_RAISE_ON_ERROR: &str = "FLOWEXEC_RAISE_ON_ERROR";
pub const ENV_ALLOW_STREAM_OUTPUT: &str = "FLOWEXEC_ALLOW_STREAM_OUTPUT";

/// Configuration for flow execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ExecutorConfig {
    /// Number of lines run concurrently in a batch
    pub worker_count: usize,
    /// Maximum concurrently running nodes within a line (0 = unlimited)
    pub node_concurrency: usize,
    /// Wall-clock budget of a single line, in seconds
    #[serde(with = "optional_secs")]
    pub line_timeout: Option<Duration>,
    /// Abort a line on its first node failure and surface the error to the caller
    pub raise_on_error: bool,
    /// Hand unconsumed stream outputs to the caller instead of materializing them
    pub allow_stream_output: bool,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            node_concurrency: 0,
            line_timeout: None,
            raise_on_error: false,
            allow_stream_output: false,
        }
    }
}

impl ExecutorConfig {
    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_node_concurrency(mut self, node_concurrency: usize) -> Self {
        self.node_concurrency = node_concurrency;
        self
    }

    pub fn with_line_timeout(mut self, timeout: Duration) -> Self {
        self.line_timeout = Some(timeout);
        self
    }

    pub fn with_raise_on_error(mut self, raise_on_error: bool) -> Self {
        self.raise_on_error = raise_on_error;
        self
    }

    pub fn with_stream_output(mut self, allow: bool) -> Self {
        self.allow_stream_output = allow;
        self
    }

    /// Load from a YAML file; absent fields keep their defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> ExecutorResult<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content).map_err(|e| ExecutorError::Config {
            message: format!("{}: {}", path.display(), e),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the `FLOWEXEC_*` environment variables
    pub fn from_env() -> ExecutorResult<Self> {
        Self::default().merge_env(|key| std::env::var(key).ok())
    }

    /// Apply overrides from a variable lookup
    pub fn merge_env<F>(mut self, lookup: F) -> ExecutorResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = parse_var::<usize>(&lookup, ENV_WORKER_COUNT)? {
            self.worker_count = value;
        }
        if let Some(value) = parse_var::<usize>(&lookup, ENV_NODE_CONCURRENCY)? {
            self.node_concurrency = value;
        }
        if let Some(value) = parse_var::<f64>(&lookup, ENV_LINE_TIMEOUT_SEC)? {
            self.line_timeout = seconds(value).map_err(|message| ExecutorError::Config {
                message: format!("{}: {}", ENV_LINE_TIMEOUT_SEC, message),
            })?;
        }
        if let Some(value) = parse_var::<bool>(&lookup, ENV_RAISE_ON_ERROR)? {
            self.raise_on_error = value;
        }
        if let Some(value) = parse_var::<bool>(&lookup, ENV_ALLOW_STREAM_OUTPUT)? {
            self.allow_stream_output = value;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> ExecutorResult<()> {
        if self.worker_count == 0 {
            return Err(ExecutorError::Config {
                message: "worker_count must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_var<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> ExecutorResult<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ExecutorError::Config {
                message: format!("{}={:?}: {}", key, raw, e),
            }),
    }
}

/// Zero or less disables the timeout
fn seconds(value: f64) -> Result<Option<Duration>, String> {
    if !value.is_finite() {
        return Err(format!("{} is not a valid number of seconds", value));
    }
    if value <= 0.0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_secs_f64(value)))
}

mod optional_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(duration) => serializer.serialize_some(&duration.as_secs_f64()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<f64>::deserialize(deserializer)?;
        match secs {
            Some(value) => super::seconds(value).map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}
