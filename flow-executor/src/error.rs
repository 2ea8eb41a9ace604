// Executor Error Types
// Error taxonomy for flow loading, line execution and batch setup

use crate::execution::graph::GraphError;
use crate::parser::error::ParseError;
use crate::tools::ToolExecutionError;

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by the flow executor
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error(transparent)]
    GraphValidation(#[from] GraphError),

    #[error(transparent)]
    ToolExecution(#[from] ToolExecutionError),

    /// Internal invariant violation: nothing is ready but nodes are still pending
    #[error("unresolved dependencies, nodes can never run: {}", pending.join(", "))]
    UnresolvedDependency { pending: Vec<String> },

    #[error("line {} exceeded the timeout of {}s", display_line(line_number), timeout.as_secs_f64())]
    LineTimeout {
        line_number: Option<usize>,
        timeout: Duration,
    },

    #[error("the input data is empty, nothing to run")]
    EmptyInputsData,

    #[error("input mapping error: {message}")]
    InputMapping { message: String },

    #[error("invalid value for flow input '{input}': {message}")]
    InputType { input: String, message: String },

    #[error("cannot resolve inputs of node '{node}': {message}")]
    InputResolution { node: String, message: String },

    #[error("node '{node}' was not executed because upstream node '{upstream}' failed")]
    UpstreamFailed { node: String, upstream: String },

    #[error("execution canceled: {reason}")]
    Canceled { reason: String },

    #[error("invalid configuration: {message}")]
    Config { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_line(line_number: &Option<usize>) -> String {
    line_number
        .map(|n| n.to_string())
        .unwrap_or_else(|| "-".to_string())
}

impl ExecutorError {
    /// Stable error code recorded in run infos
    pub fn code(&self) -> &'static str {
        match self {
            ExecutorError::Parse(_) => "ParseError",
            ExecutorError::GraphValidation(_) => "GraphValidationError",
            ExecutorError::ToolExecution(_) => "ToolExecutionError",
            ExecutorError::UnresolvedDependency { .. } => "UnresolvedDependencyError",
            ExecutorError::LineTimeout { .. } => "LineTimeoutError",
            ExecutorError::EmptyInputsData => "EmptyInputsData",
            ExecutorError::InputMapping { .. } => "InputMappingError",
            ExecutorError::InputType { .. } => "InputTypeError",
            ExecutorError::InputResolution { .. } => "InputResolutionError",
            ExecutorError::UpstreamFailed { .. } => "UpstreamFailed",
            ExecutorError::Canceled { .. } => "Canceled",
            ExecutorError::Config { .. } => "ConfigError",
            ExecutorError::Io(_) => "IoError",
        }
    }

    pub fn to_info(&self) -> ErrorInfo {
        ErrorInfo::new(self.code(), self)
    }
}

/// Serializable error record stored on run infos
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    /// Messages of the source chain, outermost first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, err: &(dyn StdError + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut source = err.source();
        while let Some(inner) = source {
            chain.push(inner.to_string());
            source = inner.source();
        }

        Self {
            code: code.into(),
            message: err.to_string(),
            chain,
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// Result type for executor operations
pub type ExecutorResult<T> = Result<T, ExecutorError>;
