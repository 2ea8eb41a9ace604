// Tools Module
// Tool trait, argument helpers and the registry that resolves tool identifiers

pub mod cache;
pub mod invoker;
pub mod signature;
pub mod stream;
pub mod trace;

pub use cache::{CachedOutput, ToolCache};
pub use invoker::{Invocation, NodeValue, ToolInvoker};
pub use signature::{ParamSpec, ParamType, ToolSignature};
pub use stream::{materialize, RecordingStream};
pub use trace::{MetricLogger, Trace, Tracer};

use crate::connections::{Connection, ConnectionError};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

/// Errors raised by a tool body
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0}")]
    Failed(String),

    #[error("missing argument '{0}'")]
    MissingArgument(String),

    #[error("invalid argument '{name}': {message}")]
    InvalidArgument { name: String, message: String },

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("tool task panicked: {0}")]
    Panicked(String),

    #[error("{message}")]
    Source {
        message: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl ToolError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    /// Wrap an arbitrary error, keeping it as the source
    pub fn wrap(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Source {
            message: message.into(),
            source: Box::new(source),
        }
    }
}

/// A tool failure attributed to the node that ran it
#[derive(Debug, Error)]
#[error("execution failure in node '{node_name}': {source}")]
pub struct ToolExecutionError {
    pub node_name: String,
    #[source]
    pub source: ToolError,
}

impl ToolExecutionError {
    pub fn new(node_name: impl Into<String>, source: ToolError) -> Self {
        Self {
            node_name: node_name.into(),
            source,
        }
    }
}

/// Output of a tool call: a direct value or a lazy sequence
pub enum ToolOutput {
    Value(Value),
    Stream(BoxStream<'static, Value>),
}

impl fmt::Debug for ToolOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolOutput::Value(v) => f.debug_tuple("Value").field(v).finish(),
            ToolOutput::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Value> for ToolOutput {
    fn from(value: Value) -> Self {
        ToolOutput::Value(value)
    }
}

impl From<BoxStream<'static, Value>> for ToolOutput {
    fn from(stream: BoxStream<'static, Value>) -> Self {
        ToolOutput::Stream(stream)
    }
}

/// Resolved arguments passed to a tool
#[derive(Debug, Clone, Default)]
pub struct ToolArgs {
    values: BTreeMap<String, Value>,
    connections: BTreeMap<String, Connection>,
}

impl ToolArgs {
    pub fn new(values: BTreeMap<String, Value>) -> Self {
        Self {
            values,
            connections: BTreeMap::new(),
        }
    }

    pub fn with_connection(mut self, param: impl Into<String>, connection: Connection) -> Self {
        self.connections.insert(param.into(), connection);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn values(&self) -> &BTreeMap<String, Value> {
        &self.values
    }

    pub fn require(&self, name: &str) -> Result<&Value, ToolError> {
        self.values
            .get(name)
            .ok_or_else(|| ToolError::MissingArgument(name.to_string()))
    }

    pub fn str(&self, name: &str) -> Result<&str, ToolError> {
        self.require(name)?
            .as_str()
            .ok_or_else(|| invalid(name, "expected a string"))
    }

    pub fn i64(&self, name: &str) -> Result<i64, ToolError> {
        self.require(name)?
            .as_i64()
            .ok_or_else(|| invalid(name, "expected an integer"))
    }

    pub fn f64(&self, name: &str) -> Result<f64, ToolError> {
        self.require(name)?
            .as_f64()
            .ok_or_else(|| invalid(name, "expected a number"))
    }

    pub fn bool(&self, name: &str) -> Result<bool, ToolError> {
        self.require(name)?
            .as_bool()
            .ok_or_else(|| invalid(name, "expected a bool"))
    }

    pub fn list(&self, name: &str) -> Result<&Vec<Value>, ToolError> {
        self.require(name)?
            .as_array()
            .ok_or_else(|| invalid(name, "expected a list"))
    }

    pub fn connection(&self, name: &str) -> Result<&Connection, ToolError> {
        self.connections
            .get(name)
            .ok_or_else(|| ToolError::MissingArgument(name.to_string()))
    }
}

fn invalid(name: &str, message: &str) -> ToolError {
    ToolError::InvalidArgument {
        name: name.to_string(),
        message: message.to_string(),
    }
}

/// Execution environment handed to a tool body
#[derive(Debug, Clone)]
pub struct ToolContext {
    node: String,
    run_id: String,
    line_number: Option<usize>,
    tracer: Tracer,
    metrics: Option<MetricLogger>,
}

impl ToolContext {
    pub fn new(node: impl Into<String>, run_id: impl Into<String>, line_number: Option<usize>) -> Self {
        Self {
            node: node.into(),
            run_id: run_id.into(),
            line_number,
            tracer: Tracer::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: MetricLogger) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn node_name(&self) -> &str {
        &self.node
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// Line number of the current line, `None` for aggregation
    pub fn line_number(&self) -> Option<usize> {
        self.line_number
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }

    /// Record a metric; only aggregation nodes have a metric sink
    pub fn log_metric(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key: String = key.into();
        match &self.metrics {
            Some(metrics) => metrics.log(key, value),
            None => warn!(
                node = %self.node,
                metric = %key,
                "log_metric called outside an aggregation node, ignoring"
            ),
        }
    }
}

/// A callable tool with a known signature
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn signature(&self) -> &ToolSignature;

    async fn invoke(&self, args: ToolArgs, ctx: ToolContext) -> Result<ToolOutput, ToolError>;
}

type SyncToolFn = Arc<dyn Fn(ToolArgs, ToolContext) -> Result<ToolOutput, ToolError> + Send + Sync>;
type AsyncToolFn =
    Arc<dyn Fn(ToolArgs, ToolContext) -> BoxFuture<'static, Result<ToolOutput, ToolError>> + Send + Sync>;

/// Tool backed by a synchronous closure, run on the blocking thread pool
pub struct FnTool {
    signature: ToolSignature,
    func: SyncToolFn,
}

impl FnTool {
    pub fn new<F, R>(signature: ToolSignature, func: F) -> Self
    where
        F: Fn(ToolArgs, ToolContext) -> Result<R, ToolError> + Send + Sync + 'static,
        R: Into<ToolOutput>,
    {
        let func: SyncToolFn =
            Arc::new(move |args: ToolArgs, ctx: ToolContext| -> Result<ToolOutput, ToolError> {
                func(args, ctx).map(Into::into)
            });
        Self { signature, func }
    }
}

#[async_trait::async_trait]
impl Tool for FnTool {
    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    async fn invoke(&self, args: ToolArgs, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        let func = self.func.clone();
        tokio::task::spawn_blocking(move || func(args, ctx))
            .await
            .map_err(|e| ToolError::Panicked(e.to_string()))?
    }
}

/// Tool backed by a closure returning a future
pub struct AsyncFnTool {
    signature: ToolSignature,
    func: AsyncToolFn,
}

impl AsyncFnTool {
    pub fn new<F, Fut, R>(signature: ToolSignature, func: F) -> Self
    where
        F: Fn(ToolArgs, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, ToolError>> + Send + 'static,
        R: Into<ToolOutput>,
    {
        let func: AsyncToolFn = Arc::new(move |args: ToolArgs, ctx: ToolContext| {
            let fut = func(args, ctx);
            let boxed: BoxFuture<'static, Result<ToolOutput, ToolError>> = Box::pin(async move {
                let output: Result<ToolOutput, ToolError> = fut.await.map(Into::into);
                output
            });
            boxed
        });
        Self { signature, func }
    }
}

#[async_trait::async_trait]
impl Tool for AsyncFnTool {
    fn signature(&self) -> &ToolSignature {
        &self.signature
    }

    async fn invoke(&self, args: ToolArgs, ctx: ToolContext) -> Result<ToolOutput, ToolError> {
        (self.func)(args, ctx).await
    }
}

/// Build-time table mapping tool identifiers to tools
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its signature name
    pub fn register(&mut self, tool: impl Tool + 'static) {
        let name = tool.signature().name.clone();
        self.tools.insert(name, Arc::new(tool));
    }

    /// Register a shared tool under an explicit identifier
    pub fn register_as(&mut self, name: impl Into<String>, tool: Arc<dyn Tool>) {
        self.tools.insert(name.into(), tool);
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.register(tool);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered identifiers, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}
