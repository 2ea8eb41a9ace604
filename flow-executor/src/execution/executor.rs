// Flow Executor
// Entry point that owns a validated flow graph and runs single lines or whole batches

use crate::config::ExecutorConfig;
use crate::connections::ConnectionProvider;
use crate::error::ExecutorResult;
use crate::execution::batch::BatchExecutor;
use crate::execution::cancel::CancelSignal;
use crate::execution::events::ProgressSender;
use crate::execution::graph::FlowGraph;
use crate::execution::line::LineExecutor;
use crate::execution::run_info::{BatchResult, LineResult};
use crate::execution::scheduler::ExecutionServices;
use crate::inputs::Row;
use crate::parser::FlowParser;
use crate::storage::{NoopStorage, RunStorage};
use crate::tools::{ToolCache, ToolInvoker, ToolRegistry};

use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

/// Flow executor
pub struct FlowExecutor {
    /// Validated flow graph
    graph: Arc<FlowGraph>,
    /// Configuration
    config: ExecutorConfig,
    /// Tool output cache, shared by every line the executor runs
    cache: Arc<ToolCache>,
    /// Sink for finalized run records
    storage: Arc<dyn RunStorage>,
    /// Source of connections for connection-typed parameters
    connections: Option<Arc<dyn ConnectionProvider>>,
    /// Progress event sender
    event_tx: Option<ProgressSender>,
}

impl FlowExecutor {
    pub fn new(graph: FlowGraph) -> Self {
        Self {
            graph: Arc::new(graph),
            config: ExecutorConfig::default(),
            cache: Arc::new(ToolCache::new()),
            storage: Arc::new(NoopStorage),
            connections: None,
            event_tx: None,
        }
    }

    /// Load a flow from YAML text, resolving tools through `registry`
    pub fn from_yaml(content: &str, registry: &ToolRegistry) -> ExecutorResult<Self> {
        Ok(Self::new(FlowGraph::from_yaml(content, registry)?))
    }

    /// Load a flow from a YAML file
    pub fn from_file(path: impl AsRef<Path>, registry: &ToolRegistry) -> ExecutorResult<Self> {
        let definition = FlowParser::parse_file(path)?;
        Ok(Self::new(FlowGraph::load(&definition, registry)?))
    }

    pub fn with_config(mut self, config: ExecutorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_storage(mut self, storage: Arc<dyn RunStorage>) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_connections(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.connections = Some(provider);
        self
    }

    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// Share a tool cache with other executors
    pub fn with_cache(mut self, cache: Arc<ToolCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn graph(&self) -> &FlowGraph {
        &self.graph
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    fn services(&self) -> Arc<ExecutionServices> {
        Arc::new(ExecutionServices {
            invoker: ToolInvoker::new(self.cache.clone(), self.storage.clone()),
            storage: self.storage.clone(),
            connections: self.connections.clone(),
            events: self.event_tx.clone(),
        })
    }

    /// Run one line interactively: the first node failure is returned as an error
    pub async fn exec_line(&self, inputs: BTreeMap<String, Value>) -> ExecutorResult<LineResult> {
        let run_id = Uuid::new_v4().to_string();
        LineExecutor::new(self.graph.clone(), self.services(), self.config.clone())
            .exec_line(&run_id, 0, inputs, true, &CancelSignal::never())
            .await
    }

    /// Run every row as a line, then the aggregation pass
    pub async fn run_batch(
        &self,
        rows: Vec<Row>,
        inputs_mapping: &BTreeMap<String, Value>,
    ) -> ExecutorResult<BatchResult> {
        self.run_batch_with_cancel(rows, inputs_mapping, &CancelSignal::never())
            .await
    }

    /// [`FlowExecutor::run_batch`] that stops early once `cancel` fires
    pub async fn run_batch_with_cancel(
        &self,
        rows: Vec<Row>,
        inputs_mapping: &BTreeMap<String, Value>,
        cancel: &CancelSignal,
    ) -> ExecutorResult<BatchResult> {
        let run_id = Uuid::new_v4().to_string();
        BatchExecutor::new(self.graph.clone(), self.services(), self.config.clone())
            .run(run_id, rows, inputs_mapping, cancel)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::{Connection, MemoryConnectionProvider};
    use crate::error::ExecutorError;
    use crate::execution::events::{progress_channel, ExecutionEvent};
    use crate::execution::run_info::Status;
    use crate::storage::MemoryStorage;
    use crate::testing::{test_registry, TestTools};
    use serde_json::json;
    use std::io::Write;

    const FLOW: &str = r#"
name: arithmetic
inputs:
  input1: { type: int }
outputs:
  result:
    reference: ${collect.output}
nodes:
  - name: node_b
    tool: double
    inputs:
      x: ${inputs.input1}
  - name: node_c
    tool: square
    inputs:
      x: ${inputs.input1}
  - name: collect
    tool: collect
    inputs:
      double: ${node_b.output}
      square: ${node_c.output}
"#;

    fn row(value: Value) -> Row {
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_exec_line() {
        let executor = FlowExecutor::from_yaml(FLOW, &test_registry()).unwrap();
        let result = executor.exec_line(row(json!({"input1": 3}))).await.unwrap();

        assert_eq!(result.status(), Status::Completed);
        assert_eq!(result.output["result"], json!({"double": 6, "square": 9}));
        assert!(result.node_run_infos["node_b"].run_id.ends_with("_node_b_0"));
    }

    #[tokio::test]
    async fn test_exec_line_raises() {
        let executor = FlowExecutor::from_yaml(
            "nodes:\n  - name: boom\n    tool: fail\n    inputs:\n      message: bad row\n",
            &test_registry(),
        )
        .unwrap();

        let err = executor.exec_line(BTreeMap::new()).await.unwrap_err();
        assert_eq!(err.code(), "ToolExecutionError");
        assert!(err.to_string().contains("execution failure in node 'boom': bad row"));
    }

    #[tokio::test]
    async fn test_run_batch_with_mapping_and_events() {
        let (tx, mut rx) = progress_channel();
        let storage = Arc::new(MemoryStorage::new());
        let executor = FlowExecutor::from_yaml(FLOW, &test_registry())
            .unwrap()
            .with_config(ExecutorConfig::default().with_worker_count(2))
            .with_storage(storage.clone())
            .with_progress(tx);

        let mut mapping = BTreeMap::new();
        mapping.insert("input1".to_string(), json!("${data.n}"));
        let rows = vec![row(json!({"n": 1})), row(json!({"n": 2}))];

        let result = executor.run_batch(rows, &mapping).await.unwrap();
        assert_eq!(result.status, Status::Completed);
        assert_eq!(result.line_results[1].output["result"], json!({"double": 4, "square": 4}));
        assert_eq!(storage.line_runs().len(), 2);
        assert_eq!(storage.node_runs().len(), 6);

        let mut started = 0;
        let mut completed_lines = 0;
        while let Ok(event) = rx.try_recv() {
            match event {
                ExecutionEvent::BatchStarted { flow_name, total_lines, .. } => {
                    assert_eq!(flow_name, "arithmetic");
                    assert_eq!(total_lines, 2);
                    started += 1;
                }
                ExecutionEvent::LineCompleted { .. } => completed_lines += 1,
                _ => {}
            }
        }
        assert_eq!(started, 1);
        assert_eq!(completed_lines, 2);
    }

    #[tokio::test]
    async fn test_executors_share_a_cache() {
        let yaml = "inputs:\n  v: { type: int }\nnodes:\n  - name: count\n    tool: counted\n    enable_cache: true\n    inputs:\n      value: ${inputs.v}\n";
        let tools = TestTools::new();
        let registry = tools.registry();
        let cache = Arc::new(ToolCache::new());

        let first = FlowExecutor::from_yaml(yaml, &registry)
            .unwrap()
            .with_cache(cache.clone());
        let second = FlowExecutor::from_yaml(yaml, &registry)
            .unwrap()
            .with_cache(cache.clone());

        first.exec_line(row(json!({"v": 7}))).await.unwrap();
        let result = second.exec_line(row(json!({"v": 7}))).await.unwrap();

        assert_eq!(tools.calls("counted"), 1);
        assert!(result.node_run_infos["count"].cached);
        assert_eq!(cache.len().await, 1);
    }

    #[tokio::test]
    async fn test_from_file_and_connections() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "outputs:\n  conn:\n    reference: ${{call.output}}\nnodes:\n  - name: call\n    tool: connected\n    inputs:\n      connection: search\n"
        )
        .unwrap();

        let provider = MemoryConnectionProvider::new()
            .with_connection(Connection::new("search", "http").with_secret("api_key", "s3cret"));
        let executor = FlowExecutor::from_file(file.path(), &test_registry())
            .unwrap()
            .with_connections(Arc::new(provider));

        let result = executor.exec_line(BTreeMap::new()).await.unwrap();
        assert_eq!(
            result.output["conn"],
            json!({"name": "search", "kind": "http", "key": "s3cret"})
        );
        assert_eq!(result.node_run_infos["call"].inputs["connection"], json!("search"));
    }

    #[tokio::test]
    async fn test_missing_connection_fails_node() {
        let executor = FlowExecutor::from_yaml(
            "nodes:\n  - name: call\n    tool: connected\n    inputs:\n      connection: nowhere\n",
            &test_registry(),
        )
        .unwrap()
        .with_connections(Arc::new(MemoryConnectionProvider::new()));

        let err = executor.exec_line(BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::ToolExecution(ref e) if e.node_name == "call"));
    }

    #[tokio::test]
    async fn test_from_file_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "nodes:\n  - name: a\n    tool: echo\n    activation: {{}}\n").unwrap();

        let err = FlowExecutor::from_file(file.path(), &test_registry())
            .err()
            .unwrap();
        assert!(matches!(err, ExecutorError::Parse(_)));
    }
}
