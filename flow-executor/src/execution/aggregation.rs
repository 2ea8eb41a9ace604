// Aggregation Runner
// Runs aggregation nodes once per batch over the values collected from completed lines

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::cancel::CancelSignal;
use crate::execution::context::{AggregatedInputs, FlowExecutionContext};
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::graph::FlowGraph;
use crate::execution::run_info::{AggregationResult, LineResult, Status};
use crate::execution::scheduler::{ExecutionServices, NodeScheduler};
use crate::storage::persist_node;
use crate::tools::MetricLogger;

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

pub(crate) struct AggregationRunner {
    graph: Arc<FlowGraph>,
    services: Arc<ExecutionServices>,
    config: ExecutorConfig,
}

impl AggregationRunner {
    pub fn new(graph: Arc<FlowGraph>, services: Arc<ExecutionServices>, config: ExecutorConfig) -> Self {
        Self {
            graph,
            services,
            config,
        }
    }

    /// Collect one column per aggregation input, in line order; lines that did not
    /// complete contribute a gap that each node's failed-line policy resolves
    pub fn collect(&self, lines: &[LineResult]) -> AggregatedInputs {
        let mut aggregated = AggregatedInputs::new();
        for key in self.graph.aggregation_inputs() {
            let column = lines
                .iter()
                .map(|line| {
                    (line.status() == Status::Completed).then(|| {
                        line.aggregation_inputs
                            .get(&key)
                            .cloned()
                            .unwrap_or(Value::Null)
                    })
                })
                .collect();
            aggregated.insert(key, column);
        }
        aggregated
    }

    /// Aggregation failures are recorded on the node run infos and never returned,
    /// except for a stuck dependency resolver
    #[instrument(skip_all, fields(run_id = %flow_run_id))]
    pub async fn run(
        &self,
        flow_run_id: &str,
        aggregated: AggregatedInputs,
        cancel: &CancelSignal,
    ) -> ExecutorResult<AggregationResult> {
        if !self.graph.has_aggregation() {
            return Ok(AggregationResult::default());
        }

        let started = Instant::now();
        let nodes: Vec<_> = self.graph.aggregation_nodes().collect();
        self.services.events.send_event(ExecutionEvent::AggregationStarted {
            nodes: nodes.iter().map(|n| n.name.clone()).collect(),
        });

        let metrics = MetricLogger::new();
        let mut ctx = FlowExecutionContext::for_aggregation(flow_run_id, aggregated);
        let scheduler = NodeScheduler::new(self.graph.clone(), self.services.clone(), &self.config)
            .raise_on_error(false);

        if let Err(e) = scheduler
            .run(nodes, &mut ctx, cancel, Some(metrics.clone()))
            .await
        {
            let error = e.to_info();
            for info in ctx.cancel_running(&error) {
                persist_node(self.services.storage.as_ref(), &info);
            }
            if matches!(e, ExecutorError::UnresolvedDependency { .. }) {
                return Err(e);
            }
            warn!(error = %e, "aggregation stopped early");
        }

        let mut outputs = BTreeMap::new();
        for node in self.graph.aggregation_nodes() {
            if let Some(value) = ctx.output(&node.name) {
                outputs.insert(node.name.clone(), value.clone());
            }
        }

        let result = AggregationResult {
            metrics: metrics.snapshot(),
            outputs,
            node_run_infos: ctx.into_run_infos(),
        };

        let failed_nodes = result.failed_nodes().count();
        info!(failed_nodes, metrics = result.metrics.len(), "aggregation finished");
        self.services.events.send_event(ExecutionEvent::AggregationCompleted {
            failed_nodes,
            duration: started.elapsed(),
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorInfo;
    use crate::execution::run_info::RunInfo;
    use crate::storage::MemoryStorage;
    use crate::testing::test_registry;
    use crate::tools::{ToolCache, ToolInvoker};
    use serde_json::json;

    const FLOW: &str = r#"
inputs:
  x: { type: int }
nodes:
  - name: double
    tool: double
    inputs:
      x: ${inputs.x}
  - name: total
    tool: sum
    aggregation: true
    inputs:
      values: ${double.output}
  - name: with_nulls
    tool: echo
    aggregation: true
    failed_lines: "null"
    inputs:
      value: ${double.output}
  - name: raw
    tool: echo
    aggregation: true
    inputs:
      value: ${inputs.x}
  - name: report
    tool: echo
    aggregation: true
    inputs:
      value: ${total.output}
"#;

    fn runner() -> (AggregationRunner, Arc<MemoryStorage>) {
        let graph = Arc::new(FlowGraph::from_yaml(FLOW, &test_registry()).unwrap());
        let storage = Arc::new(MemoryStorage::new());
        let services = Arc::new(ExecutionServices {
            invoker: ToolInvoker::new(Arc::new(ToolCache::new()), storage.clone()),
            storage: storage.clone(),
            connections: None,
            events: None,
        });
        (
            AggregationRunner::new(graph, services, ExecutorConfig::default()),
            storage,
        )
    }

    fn line(number: usize, x: i64, completed: bool) -> LineResult {
        let status = if completed { Status::Completed } else { Status::Failed };
        let error = (!completed).then(|| ErrorInfo {
            code: "ToolExecutionError".to_string(),
            message: "boom".to_string(),
            chain: Vec::new(),
        });
        let mut result = LineResult::not_run("run", number, BTreeMap::new(), status, error);
        if completed {
            result.aggregation_inputs.insert("double".to_string(), json!(x * 2));
            result.aggregation_inputs.insert("inputs.x".to_string(), json!(x));
        }
        result
    }

    #[tokio::test]
    async fn test_aggregation_over_completed_lines() {
        let (runner, storage) = runner();
        let lines = vec![line(0, 1, true), line(1, 2, false), line(2, 3, true)];

        let result = runner
            .run("run", runner.collect(&lines), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.outputs["total"], json!(8.0));
        assert_eq!(result.outputs["with_nulls"], json!([2, null, 6]));
        assert_eq!(result.outputs["raw"], json!([1, 3]));
        assert_eq!(result.outputs["report"], json!(8.0));
        assert_eq!(result.metrics["total"], json!(8.0));
        assert_eq!(result.metrics["count"], json!(2));

        let total: &RunInfo = &result.node_run_infos["total"];
        assert_eq!(total.run_id, "run_total_reduce");
        assert_eq!(total.line_number, None);
        assert_eq!(storage.node_runs().len(), 4);
    }

    #[tokio::test]
    async fn test_flow_without_aggregation_is_empty() {
        let graph = Arc::new(
            FlowGraph::from_yaml("nodes:\n  - name: a\n    tool: echo\n    inputs:\n      value: 1\n", &test_registry())
                .unwrap(),
        );
        let storage = Arc::new(MemoryStorage::new());
        let services = Arc::new(ExecutionServices {
            invoker: ToolInvoker::new(Arc::new(ToolCache::new()), storage.clone()),
            storage,
            connections: None,
            events: None,
        });
        let runner = AggregationRunner::new(graph, services, ExecutorConfig::default());

        let result = runner.run("run", runner.collect(&[]), &CancelSignal::never()).await.unwrap();
        assert!(result.node_run_infos.is_empty());
        assert!(result.metrics.is_empty());
    }
}
