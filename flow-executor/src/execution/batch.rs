// Batch Executor
// Fans input rows out to a fixed pool of line workers, then runs the aggregation pass

use crate::config::ExecutorConfig;
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::aggregation::AggregationRunner;
use crate::execution::cancel::{cancel_pair, CancelSignal};
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::graph::FlowGraph;
use crate::execution::line::LineExecutor;
use crate::execution::run_info::{AggregationResult, BatchResult, LineResult, Status};
use crate::execution::scheduler::ExecutionServices;
use crate::inputs::{apply_inputs_mapping, Row};

use chrono::Utc;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{error, info, instrument};

pub(crate) struct BatchExecutor {
    graph: Arc<FlowGraph>,
    services: Arc<ExecutionServices>,
    config: ExecutorConfig,
}

impl BatchExecutor {
    pub fn new(graph: Arc<FlowGraph>, services: Arc<ExecutionServices>, config: ExecutorConfig) -> Self {
        Self {
            graph,
            services,
            config,
        }
    }

    /// Run every row as a line and aggregate the results.
    ///
    /// Setup errors (no rows, unmappable inputs) are returned before any line starts.
    /// Line failures are kept in the result unless `raise_on_error` is set, in which case
    /// the first one stops the batch and is returned.
    #[instrument(skip_all, fields(run_id = %run_id, rows = rows.len()))]
    pub async fn run(
        &self,
        run_id: String,
        rows: Vec<Row>,
        inputs_mapping: &BTreeMap<String, Value>,
        cancel: &CancelSignal,
    ) -> ExecutorResult<BatchResult> {
        if rows.is_empty() {
            return Err(ExecutorError::EmptyInputsData);
        }
        let line_inputs = rows
            .iter()
            .enumerate()
            .map(|(index, row)| apply_inputs_mapping(&self.graph.inputs, inputs_mapping, row, index))
            .collect::<ExecutorResult<Vec<_>>>()?;

        let start_time = Utc::now();
        let total = line_inputs.len();
        let events = &self.services.events;
        events.send_event(ExecutionEvent::BatchStarted {
            run_id: run_id.clone(),
            flow_name: self.graph.name.clone(),
            total_lines: total,
        });
        info!(flow = %self.graph.name, total, workers = self.config.worker_count, "batch started");

        // Lines observe `stop`, fired by the caller's signal or by a raised line error
        let (stop, line_signal) = cancel_pair();
        let forward = tokio::spawn({
            let cancel = cancel.clone();
            let stop = stop.clone();
            async move {
                cancel.cancelled().await;
                stop.cancel();
            }
        });

        let line_inputs = Arc::new(line_inputs);
        let next_index = Arc::new(AtomicUsize::new(0));
        let executor = Arc::new(LineExecutor::new(
            self.graph.clone(),
            self.services.clone(),
            self.config.clone(),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel::<(usize, ExecutorResult<LineResult>)>();
        let mut workers = JoinSet::new();

        for _ in 0..self.config.worker_count.clamp(1, total) {
            let line_inputs = line_inputs.clone();
            let next_index = next_index.clone();
            let executor = executor.clone();
            let signal = line_signal.clone();
            let run_id = run_id.clone();
            let tx = tx.clone();
            let raise_on_error = self.config.raise_on_error;

            workers.spawn(async move {
                loop {
                    if signal.is_cancelled() {
                        break;
                    }
                    let index = next_index.fetch_add(1, Ordering::SeqCst);
                    if index >= line_inputs.len() {
                        break;
                    }
                    let result = executor
                        .exec_line(&run_id, index, line_inputs[index].clone(), raise_on_error, &signal)
                        .await;
                    if tx.send((index, result)).is_err() {
                        break;
                    }
                }
            });
        }
        drop(tx);

        let mut slots: Vec<Option<LineResult>> = (0..total).map(|_| None).collect();
        let mut fatal = None;
        while let Some((index, result)) = rx.recv().await {
            match result {
                Ok(line) => slots[index] = Some(line),
                Err(e) => {
                    error!(line = index, error = %e, "line raised, stopping the batch");
                    stop.cancel();
                    fatal.get_or_insert(e);
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "line worker did not finish");
            }
        }
        forward.abort();

        if let Some(e) = fatal {
            return Err(e);
        }

        let canceled = cancel.is_cancelled();
        let not_run = ExecutorError::Canceled {
            reason: "the line was not started before the batch was canceled".to_string(),
        }
        .to_info();
        let line_results: Vec<LineResult> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    LineResult::not_run(
                        &run_id,
                        index,
                        line_inputs[index].clone(),
                        Status::Canceled,
                        Some(not_run.clone()),
                    )
                })
            })
            .collect();

        let aggregation = if canceled {
            info!("batch canceled, skipping aggregation");
            AggregationResult::default()
        } else {
            let runner =
                AggregationRunner::new(self.graph.clone(), self.services.clone(), self.config.clone());
            let aggregated = runner.collect(&line_results);
            runner.run(&run_id, aggregated, cancel).await?
        };

        let result = BatchResult::new(run_id, line_results, aggregation, canceled, start_time);
        info!(
            status = %result.status,
            completed = result.completed_lines,
            failed = result.failed_lines,
            "batch finished"
        );
        events.send_event(ExecutionEvent::BatchCompleted {
            run_id: result.run_id.clone(),
            status: result.status,
            completed_lines: result.completed_lines,
            failed_lines: result.failed_lines,
            duration: (result.end_time - result.start_time).to_std().unwrap_or_default(),
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::progress_channel;
    use crate::storage::MemoryStorage;
    use crate::testing::{test_registry, TestTools};
    use crate::tools::{ToolCache, ToolInvoker, ToolRegistry};
    use serde_json::json;
    use std::time::Duration;

    fn batch(
        yaml: &str,
        registry: &ToolRegistry,
        config: ExecutorConfig,
        events: Option<crate::execution::events::ProgressSender>,
    ) -> (BatchExecutor, Arc<MemoryStorage>) {
        let graph = Arc::new(FlowGraph::from_yaml(yaml, registry).unwrap());
        let storage = Arc::new(MemoryStorage::new());
        let services = Arc::new(ExecutionServices {
            invoker: ToolInvoker::new(Arc::new(ToolCache::new()), storage.clone()),
            storage: storage.clone(),
            connections: None,
            events,
        });
        (BatchExecutor::new(graph, services, config), storage)
    }

    fn rows(values: Vec<Value>) -> Vec<Row> {
        values
            .into_iter()
            .map(|v| serde_json::from_value(v).unwrap())
            .collect()
    }

    const FLOW: &str = r#"
inputs:
  x: { type: int }
outputs:
  doubled:
    reference: ${check.output}
nodes:
  - name: wait
    tool: sleep
    inputs:
      ms: ${inputs.x}
  - name: check
    tool: double
    inputs:
      x: ${inputs.x}
  - name: total
    tool: sum
    aggregation: true
    inputs:
      values: ${check.output}
"#;

    #[tokio::test]
    async fn test_results_preserve_row_order() {
        let config = ExecutorConfig::default().with_worker_count(4);
        let (batch, _) = batch(FLOW, &test_registry(), config, None);
        // later rows finish first
        let input: Vec<Value> = (0..8).map(|i| json!({"x": (8 - i) * 5})).collect();

        let result = batch
            .run("run".to_string(), rows(input), &BTreeMap::new(), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.total_lines, 8);
        for (i, line) in result.line_results.iter().enumerate() {
            assert_eq!(line.line_number(), Some(i));
            assert_eq!(line.output["doubled"], json!((8 - i as i64) * 10));
        }
        assert_eq!(result.status, Status::Completed);
    }

    #[tokio::test]
    async fn test_failed_node_with_default_keeps_line_completed() {
        let yaml = r#"
inputs:
  x: { type: int }
  fail: { type: bool, default: false }
outputs:
  doubled:
    reference: ${double.output}
nodes:
  - name: boom
    tool: fail
    activate:
      when: ${inputs.fail}
      is: true
    inputs:
      message: row failed
  - name: double
    tool: add
    inputs:
      a: ${inputs.x}
      b: ${boom.output}
  - name: total
    tool: sum
    aggregation: true
    inputs:
      values: ${double.output}
"#;
        let (batch, _) = batch(yaml, &test_registry(), ExecutorConfig::default(), None);
        let input: Vec<Value> = (0..10)
            .map(|i| {
                if i == 3 {
                    json!({"x": i, "fail": true})
                } else {
                    json!({"x": i})
                }
            })
            .collect();

        let result = batch
            .run("run".to_string(), rows(input), &BTreeMap::new(), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.line_results.len(), 10);
        assert_eq!(result.failed_lines, 0);
        assert_eq!(result.completed_lines, 10);

        // add falls back to its default when boom fails, so the line still completes
        assert_eq!(result.line_results[3].node_run_infos["boom"].status, Status::Failed);
        assert_eq!(result.line_results[3].output["doubled"], json!(3));
    }

    #[tokio::test]
    async fn test_failed_row_is_excluded_from_aggregation() {
        let yaml = r#"
inputs:
  x: { type: int }
outputs:
  doubled:
    reference: ${double.output}
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
"#;
        let (batch, storage) = batch(yaml, &test_registry(), ExecutorConfig::default(), None);
        let input: Vec<Value> = (0..10)
            .map(|i| if i == 3 { json!({"x": "bad"}) } else { json!({"x": i}) })
            .collect();

        let result = batch
            .run("run".to_string(), rows(input), &BTreeMap::new(), &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(result.line_results.len(), 10);
        assert_eq!(result.failed_lines, 1);
        assert_eq!(result.completed_lines, 9);
        assert_eq!(result.line_results[3].status(), Status::Failed);
        for (i, line) in result.line_results.iter().enumerate() {
            if i != 3 {
                assert_eq!(line.status(), Status::Completed);
            }
        }
        assert_eq!(result.status, Status::Completed);

        // 2 * (0 + 1 + ... + 9 - 3)
        assert_eq!(result.aggregation.outputs["total"], json!(84.0));
        assert_eq!(result.error_summary.failed_lines.len(), 1);
        assert_eq!(result.error_summary.failed_lines[0].line_number, 3);
        assert_eq!(result.node_status["double.completed"], 9);
        assert_eq!(result.node_status["total.completed"], 1);
        assert_eq!(storage.line_runs().len(), 10);
    }

    #[tokio::test]
    async fn test_tool_error_in_aggregated_node_fails_line() {
        let yaml = r#"
inputs:
  x: { type: any }
nodes:
  - name: double
    tool: double
    inputs:
      x: ${inputs.x}
  - name: collected
    tool: echo
    aggregation: true
    inputs:
      value: ${double.output}
"#;
        let (batch, _) = batch(yaml, &test_registry(), ExecutorConfig::default(), None);
        let input: Vec<Value> = (0..10)
            .map(|i| if i == 3 { json!({"x": "bad"}) } else { json!({"x": i}) })
            .collect();

        let result = batch
            .run("run".to_string(), rows(input), &BTreeMap::new(), &CancelSignal::never())
            .await
            .unwrap();

        let row = &result.line_results[3];
        assert_eq!(row.node_run_infos["double"].status, Status::Failed);
        assert_eq!(row.status(), Status::Failed);
        assert_eq!(row.error().map(|e| e.code.as_str()), Some("ToolExecutionError"));
        assert!(row.aggregation_inputs.is_empty());

        assert_eq!(result.failed_lines, 1);
        assert_eq!(result.completed_lines, 9);
        assert_eq!(result.error_summary.failed_lines[0].line_number, 3);
        assert_eq!(
            result.aggregation.outputs["collected"],
            json!([0, 2, 4, 8, 10, 12, 14, 16, 18])
        );
    }

    #[tokio::test]
    async fn test_cache_shared_across_lines() {
        let yaml = r#"
inputs:
  v: { type: int }
nodes:
  - name: count
    tool: counted
    enable_cache: true
    inputs:
      value: ${inputs.v}
"#;
        let tools = TestTools::new();
        let config = ExecutorConfig::default().with_worker_count(1);
        let (batch, _) = batch(yaml, &tools.registry(), config, None);

        let result = batch
            .run(
                "run".to_string(),
                rows(vec![json!({"v": 1}), json!({"v": 1}), json!({"v": 2})]),
                &BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await
            .unwrap();

        assert_eq!(tools.calls("counted"), 2);
        let second = &result.line_results[1].node_run_infos["count"];
        assert!(second.cached);
        assert_eq!(second.cached_run_id.as_deref(), Some("run_count_0"));
    }

    #[tokio::test]
    async fn test_setup_errors() {
        let (batch, storage) = batch(FLOW, &test_registry(), ExecutorConfig::default(), None);

        let err = batch
            .run("run".to_string(), Vec::new(), &BTreeMap::new(), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::EmptyInputsData));

        let err = batch
            .run(
                "run".to_string(),
                rows(vec![json!({"x": 1}), json!({"y": 2})]),
                &BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::InputMapping { .. }));
        assert!(storage.line_runs().is_empty());
    }

    #[tokio::test]
    async fn test_raise_on_error_stops_batch() {
        let yaml = "nodes:\n  - name: boom\n    tool: fail\n    inputs:\n      message: nope\n";
        let config = ExecutorConfig::default().with_raise_on_error(true);
        let (batch, _) = batch(yaml, &test_registry(), config, None);

        let err = batch
            .run(
                "run".to_string(),
                rows(vec![json!({}), json!({})]),
                &BTreeMap::new(),
                &CancelSignal::never(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutorError::ToolExecution(_)));
    }

    #[tokio::test]
    async fn test_cancel_skips_unstarted_lines_and_aggregation() {
        let config = ExecutorConfig::default().with_worker_count(1);
        let (tx, mut rx) = progress_channel();
        let (batch, storage) = batch(FLOW, &test_registry(), config, Some(tx));
        let (handle, signal) = cancel_pair();

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.cancel();
        });
        let input: Vec<Value> = (0..5).map(|_| json!({"x": 1000})).collect();
        let result = batch
            .run("run".to_string(), rows(input), &BTreeMap::new(), &signal)
            .await
            .unwrap();
        canceller.await.unwrap();

        assert_eq!(result.status, Status::Canceled);
        assert_eq!(result.line_results.len(), 5);
        assert!(result
            .line_results
            .iter()
            .all(|line| line.status() == Status::Canceled));
        assert!(result.aggregation.node_run_infos.is_empty());

        let first = &result.line_results[0];
        assert_eq!(first.node_run_infos["wait"].status, Status::Canceled);
        assert_eq!(
            storage.node_run("run_wait_0").map(|info| info.status),
            Some(Status::Canceled)
        );

        let mut saw_batch_completed = false;
        while let Ok(event) = rx.try_recv() {
            if let ExecutionEvent::BatchCompleted { status, .. } = event {
                assert_eq!(status, Status::Canceled);
                saw_batch_completed = true;
            }
        }
        assert!(saw_batch_completed);
    }
}
