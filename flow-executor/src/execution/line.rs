// Line Executor
// Drives one input row through the per-line nodes and resolves the flow outputs

use crate::config::ExecutorConfig;
use crate::error::{ErrorInfo, ExecutorError, ExecutorResult};
use crate::execution::cancel::CancelSignal;
use crate::execution::context::FlowExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::graph::FlowGraph;
use crate::execution::run_info::{LineResult, LineRunInfo, Status};
use crate::execution::scheduler::{ExecutionServices, NodeScheduler};
use crate::inputs::coerce_inputs;
use crate::parser::models::{apply_path, Binding};
use crate::storage::{persist_line, persist_node};
use crate::tools::RecordingStream;

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{info, instrument, warn};

/// Runs single lines of a flow
pub(crate) struct LineExecutor {
    graph: Arc<FlowGraph>,
    services: Arc<ExecutionServices>,
    config: ExecutorConfig,
}

impl LineExecutor {
    pub fn new(graph: Arc<FlowGraph>, services: Arc<ExecutionServices>, config: ExecutorConfig) -> Self {
        Self {
            graph,
            services,
            config,
        }
    }

    /// Execute one line.
    ///
    /// Node failures, timeouts and cancellation produce a `Failed` or `Canceled` line result.
    /// With `raise_on_error` the first failure is returned as an error instead, after the
    /// line record has been persisted. A stuck dependency resolver is always an error.
    #[instrument(skip_all, fields(run_id = %flow_run_id, line = line_number))]
    pub async fn exec_line(
        &self,
        flow_run_id: &str,
        line_number: usize,
        inputs: BTreeMap<String, Value>,
        raise_on_error: bool,
        cancel: &CancelSignal,
    ) -> ExecutorResult<LineResult> {
        let start_time = Utc::now();
        let line_run_id = format!("{}_{}", flow_run_id, line_number);
        self.services.events.send_event(ExecutionEvent::LineStarted {
            line_number: Some(line_number),
        });

        let coerced = match coerce_inputs(&self.graph.inputs, &inputs) {
            Ok(coerced) => coerced,
            Err(e) => {
                warn!(error = %e, "line inputs are invalid");
                let result = LineResult::not_run(
                    flow_run_id,
                    line_number,
                    inputs,
                    Status::Failed,
                    Some(e.to_info()),
                );
                self.finish_line(&result);
                return if raise_on_error { Err(e) } else { Ok(result) };
            }
        };

        let mut ctx = FlowExecutionContext::for_line(
            flow_run_id,
            line_run_id.clone(),
            Some(line_number),
            coerced,
        );
        let scheduler = NodeScheduler::new(self.graph.clone(), self.services.clone(), &self.config)
            .raise_on_error(raise_on_error);

        let run = scheduler.run(self.graph.line_nodes().collect(), &mut ctx, cancel, None);
        let outcome = match self.config.line_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(outcome) => outcome,
                Err(_) => Err(ExecutorError::LineTimeout {
                    line_number: Some(line_number),
                    timeout,
                }),
            },
            None => run.await,
        };

        if let Err(e) = outcome {
            let error = e.to_info();
            for info in ctx.cancel_running(&error) {
                persist_node(self.services.storage.as_ref(), &info);
            }

            let status = match e {
                ExecutorError::Canceled { .. } => Status::Canceled,
                _ => Status::Failed,
            };
            warn!(error = %e, %status, "line stopped early");
            let result = self.build_result(ctx, line_run_id, start_time, BTreeMap::new(), BTreeMap::new(), status, Some(error));
            self.finish_line(&result);

            if raise_on_error || matches!(e, ExecutorError::UnresolvedDependency { .. }) {
                return Err(e);
            }
            return Ok(result);
        }

        let (output, streams, error) = self.resolve_outputs(&mut ctx);
        let error = error.or_else(|| self.failed_aggregation_source(&ctx));
        let status = if error.is_some() {
            Status::Failed
        } else {
            Status::Completed
        };
        let result = self.build_result(ctx, line_run_id, start_time, output, streams, status, error);
        self.finish_line(&result);
        Ok(result)
    }

    /// Flow outputs, stream outputs handed to the caller, and the error of the first
    /// output whose source node did not complete
    fn resolve_outputs(
        &self,
        ctx: &mut FlowExecutionContext,
    ) -> (
        BTreeMap<String, Value>,
        BTreeMap<String, RecordingStream>,
        Option<ErrorInfo>,
    ) {
        let mut output = BTreeMap::new();
        let mut streams = BTreeMap::new();
        let mut error = None;

        for (name, binding) in &self.graph.outputs {
            let value = match binding {
                Binding::Literal(value) => value.clone(),
                Binding::FlowInput(input) => ctx.inputs.get(input).cloned().unwrap_or(Value::Null),
                Binding::NodeOutput { node, path } => match ctx.status(node) {
                    Status::Completed => {
                        if let Some(stream) = ctx.take_stream(node) {
                            streams.insert(name.clone(), stream);
                            continue;
                        }
                        ctx.output(node)
                            .and_then(|value| apply_path(value, path))
                            .unwrap_or(Value::Null)
                    }
                    Status::Bypassed => self
                        .graph
                        .node(node)
                        .and_then(|n| n.bypass_value.as_ref())
                        .and_then(|value| apply_path(value, path))
                        .unwrap_or(Value::Null),
                    _ => {
                        if error.is_none() {
                            error = ctx.run_info(node).and_then(|info| info.error.clone());
                        }
                        continue;
                    }
                },
            };
            output.insert(name.clone(), value);
        }

        (output, streams, error)
    }

    /// Error of the first node read by an aggregation node that failed or was canceled;
    /// such a line must not contribute to the aggregation columns
    fn failed_aggregation_source(&self, ctx: &FlowExecutionContext) -> Option<ErrorInfo> {
        self.graph
            .aggregation_inputs()
            .iter()
            .filter(|key| !key.starts_with("inputs."))
            .find(|node| matches!(ctx.status(node), Status::Failed | Status::Canceled))
            .map(|node| {
                ctx.run_info(node)
                    .and_then(|info| info.error.clone())
                    .unwrap_or_else(|| ErrorInfo {
                        code: "ToolExecutionError".to_string(),
                        message: format!("node '{}' did not complete", node),
                        chain: Vec::new(),
                    })
            })
    }

    #[allow(clippy::too_many_arguments)]
    fn build_result(
        &self,
        ctx: FlowExecutionContext,
        run_id: String,
        start_time: DateTime<Utc>,
        output: BTreeMap<String, Value>,
        streams: BTreeMap<String, RecordingStream>,
        status: Status,
        error: Option<ErrorInfo>,
    ) -> LineResult {
        let mut aggregation_inputs = BTreeMap::new();
        if status == Status::Completed {
            for key in self.graph.aggregation_inputs() {
                let value = match key.strip_prefix("inputs.") {
                    Some(input) => ctx.inputs.get(input).cloned(),
                    None if ctx.status(&key) == Status::Completed => ctx.output(&key).cloned(),
                    None => None,
                };
                aggregation_inputs.insert(key, value.unwrap_or(Value::Null));
            }
        }

        let run_info = LineRunInfo {
            run_id,
            flow_run_id: ctx.flow_run_id.clone(),
            line_number: ctx.line_number,
            status,
            inputs: ctx.inputs.clone(),
            output: output.clone(),
            error,
            start_time,
            end_time: Utc::now(),
        };

        LineResult {
            output,
            run_info,
            node_run_infos: ctx.into_run_infos(),
            aggregation_inputs,
            streams,
        }
    }

    fn finish_line(&self, result: &LineResult) {
        persist_line(self.services.storage.as_ref(), result);
        let run_info = &result.run_info;
        let duration = (run_info.end_time - run_info.start_time)
            .to_std()
            .unwrap_or_default();
        info!(status = %run_info.status, duration_ms = duration.as_millis() as u64, "line finished");
        self.services.events.send_event(ExecutionEvent::line_completed(
            run_info.line_number,
            run_info.status,
            duration,
        ));
    }
}
