// Node Scheduler
// Demand-driven dispatch of ready nodes onto tokio tasks for one line or the aggregation pass

use crate::config::ExecutorConfig;
use crate::connections::{ConnectionProvider, LineConnections};
use crate::error::{ExecutorError, ExecutorResult};
use crate::execution::cancel::CancelSignal;
use crate::execution::context::FlowExecutionContext;
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::graph::{FlowGraph, Node};
use crate::execution::resolver::{Decision, DependencyResolver};
use crate::execution::run_info::RunInfo;
use crate::storage::{persist_node, RunStorage};
use crate::tools::{
    MetricLogger, NodeValue, RecordingStream, ToolContext, ToolExecutionError, ToolInvoker,
};

use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error};

/// Collaborators shared by every line of a run
pub(crate) struct ExecutionServices {
    pub invoker: ToolInvoker,
    pub storage: Arc<dyn RunStorage>,
    pub connections: Option<Arc<dyn ConnectionProvider>>,
    pub events: Option<ProgressSender>,
}

/// Result of one dispatched node task
enum NodeOutcome {
    Ready(RunInfo, Value),
    Streamed(RunInfo, RecordingStream),
    Failed(RunInfo, ToolExecutionError),
}

/// Runs a set of nodes to completion against one execution context
pub(crate) struct NodeScheduler {
    graph: Arc<FlowGraph>,
    services: Arc<ExecutionServices>,
    node_concurrency: usize,
    allow_stream_output: bool,
    raise_on_error: bool,
}

impl NodeScheduler {
    pub fn new(graph: Arc<FlowGraph>, services: Arc<ExecutionServices>, config: &ExecutorConfig) -> Self {
        Self {
            graph,
            services,
            node_concurrency: config.node_concurrency,
            allow_stream_output: config.allow_stream_output,
            raise_on_error: config.raise_on_error,
        }
    }

    pub fn raise_on_error(mut self, raise: bool) -> Self {
        self.raise_on_error = raise;
        self
    }

    /// Dispatch `nodes` as their dependencies become terminal.
    ///
    /// Returns `Ok` once every node is terminal. Errors are returned for cancellation,
    /// for a stuck resolver, and, when raising, for the first node failure. Running
    /// nodes stay `Running` in the context on error; the caller decides how to finalize them.
    pub async fn run(
        &self,
        nodes: Vec<&Node>,
        ctx: &mut FlowExecutionContext,
        cancel: &CancelSignal,
        metrics: Option<MetricLogger>,
    ) -> ExecutorResult<()> {
        let mut resolver = DependencyResolver::new(&self.graph, nodes);
        let connections = LineConnections::new(self.services.connections.clone());
        let semaphore = (self.node_concurrency > 0)
            .then(|| Arc::new(Semaphore::new(self.node_concurrency)));
        let mut tasks: JoinSet<NodeOutcome> = JoinSet::new();

        loop {
            if cancel.is_cancelled() {
                return Err(canceled());
            }

            // Bypass and failure decisions can unlock further nodes immediately
            loop {
                let decisions = resolver.pop_ready(ctx);
                if decisions.is_empty() {
                    break;
                }
                for decision in decisions {
                    match decision {
                        Decision::Run(node) => match resolver.resolve_inputs(node, ctx) {
                            Ok(inputs) => {
                                let run_info = ctx.start_node(node, &inputs);
                                self.spawn(
                                    &mut tasks,
                                    node,
                                    inputs,
                                    run_info,
                                    &connections,
                                    semaphore.clone(),
                                    metrics.clone(),
                                );
                            }
                            Err(e) => self.fail_node(ctx, node, e)?,
                        },
                        Decision::Bypass(node) => {
                            debug!(node = %node.name, "bypassing node");
                            let info = ctx.record_bypass(node);
                            persist_node(self.services.storage.as_ref(), &info);
                            self.services
                                .events
                                .send_event(ExecutionEvent::node_bypassed(&node.name, ctx.line_number));
                        }
                        Decision::Fail(node, e) => self.fail_node(ctx, node, e)?,
                    }
                }
            }

            if tasks.is_empty() {
                if resolver.is_finished() {
                    return Ok(());
                }
                let pending = resolver.pending();
                error!(?pending, "no node is ready but some are still pending");
                return Err(ExecutorError::UnresolvedDependency { pending });
            }

            let joined = tokio::select! {
                joined = tasks.join_next() => joined,
                _ = cancel.cancelled() => return Err(canceled()),
            };

            match joined {
                Some(Ok(outcome)) => self.record(ctx, outcome)?,
                Some(Err(join_error)) => {
                    error!(error = %join_error, "node task did not finish");
                    return Err(ExecutorError::Canceled {
                        reason: join_error.to_string(),
                    });
                }
                None => {}
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn(
        &self,
        tasks: &mut JoinSet<NodeOutcome>,
        node: &Node,
        inputs: BTreeMap<String, Value>,
        run_info: RunInfo,
        connections: &LineConnections,
        semaphore: Option<Arc<Semaphore>>,
        metrics: Option<MetricLogger>,
    ) {
        self.services
            .events
            .send_event(ExecutionEvent::node_started(&node.name, run_info.line_number));

        let mut tool_ctx = ToolContext::new(&node.name, &run_info.run_id, run_info.line_number);
        if let Some(metrics) = metrics {
            tool_ctx = tool_ctx.with_metrics(metrics);
        }

        let hand_off = self.allow_stream_output
            && !node.aggregation
            && self.graph.can_hand_off_stream(&node.name);
        let node = node.clone();
        let services = self.services.clone();
        let connections = connections.clone();

        tasks.spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => semaphore.acquire_owned().await.ok(),
                None => None,
            };

            let invocation = services
                .invoker
                .invoke(&node, inputs, &connections, tool_ctx, run_info)
                .await;

            let mut run_info = invocation.run_info;
            match invocation.result {
                Ok(NodeValue::Ready(value)) => NodeOutcome::Ready(run_info, value),
                Ok(NodeValue::Stream(stream)) if hand_off => {
                    let stream = services.invoker.record_stream(run_info.clone(), stream);
                    NodeOutcome::Streamed(run_info, stream)
                }
                Ok(NodeValue::Stream(stream)) => {
                    let value = stream.materialize().await;
                    run_info.complete(value.clone());
                    NodeOutcome::Ready(run_info, value)
                }
                Err(e) => NodeOutcome::Failed(run_info, e),
            }
        });
    }

    fn record(&self, ctx: &mut FlowExecutionContext, outcome: NodeOutcome) -> ExecutorResult<()> {
        let events = &self.services.events;
        match outcome {
            NodeOutcome::Ready(info, value) => {
                persist_node(self.services.storage.as_ref(), &info);
                events.send_event(ExecutionEvent::NodeCompleted {
                    node: info.node.clone(),
                    line_number: info.line_number,
                    cached: info.cached,
                    duration: elapsed(&info),
                });
                ctx.finish(info, Some(value));
                Ok(())
            }
            NodeOutcome::Streamed(info, stream) => {
                events.send_event(ExecutionEvent::NodeCompleted {
                    node: info.node.clone(),
                    line_number: info.line_number,
                    cached: false,
                    duration: elapsed(&info),
                });
                ctx.finish_streaming(info, stream);
                Ok(())
            }
            NodeOutcome::Failed(info, e) => {
                persist_node(self.services.storage.as_ref(), &info);
                events.send_event(ExecutionEvent::node_failed(
                    &info.node,
                    info.line_number,
                    e.to_string(),
                ));
                ctx.finish(info, None);
                if self.raise_on_error {
                    return Err(ExecutorError::ToolExecution(e));
                }
                Ok(())
            }
        }
    }

    fn fail_node(
        &self,
        ctx: &mut FlowExecutionContext,
        node: &Node,
        error: ExecutorError,
    ) -> ExecutorResult<()> {
        debug!(node = %node.name, error = %error, "node not executed");
        let info = ctx.record_failure(node, error.to_info());
        persist_node(self.services.storage.as_ref(), &info);
        self.services.events.send_event(ExecutionEvent::node_failed(
            &node.name,
            ctx.line_number,
            error.to_string(),
        ));
        if self.raise_on_error {
            return Err(error);
        }
        Ok(())
    }
}

fn canceled() -> ExecutorError {
    ExecutorError::Canceled {
        reason: "the run was canceled".to_string(),
    }
}

fn elapsed(info: &RunInfo) -> std::time::Duration {
    info.duration()
        .and_then(|d| d.to_std().ok())
        .unwrap_or_default()
}
