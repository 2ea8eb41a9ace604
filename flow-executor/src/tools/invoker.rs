// Tool Invoker
// Calls a node's tool with caching, retries, timing and failure capture

use crate::connections::LineConnections;
use crate::error::ErrorInfo;
use crate::execution::graph::Node;
use crate::execution::run_info::{RunInfo, Status};
use crate::storage::{persist_node, RunStorage};
use crate::tools::cache::{CachedOutput, ToolCache};
use crate::tools::stream::{materialize, RecordingStream};
use crate::tools::{ToolArgs, ToolContext, ToolError, ToolExecutionError, ToolOutput};

use chrono::Utc;
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, sleep, Instant};
use tracing::{debug, instrument, warn};

/// Upper bound for the delay between retries
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

/// Interval of the still-running warning
const LONG_RUNNING_INTERVAL: Duration = Duration::from_secs(60);

/// Output of a successful invocation
#[derive(Debug)]
pub enum NodeValue {
    Ready(Value),
    Stream(RecordingStream),
}

/// Finalized run info plus the node's output or attributed error
#[derive(Debug)]
pub struct Invocation {
    pub run_info: RunInfo,
    pub result: Result<NodeValue, ToolExecutionError>,
}

/// Calls tools on behalf of the schedulers
pub struct ToolInvoker {
    cache: Arc<ToolCache>,
    storage: Arc<dyn RunStorage>,
    long_running_interval: Duration,
}

impl ToolInvoker {
    pub fn new(cache: Arc<ToolCache>, storage: Arc<dyn RunStorage>) -> Self {
        Self {
            cache,
            storage,
            long_running_interval: LONG_RUNNING_INTERVAL,
        }
    }

    pub fn with_long_running_interval(mut self, interval: Duration) -> Self {
        self.long_running_interval = interval;
        self
    }

    pub fn cache(&self) -> &Arc<ToolCache> {
        &self.cache
    }

    /// Invoke the node's tool with resolved inputs.
    ///
    /// Cache hits skip the call. Failures are retried per the node's retry policy and
    /// returned as a [`ToolExecutionError`] carrying the node name, with the run info
    /// marked failed.
    #[instrument(skip_all, fields(node = %node.name, line = ?run_info.line_number))]
    pub async fn invoke(
        &self,
        node: &Node,
        inputs: BTreeMap<String, Value>,
        connections: &LineConnections,
        ctx: ToolContext,
        mut run_info: RunInfo,
    ) -> Invocation {
        run_info.start_time = Utc::now();
        run_info.inputs = inputs.clone();

        let args = match self.build_args(node, inputs, connections).await {
            Ok(args) => args,
            Err(e) => return Self::failed(node, run_info, e),
        };

        let cache_key = node
            .enable_cache
            .then(|| ToolCache::key(&node.tool_name, args.values()));

        if let Some(key) = &cache_key {
            if let Some(hit) = self.cache.get(key).await {
                debug!(cached_run_id = %hit.run_id, "serving node output from cache");
                run_info.cached = true;
                run_info.cached_run_id = Some(hit.run_id);
                run_info.complete(hit.output.clone());
                return Invocation {
                    run_info,
                    result: Ok(NodeValue::Ready(hit.output)),
                };
            }
        }

        let (result, attempts) = self.call_with_retry(node, args, &ctx).await;
        run_info.attempts = attempts;
        run_info.children = ctx.tracer().take();

        match result {
            Ok(ToolOutput::Value(value)) => {
                if let Some(key) = cache_key {
                    self.cache
                        .insert(
                            key,
                            CachedOutput {
                                output: value.clone(),
                                run_id: run_info.run_id.clone(),
                            },
                        )
                        .await;
                }
                run_info.complete(value.clone());
                Invocation {
                    run_info,
                    result: Ok(NodeValue::Ready(value)),
                }
            }
            Ok(ToolOutput::Stream(stream)) => {
                run_info.status = Status::Completed;
                run_info.streaming = true;
                run_info.end_time = Some(Utc::now());
                Invocation {
                    run_info,
                    result: Ok(NodeValue::Stream(RecordingStream::new(stream))),
                }
            }
            Err(e) => Self::failed(node, run_info, e),
        }
    }

    /// Attach the hook that persists the final run info once the caller drains the stream
    pub fn record_stream(&self, run_info: RunInfo, stream: RecordingStream) -> RecordingStream {
        let storage = self.storage.clone();
        stream.on_complete(move |items| {
            let mut run_info = run_info;
            run_info.output = Some(materialize(&items));
            run_info.end_time = Some(Utc::now());
            persist_node(storage.as_ref(), &run_info);
        })
    }

    fn failed(node: &Node, mut run_info: RunInfo, error: ToolError) -> Invocation {
        let error = ToolExecutionError::new(node.name.clone(), error);
        warn!(error = %error, "node failed");
        run_info.fail(ErrorInfo::new("ToolExecutionError", &error));
        Invocation {
            run_info,
            result: Err(error),
        }
    }

    async fn build_args(
        &self,
        node: &Node,
        inputs: BTreeMap<String, Value>,
        connections: &LineConnections,
    ) -> Result<ToolArgs, ToolError> {
        let connection_params: Vec<(String, String)> = node
            .signature()
            .params
            .iter()
            .filter(|(_, spec)| spec.ty.is_connection())
            .filter_map(|(param, _)| {
                inputs
                    .get(param)
                    .and_then(Value::as_str)
                    .map(|name| (param.clone(), name.to_string()))
            })
            .collect();

        let mut args = ToolArgs::new(inputs);
        for (param, name) in connection_params {
            let connection = connections.resolve(&name).await?;
            args = args.with_connection(param, connection);
        }
        Ok(args)
    }

    async fn call_with_retry(
        &self,
        node: &Node,
        args: ToolArgs,
        ctx: &ToolContext,
    ) -> (Result<ToolOutput, ToolError>, u32) {
        let policy = &node.retry;
        let max_attempts = policy.max_attempts.max(1);
        let multiplier = if policy.backoff_multiplier.is_finite() && policy.backoff_multiplier >= 1.0 {
            policy.backoff_multiplier
        } else {
            1.0
        };
        let mut delay = Duration::from_millis(policy.delay_ms).min(MAX_RETRY_DELAY);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match self.call_watched(node, args.clone(), ctx.clone()).await {
                Ok(output) => return (Ok(output), attempt),
                Err(e) if attempt < max_attempts => {
                    warn!(
                        attempt,
                        max_attempts,
                        error = %e,
                        "tool call failed, retrying in {:?}",
                        delay
                    );
                    sleep(delay).await;
                    delay = Duration::from_secs_f64(
                        (delay.as_secs_f64() * multiplier).min(MAX_RETRY_DELAY.as_secs_f64()),
                    );
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }

    /// Run one tool call, warning periodically while it is still running
    async fn call_watched(
        &self,
        node: &Node,
        args: ToolArgs,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolError> {
        let started = Instant::now();
        let call = AssertUnwindSafe(node.tool.invoke(args, ctx)).catch_unwind();
        tokio::pin!(call);

        let period = self.long_running_interval;
        let mut ticker = interval_at(started + period, period);
        loop {
            tokio::select! {
                outcome = &mut call => {
                    return outcome.unwrap_or_else(|panic| Err(ToolError::Panicked(panic_message(&*panic))));
                }
                _ = ticker.tick() => {
                    warn!(
                        elapsed_secs = started.elapsed().as_secs(),
                        tool = %node.tool_name,
                        "node is still running"
                    );
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "tool panicked".to_string()
    }
}
