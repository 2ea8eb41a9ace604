// Tool Tracing
// Child traces recorded inside a tool body and the metric logger for aggregation nodes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Display;
use std::sync::{Arc, Mutex};
use tracing::warn;

/// A nested call recorded by a tool, stored on `RunInfo::children`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trace {
    pub name: String,
    pub inputs: Value,
    pub output: Option<Value>,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    /// Calls traced while this one was running
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Trace>,
}

impl Trace {
    fn open(name: String, inputs: Value) -> Self {
        let now = Utc::now();
        Self {
            name,
            inputs,
            output: None,
            error: None,
            start_time: now,
            end_time: now,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct TraceTree {
    roots: Vec<Trace>,
    /// Traces still running, innermost last
    open: Vec<Trace>,
}

impl TraceTree {
    fn attach(&mut self, trace: Trace) {
        match self.open.last_mut() {
            Some(parent) => parent.children.push(trace),
            None => self.roots.push(trace),
        }
    }
}

/// Collects the tree of child traces for one node invocation
#[derive(Debug, Clone, Default)]
pub struct Tracer {
    tree: Arc<Mutex<TraceTree>>,
}

impl Tracer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` and record its inputs, output or error as a child trace.
    /// Calls traced inside `f` become children of this trace.
    pub fn trace<E, F>(&self, name: impl Into<String>, inputs: Value, f: F) -> Result<Value, E>
    where
        E: Display,
        F: FnOnce() -> Result<Value, E>,
    {
        self.enter(name.into(), inputs);
        let result = f();
        self.exit(&result);
        result
    }

    /// Async variant of [`Tracer::trace`]
    pub async fn trace_async<E, Fut>(
        &self,
        name: impl Into<String>,
        inputs: Value,
        fut: Fut,
    ) -> Result<Value, E>
    where
        E: Display,
        Fut: std::future::Future<Output = Result<Value, E>>,
    {
        self.enter(name.into(), inputs);
        let result = fut.await;
        self.exit(&result);
        result
    }

    fn enter(&self, name: String, inputs: Value) {
        self.lock().open.push(Trace::open(name, inputs));
    }

    fn exit<E: Display>(&self, result: &Result<Value, E>) {
        let mut tree = self.lock();
        if let Some(mut trace) = tree.open.pop() {
            trace.output = result.as_ref().ok().cloned();
            trace.error = result.as_ref().err().map(|e| e.to_string());
            trace.end_time = Utc::now();
            tree.attach(trace);
        }
    }

    /// Record a finished trace under the innermost running one
    pub fn push(&self, trace: Trace) {
        self.lock().attach(trace);
    }

    /// Take all finished top-level traces, leaving the tracer empty
    pub fn take(&self) -> Vec<Trace> {
        std::mem::take(&mut self.lock().roots)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, TraceTree> {
        self.tree
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Metric sink made available to aggregation nodes
#[derive(Debug, Clone, Default)]
pub struct MetricLogger {
    metrics: Arc<Mutex<BTreeMap<String, Value>>>,
}

impl MetricLogger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a metric; a later value for the same key replaces the earlier one
    pub fn log(&self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if !(value.is_number() || value.is_string() || value.is_boolean()) {
            warn!(metric = %key, "metric value is not a scalar, storing it as-is");
        }
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(key, value);
    }

    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.metrics
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
