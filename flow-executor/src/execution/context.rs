// Flow Execution Context
// Per-line execution state: resolved inputs, node run infos and node outputs

use crate::error::ErrorInfo;
use crate::execution::graph::Node;
use crate::execution::run_info::{RunInfo, Status};
use crate::parser::models::{apply_path, FailedLinePolicy};
use crate::tools::RecordingStream;

use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Per-line values collected across a batch for the aggregation pass.
/// A `None` entry marks a line that did not complete.
#[derive(Debug, Clone, Default)]
pub struct AggregatedInputs {
    columns: BTreeMap<String, Vec<Option<Value>>>,
}

impl AggregatedInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: impl Into<String>, column: Vec<Option<Value>>) {
        self.columns.insert(key.into(), column);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.columns.contains_key(key)
    }

    /// Column as a list under the given failed-line policy, with `path` applied per element
    pub fn list(&self, key: &str, path: &[String], policy: FailedLinePolicy) -> Option<Value> {
        let column = self.columns.get(key)?;
        let items = column
            .iter()
            .filter_map(|entry| match (entry, policy) {
                (Some(value), _) => Some(apply_path(value, path).unwrap_or(Value::Null)),
                (None, FailedLinePolicy::Skip) => None,
                (None, FailedLinePolicy::Null) => Some(Value::Null),
            })
            .collect();
        Some(Value::Array(items))
    }
}

/// Execution state of one line, or of the aggregation pass
#[derive(Debug)]
pub struct FlowExecutionContext {
    pub flow_run_id: String,
    /// Line run id, or the flow run id during aggregation
    pub run_id: String,
    pub line_number: Option<usize>,
    pub inputs: BTreeMap<String, Value>,
    run_infos: BTreeMap<String, RunInfo>,
    outputs: HashMap<String, Value>,
    streams: HashMap<String, RecordingStream>,
    aggregated: Option<AggregatedInputs>,
}

impl FlowExecutionContext {
    pub fn for_line(
        flow_run_id: impl Into<String>,
        run_id: impl Into<String>,
        line_number: Option<usize>,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            flow_run_id: flow_run_id.into(),
            run_id: run_id.into(),
            line_number,
            inputs,
            run_infos: BTreeMap::new(),
            outputs: HashMap::new(),
            streams: HashMap::new(),
            aggregated: None,
        }
    }

    pub fn for_aggregation(flow_run_id: impl Into<String>, aggregated: AggregatedInputs) -> Self {
        let flow_run_id = flow_run_id.into();
        Self {
            run_id: flow_run_id.clone(),
            flow_run_id,
            line_number: None,
            inputs: BTreeMap::new(),
            run_infos: BTreeMap::new(),
            outputs: HashMap::new(),
            streams: HashMap::new(),
            aggregated: Some(aggregated),
        }
    }

    /// Status of a node; values collected for aggregation count as completed
    pub fn status(&self, node: &str) -> Status {
        match self.run_infos.get(node) {
            Some(info) => info.status,
            None if self.is_aggregated(node) => Status::Completed,
            None => Status::NotStarted,
        }
    }

    pub fn is_aggregated(&self, key: &str) -> bool {
        self.aggregated
            .as_ref()
            .map(|agg| agg.contains(key))
            .unwrap_or(false)
    }

    pub fn aggregated_list(
        &self,
        key: &str,
        path: &[String],
        policy: FailedLinePolicy,
    ) -> Option<Value> {
        self.aggregated.as_ref()?.list(key, path, policy)
    }

    pub fn output(&self, node: &str) -> Option<&Value> {
        self.outputs.get(node)
    }

    pub fn run_info(&self, node: &str) -> Option<&RunInfo> {
        self.run_infos.get(node)
    }

    pub fn run_infos(&self) -> &BTreeMap<String, RunInfo> {
        &self.run_infos
    }

    fn new_run_info(&self, node: &Node) -> RunInfo {
        RunInfo::start(
            node.name.clone(),
            self.flow_run_id.clone(),
            self.run_id.clone(),
            self.line_number,
        )
    }

    /// Mark a node as running and return its fresh run info
    pub fn start_node(&mut self, node: &Node, inputs: &BTreeMap<String, Value>) -> RunInfo {
        let mut info = self.new_run_info(node);
        info.inputs = inputs.clone();
        self.run_infos.insert(node.name.clone(), info.clone());
        info
    }

    pub fn record_bypass(&mut self, node: &Node) -> RunInfo {
        let mut info = self.new_run_info(node);
        info.bypass();
        self.run_infos.insert(node.name.clone(), info.clone());
        info
    }

    pub fn record_failure(&mut self, node: &Node, error: ErrorInfo) -> RunInfo {
        let mut info = self.new_run_info(node);
        info.fail(error);
        self.run_infos.insert(node.name.clone(), info.clone());
        info
    }

    /// Store a finalized run info and, when completed, its output
    pub fn finish(&mut self, run_info: RunInfo, output: Option<Value>) {
        if let Some(value) = output {
            self.outputs.insert(run_info.node.clone(), value);
        }
        self.run_infos.insert(run_info.node.clone(), run_info);
    }

    /// Store a completed node whose output stream is handed to the caller
    pub fn finish_streaming(&mut self, run_info: RunInfo, stream: RecordingStream) {
        self.streams.insert(run_info.node.clone(), stream);
        self.run_infos.insert(run_info.node.clone(), run_info);
    }

    pub fn take_stream(&mut self, node: &str) -> Option<RecordingStream> {
        self.streams.remove(node)
    }

    /// Mark every running node as canceled, returning the finalized records
    pub fn cancel_running(&mut self, error: &ErrorInfo) -> Vec<RunInfo> {
        let mut canceled = Vec::new();
        for info in self.run_infos.values_mut() {
            if info.status == Status::Running {
                info.cancel(error.clone());
                canceled.push(info.clone());
            }
        }
        canceled
    }

    pub fn into_run_infos(self) -> BTreeMap<String, RunInfo> {
        self.run_infos
    }
}
