// Run Records
// Per-node run infos and the line, aggregation and batch results built from them

use crate::error::ErrorInfo;
use crate::tools::{RecordingStream, Trace};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

/// Status of a node run, a line run or a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    NotStarted,
    Running,
    Completed,
    Bypassed,
    Failed,
    Canceled,
}

impl Status {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Status::Completed | Status::Bypassed | Status::Failed | Status::Canceled
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::NotStarted => "not_started",
            Status::Running => "running",
            Status::Completed => "completed",
            Status::Bypassed => "bypassed",
            Status::Failed => "failed",
            Status::Canceled => "canceled",
        };
        f.write_str(name)
    }
}

/// Execution record of one node within one line (or one aggregation run)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunInfo {
    pub node: String,
    pub run_id: String,
    /// Run id of the whole batch or single-line run
    pub flow_run_id: String,
    /// Run id of the enclosing line, or the flow run for aggregation nodes
    pub parent_run_id: String,
    pub line_number: Option<usize>,
    pub status: Status,
    pub inputs: BTreeMap<String, Value>,
    pub output: Option<Value>,
    pub error: Option<ErrorInfo>,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    /// Output was served from the tool cache
    #[serde(default)]
    pub cached: bool,
    /// Run that originally produced the cached output
    #[serde(default)]
    pub cached_run_id: Option<String>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub children: Vec<Trace>,
    /// Output is a stream handed to the caller; `output` is filled in once it is drained
    #[serde(default)]
    pub streaming: bool,
}

impl RunInfo {
    /// Node run id: `{flow_run_id}_{node}_{line}`, or `{flow_run_id}_{node}_reduce` for aggregation
    pub fn node_run_id(flow_run_id: &str, node: &str, line_number: Option<usize>) -> String {
        match line_number {
            Some(line) => format!("{}_{}_{}", flow_run_id, node, line),
            None => format!("{}_{}_reduce", flow_run_id, node),
        }
    }

    /// A new record in `Running` state
    pub fn start(
        node: impl Into<String>,
        flow_run_id: impl Into<String>,
        parent_run_id: impl Into<String>,
        line_number: Option<usize>,
    ) -> Self {
        let node = node.into();
        let flow_run_id = flow_run_id.into();
        Self {
            run_id: Self::node_run_id(&flow_run_id, &node, line_number),
            node,
            flow_run_id,
            parent_run_id: parent_run_id.into(),
            line_number,
            status: Status::Running,
            inputs: BTreeMap::new(),
            output: None,
            error: None,
            start_time: Utc::now(),
            end_time: None,
            cached: false,
            cached_run_id: None,
            attempts: 0,
            children: Vec::new(),
            streaming: false,
        }
    }

    pub fn complete(&mut self, output: Value) {
        self.status = Status::Completed;
        self.output = Some(output);
        self.end_time = Some(Utc::now());
    }

    pub fn fail(&mut self, error: ErrorInfo) {
        self.status = Status::Failed;
        self.error = Some(error);
        self.end_time = Some(Utc::now());
    }

    pub fn bypass(&mut self) {
        self.status = Status::Bypassed;
        self.end_time = Some(Utc::now());
    }

    pub fn cancel(&mut self, error: ErrorInfo) {
        self.status = Status::Canceled;
        self.error = Some(error);
        self.end_time = Some(Utc::now());
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.end_time.map(|end| end - self.start_time)
    }
}

/// Line-level run record persisted to the run storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineRunInfo {
    pub run_id: String,
    pub flow_run_id: String,
    pub line_number: Option<usize>,
    pub status: Status,
    pub inputs: BTreeMap<String, Value>,
    pub output: BTreeMap<String, Value>,
    pub error: Option<ErrorInfo>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
}

/// Outcome of one line
#[derive(Debug)]
pub struct LineResult {
    /// Flow outputs; stream outputs handed to the caller are in `streams` instead
    pub output: BTreeMap<String, Value>,
    pub run_info: LineRunInfo,
    pub node_run_infos: BTreeMap<String, RunInfo>,
    /// Values referenced by aggregation nodes, keyed by node name or `inputs.NAME`
    pub aggregation_inputs: BTreeMap<String, Value>,
    /// Lazily consumed stream outputs, keyed by flow output name
    pub streams: BTreeMap<String, RecordingStream>,
}

impl LineResult {
    pub fn status(&self) -> Status {
        self.run_info.status
    }

    pub fn line_number(&self) -> Option<usize> {
        self.run_info.line_number
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.run_info.error.as_ref()
    }

    /// Result for a line that was never started
    pub fn not_run(
        flow_run_id: &str,
        line_number: usize,
        inputs: BTreeMap<String, Value>,
        status: Status,
        error: Option<ErrorInfo>,
    ) -> Self {
        let now = Utc::now();
        Self {
            output: BTreeMap::new(),
            run_info: LineRunInfo {
                run_id: format!("{}_{}", flow_run_id, line_number),
                flow_run_id: flow_run_id.to_string(),
                line_number: Some(line_number),
                status,
                inputs,
                output: BTreeMap::new(),
                error,
                start_time: now,
                end_time: now,
            },
            node_run_infos: BTreeMap::new(),
            aggregation_inputs: BTreeMap::new(),
            streams: BTreeMap::new(),
        }
    }
}

/// Outcome of the aggregation pass
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationResult {
    /// Metrics recorded through `log_metric`
    pub metrics: BTreeMap<String, Value>,
    /// Outputs of completed aggregation nodes
    pub outputs: BTreeMap<String, Value>,
    pub node_run_infos: BTreeMap<String, RunInfo>,
}

impl AggregationResult {
    pub fn failed_nodes(&self) -> impl Iterator<Item = &RunInfo> {
        self.node_run_infos
            .values()
            .filter(|info| info.status == Status::Failed)
    }
}

/// A failed line in the error summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LineError {
    pub line_number: usize,
    pub error: ErrorInfo,
}

/// A failed aggregation node in the error summary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationError {
    pub node: String,
    pub error: ErrorInfo,
}

/// Itemized failure reasons of a batch
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorSummary {
    /// Sorted by line number
    pub failed_lines: Vec<LineError>,
    pub failed_aggregation_nodes: Vec<AggregationError>,
}

impl ErrorSummary {
    pub fn is_empty(&self) -> bool {
        self.failed_lines.is_empty() && self.failed_aggregation_nodes.is_empty()
    }
}

/// Outcome of a batch run
#[derive(Debug)]
pub struct BatchResult {
    pub run_id: String,
    pub status: Status,
    /// Index-aligned with the input rows
    pub line_results: Vec<LineResult>,
    pub aggregation: AggregationResult,
    pub total_lines: usize,
    pub completed_lines: usize,
    pub failed_lines: usize,
    /// Node run counts keyed `{node}.{status}`
    pub node_status: BTreeMap<String, usize>,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub error_summary: ErrorSummary,
}

impl BatchResult {
    pub fn new(
        run_id: String,
        line_results: Vec<LineResult>,
        aggregation: AggregationResult,
        canceled: bool,
        start_time: DateTime<Utc>,
    ) -> Self {
        let total_lines = line_results.len();
        let completed_lines = line_results
            .iter()
            .filter(|line| line.status() == Status::Completed)
            .count();
        let failed_lines = line_results
            .iter()
            .filter(|line| line.status() == Status::Failed)
            .count();

        let mut node_status = BTreeMap::new();
        let node_runs = line_results
            .iter()
            .flat_map(|line| line.node_run_infos.values())
            .chain(aggregation.node_run_infos.values());
        for info in node_runs {
            *node_status
                .entry(format!("{}.{}", info.node, info.status))
                .or_insert(0) += 1;
        }

        let mut error_summary = ErrorSummary::default();
        for line in &line_results {
            if let (Status::Failed, Some(number), Some(error)) =
                (line.status(), line.line_number(), line.error())
            {
                error_summary.failed_lines.push(LineError {
                    line_number: number,
                    error: error.clone(),
                });
            }
        }
        error_summary.failed_lines.sort_by_key(|e| e.line_number);
        for info in aggregation.failed_nodes() {
            if let Some(error) = &info.error {
                error_summary.failed_aggregation_nodes.push(AggregationError {
                    node: info.node.clone(),
                    error: error.clone(),
                });
            }
        }

        let status = if canceled {
            Status::Canceled
        } else if total_lines > 0 && failed_lines == total_lines {
            Status::Failed
        } else {
            Status::Completed
        };

        Self {
            run_id,
            status,
            line_results,
            aggregation,
            total_lines,
            completed_lines,
            failed_lines,
            node_status,
            start_time,
            end_time: Utc::now(),
            error_summary,
        }
    }
}
