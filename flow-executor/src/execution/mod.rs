// Execution Engine Module
// Flow graph, dependency resolution, line and batch execution, and aggregation

mod aggregation;
mod batch;
pub mod cancel;
pub mod context;
pub mod events;
pub mod executor;
pub mod graph;
mod line;
pub mod resolver;
pub mod run_info;
mod scheduler;

// Re-export key types
pub use cancel::{cancel_pair, CancelHandle, CancelSignal};
pub use context::{AggregatedInputs, FlowExecutionContext};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::FlowExecutor;
pub use graph::{ActivateCondition, FlowGraph, GraphError, GraphErrorKind, Node};
pub use resolver::{Decision, DependencyResolver};
pub use run_info::{
    AggregationError, AggregationResult, BatchResult, ErrorSummary, LineError, LineResult,
    LineRunInfo, RunInfo, Status,
};
