// Flow Executor Library
// Dependency-driven execution of tool graphs over batches of input rows

pub mod config;
pub mod connections;
pub mod error;
pub mod execution;
pub mod inputs;
pub mod parser;
pub mod storage;
pub mod tools;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::ExecutorConfig;
pub use error::{ErrorInfo, ExecutorError, ExecutorResult};

// Re-export parser types
pub use parser::{FlowDefinition, FlowParser, ParseError, ParseErrorKind, ParseResult};

// Re-export execution types
pub use execution::{
    cancel_pair, progress_channel, AggregationResult, BatchResult, CancelHandle, CancelSignal,
    ExecutionEvent, FlowExecutor, FlowGraph, GraphError, GraphErrorKind, LineResult, ProgressSender,
    RunInfo, Status,
};

// Re-export tool types
pub use tools::{
    AsyncFnTool, FnTool, ParamType, Tool, ToolArgs, ToolContext, ToolError, ToolOutput,
    ToolRegistry, ToolSignature,
};

// Re-export sinks and providers
pub use connections::{Connection, ConnectionError, ConnectionProvider, MemoryConnectionProvider};
pub use inputs::Row;
pub use storage::{MemoryStorage, NoopStorage, RunStorage, StorageError};
