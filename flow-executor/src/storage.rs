// Run Storage
// Fire-and-forget sinks that receive finalized node and line run records

use crate::execution::run_info::{LineResult, LineRunInfo, RunInfo};

use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("failed to serialize run record: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Destination for finalized run records
pub trait RunStorage: Send + Sync {
    fn persist_node_run(&self, run_info: &RunInfo) -> Result<(), StorageError>;

    fn persist_line_run(&self, line: &LineResult) -> Result<(), StorageError>;
}

/// Persist a node run, logging instead of failing
pub(crate) fn persist_node(storage: &dyn RunStorage, run_info: &RunInfo) {
    if let Err(e) = storage.persist_node_run(run_info) {
        warn!(run_id = %run_info.run_id, error = %e, "failed to persist node run");
    }
}

/// Persist a line run, logging instead of failing
pub(crate) fn persist_line(storage: &dyn RunStorage, line: &LineResult) {
    if let Err(e) = storage.persist_line_run(line) {
        warn!(run_id = %line.run_info.run_id, error = %e, "failed to persist line run");
    }
}

/// Storage that drops every record
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopStorage;

impl RunStorage for NoopStorage {
    fn persist_node_run(&self, _run_info: &RunInfo) -> Result<(), StorageError> {
        Ok(())
    }

    fn persist_line_run(&self, _line: &LineResult) -> Result<(), StorageError> {
        Ok(())
    }
}

/// Storage that keeps records in memory
#[derive(Debug, Default)]
pub struct MemoryStorage {
    node_runs: Mutex<Vec<RunInfo>>,
    line_runs: Mutex<Vec<LineRunInfo>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn node_runs(&self) -> Vec<RunInfo> {
        self.node_runs
            .lock()
            .map(|runs| runs.clone())
            .unwrap_or_default()
    }

    pub fn line_runs(&self) -> Vec<LineRunInfo> {
        self.line_runs
            .lock()
            .map(|runs| runs.clone())
            .unwrap_or_default()
    }

    /// Latest persisted record for a node run id
    pub fn node_run(&self, run_id: &str) -> Option<RunInfo> {
        self.node_runs()
            .into_iter()
            .rev()
            .find(|info| info.run_id == run_id)
    }
}

impl RunStorage for MemoryStorage {
    fn persist_node_run(&self, run_info: &RunInfo) -> Result<(), StorageError> {
        self.node_runs
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .push(run_info.clone());
        Ok(())
    }

    fn persist_line_run(&self, line: &LineResult) -> Result<(), StorageError> {
        self.line_runs
            .lock()
            .map_err(|e| StorageError::Unavailable(e.to_string()))?
            .push(line.run_info.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::run_info::Status;
    use serde_json::json;
    use std::collections::BTreeMap;

    struct FailingStorage;

    impl RunStorage for FailingStorage {
        fn persist_node_run(&self, _run_info: &RunInfo) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk full".to_string()))
        }

        fn persist_line_run(&self, _line: &LineResult) -> Result<(), StorageError> {
            Err(StorageError::Unavailable("disk full".to_string()))
        }
    }

    #[test]
    fn test_memory_storage_records_runs() {
        let storage = MemoryStorage::new();
        let mut info = RunInfo::start("a", "run", "run_0", Some(0));
        persist_node(&storage, &info);
        info.complete(json!(1));
        persist_node(&storage, &info);

        let line = LineResult::not_run("run", 0, BTreeMap::new(), Status::Completed, None);
        persist_line(&storage, &line);

        assert_eq!(storage.node_runs().len(), 2);
        assert_eq!(
            storage.node_run("run_a_0").unwrap().status,
            Status::Completed
        );
        assert_eq!(storage.line_runs()[0].run_id, "run_0");
    }

    #[test]
    fn test_persist_failures_are_swallowed() {
        let info = RunInfo::start("a", "run", "run_0", Some(0));
        persist_node(&FailingStorage, &info);

        let line = LineResult::not_run("run", 0, BTreeMap::new(), Status::Failed, None);
        persist_line(&FailingStorage, &line);
    }
}
