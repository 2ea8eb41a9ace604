// Execution Events
// Progress reporting and event types for flow execution

use crate::execution::run_info::Status;

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

/// Events emitted during flow execution
#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    /// Batch run started
    BatchStarted {
        run_id: String,
        flow_name: String,
        total_lines: usize,
    },

    /// Batch run finished
    BatchCompleted {
        run_id: String,
        status: Status,
        completed_lines: usize,
        failed_lines: usize,
        duration: Duration,
    },

    /// Line execution started
    LineStarted { line_number: Option<usize> },

    /// Line execution finished
    LineCompleted {
        line_number: Option<usize>,
        status: Status,
        duration: Duration,
    },

    /// Node dispatched to its tool
    NodeStarted {
        node: String,
        line_number: Option<usize>,
    },

    /// Node completed
    NodeCompleted {
        node: String,
        line_number: Option<usize>,
        cached: bool,
        duration: Duration,
    },

    /// Node was bypassed by its activate condition or bypassed upstream nodes
    NodeBypassed {
        node: String,
        line_number: Option<usize>,
    },

    /// Node failed or was not run because an upstream node failed
    NodeFailed {
        node: String,
        line_number: Option<usize>,
        error: String,
    },

    /// Aggregation pass started
    AggregationStarted { nodes: Vec<String> },

    /// Aggregation pass finished
    AggregationCompleted {
        failed_nodes: usize,
        duration: Duration,
    },
}

impl ExecutionEvent {
    pub fn line_completed(line_number: Option<usize>, status: Status, duration: Duration) -> Self {
        Self::LineCompleted {
            line_number,
            status,
            duration,
        }
    }

    pub fn node_started(node: impl Into<String>, line_number: Option<usize>) -> Self {
        Self::NodeStarted {
            node: node.into(),
            line_number,
        }
    }

    pub fn node_bypassed(node: impl Into<String>, line_number: Option<usize>) -> Self {
        Self::NodeBypassed {
            node: node.into(),
            line_number,
        }
    }

    pub fn node_failed(
        node: impl Into<String>,
        line_number: Option<usize>,
        error: impl Into<String>,
    ) -> Self {
        Self::NodeFailed {
            node: node.into(),
            line_number,
            error: error.into(),
        }
    }

    /// Whether this event marks the end of a line, batch or aggregation pass
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::BatchCompleted { .. } | Self::LineCompleted { .. } | Self::AggregationCompleted { .. }
        )
    }
}

/// Helper trait for sending events
pub trait EventSender {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::LineStarted {
            line_number: Some(0),
        });
        tx.send_event(ExecutionEvent::node_started("double", Some(0)));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::LineStarted { .. }));

        let event2 = rx.recv().await.unwrap();
        assert!(matches!(event2, ExecutionEvent::NodeStarted { .. }));
    }

    #[test]
    fn test_optional_sender_without_receiver() {
        let none: Option<ProgressSender> = None;
        none.send_event(ExecutionEvent::node_bypassed("a", None));

        let (tx, rx) = progress_channel();
        drop(rx);
        Some(tx).send_event(ExecutionEvent::node_failed("a", None, "boom"));
    }

    #[test]
    fn test_terminal_events() {
        assert!(ExecutionEvent::line_completed(Some(1), Status::Failed, Duration::ZERO).is_terminal());
        assert!(!ExecutionEvent::node_started("a", Some(1)).is_terminal());
    }
}
