// Output formatting helpers for CLI commands

use flow_executor::{BatchResult, Status};

use std::time::Duration;

/// Print a status message: "  Status message"
pub fn status(action: &str, message: &str) {
    eprintln!("\x1b[1;36m{:>12}\x1b[0m {}", action, message);
}

/// Print a success message with checkmark
pub fn success(message: &str) {
    eprintln!("\x1b[1;32m  \u{2713}\x1b[0m {}", message);
}

/// Print a failure message with X
pub fn failure(message: &str) {
    eprintln!("\x1b[1;31m  \u{2717}\x1b[0m {}", message);
}

pub fn check(message: &str) {
    eprintln!("\x1b[32m  \u{2713}\x1b[0m {}", message);
}

pub fn warning(message: &str) {
    eprintln!("\x1b[33m  !\x1b[0m {}", message);
}

pub fn error(message: &str) {
    eprintln!("\x1b[1;31merror:\x1b[0m {}", message);
}

pub fn info(message: &str) {
    eprintln!("\x1b[36m  i\x1b[0m {}", message);
}

pub fn dim(message: &str) {
    eprintln!("\x1b[2m{}\x1b[0m", message);
}

pub fn header(message: &str) {
    eprintln!("\x1b[1m==> {}\x1b[0m", message);
}

/// Short label for a terminal status
pub fn status_label(status: Status) -> &'static str {
    match status {
        Status::Completed => "OK",
        Status::Failed => "FAIL",
        Status::Canceled => "CANCELED",
        Status::Bypassed => "SKIP",
        _ => "DONE",
    }
}

/// One line per finished line run, coloured by status
pub fn line_finished(line_number: Option<usize>, status: Status, duration: Duration) {
    let label = match line_number {
        Some(n) => format!("line {}", n),
        None => "line".to_string(),
    };
    let text = format!(
        "  [{}] {} ({:.2}s)",
        label,
        status_label(status),
        duration.as_secs_f64()
    );
    match status {
        Status::Completed => eprintln!("\x1b[32m{}\x1b[0m", text),
        Status::Failed => eprintln!("\x1b[31m{}\x1b[0m", text),
        _ => eprintln!("\x1b[33m{}\x1b[0m", text),
    }
}

/// Print the batch summary: counts, per-node status totals, errors and metrics
pub fn batch_summary(result: &BatchResult) {
    eprintln!();
    header(&format!("Batch {}", result.run_id));
    info(&format!(
        "{} lines: {} completed, {} failed",
        result.total_lines, result.completed_lines, result.failed_lines
    ));

    for (key, count) in &result.node_status {
        dim(&format!("    {:<32} {}", key, count));
    }

    for failed in &result.error_summary.failed_lines {
        warning(&format!(
            "line {}: [{}] {}",
            failed.line_number, failed.error.code, failed.error.message
        ));
    }
    for failed in &result.error_summary.failed_aggregation_nodes {
        warning(&format!(
            "aggregation '{}': [{}] {}",
            failed.node, failed.error.code, failed.error.message
        ));
    }

    for (key, value) in &result.aggregation.metrics {
        info(&format!("metric {} = {}", key, value));
    }

    let elapsed = (result.end_time - result.start_time)
        .to_std()
        .unwrap_or_default();
    match result.status {
        Status::Completed => success(&format!(
            "Batch completed in {:.2}s",
            elapsed.as_secs_f64()
        )),
        status => failure(&format!(
            "Batch {} after {:.2}s",
            status,
            elapsed.as_secs_f64()
        )),
    }
}
