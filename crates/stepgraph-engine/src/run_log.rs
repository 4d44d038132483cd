use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use stepgraph_core::event::EventBus;
use stepgraph_core::types::RunEvent;

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line. The file
/// is append-only and flushed per entry, so a crash loses at most the event
/// being written.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    run_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl LogEntry {
    fn new(event_type: &'static str) -> Self {
        Self {
            timestamp: Utc::now().to_rfc3339(),
            event_type,
            run_id: None,
            node_type: None,
            detail: None,
        }
    }

    fn run(mut self, run_id: &impl ToString) -> Self {
        self.run_id = Some(run_id.to_string());
        self
    }

    fn node(mut self, node_type: &str) -> Self {
        self.node_type = Some(node_type.to_string());
        self
    }

    fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

impl RunLogger {
    /// `log_dir` is the base directory; logs are written to
    /// `{log_dir}/{label}/{timestamp}.jsonl`.
    /// `level` controls verbosity: 1=run summary, 2=per-step, 3=per-retry.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Run the logger as a background task until cancelled or the bus closes.
    ///
    /// Returns the path of the log file, if one was opened.
    pub async fn run(
        self,
        event_bus: Arc<EventBus>,
        label: &str,
        cancel: CancellationToken,
    ) -> Option<PathBuf> {
        // Subscribe first so nothing published after spawn is missed
        let mut rx = event_bus.subscribe();

        let dir = self.log_dir.join(label);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return None;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                // Drain queued events before honouring cancellation
                biased;
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            let entry = match self.event_to_entry(&event) {
                                Some(e) => e,
                                None => continue,
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
        Some(log_path)
    }

    /// Convert a RunEvent to a log entry (returns None if filtered by level).
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        match event {
            // L1: run lifecycle
            RunEvent::RunStarted { run_id, graph_name } => Some(
                LogEntry::new("run_started")
                    .run(run_id)
                    .detail(serde_json::json!({ "graph": graph_name })),
            ),
            RunEvent::RunCompleted { run_id, steps } => Some(
                LogEntry::new("run_completed")
                    .run(run_id)
                    .detail(serde_json::json!({ "steps": steps })),
            ),
            RunEvent::RunFailed {
                run_id,
                node_type,
                error,
            } => Some(
                LogEntry::new("run_failed")
                    .run(run_id)
                    .node(node_type)
                    .detail(serde_json::json!({ "error": error })),
            ),
            RunEvent::CapReached { run_id, max_steps } => Some(
                LogEntry::new("cap_reached")
                    .run(run_id)
                    .detail(serde_json::json!({ "max_steps": max_steps })),
            ),

            // L2: per-step
            RunEvent::StepRecorded {
                run_id,
                node_type,
                routed,
                success,
            } if self.level >= 2 => Some(
                LogEntry::new("step_recorded")
                    .run(run_id)
                    .node(node_type)
                    .detail(serde_json::json!({ "routed": routed, "success": success })),
            ),

            // L3: per-retry
            RunEvent::RetryScheduled {
                run_id,
                node_type,
                attempt,
                backoff_ms,
                error,
            } if self.level >= 3 => Some(
                LogEntry::new("retry_scheduled")
                    .run(run_id)
                    .node(node_type)
                    .detail(serde_json::json!({
                        "attempt": attempt,
                        "backoff_ms": backoff_ms,
                        "error": truncate_str(error, 200),
                    })),
            ),

            _ => None,
        }
    }
}

/// Truncate a string for logging, respecting char boundaries.
fn truncate_str(s: &str, max_len: usize) -> &str {
    if s.len() <= max_len {
        return s;
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
