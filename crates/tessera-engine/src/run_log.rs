use std::collections::HashMap;
use std::path::PathBuf;

use chrono::Utc;
use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use tessera_core::event::{ActEvent, EventBus};
use tessera_core::types::ActId;

/// JSONL runtime logger.
///
/// Subscribes to the EventBus and writes one append-only JSONL file per act
/// under `{log_dir}/{act_id}/{timestamp}.jsonl`. Lines already written
/// survive a crash mid-act.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
}

/// A single log entry written to the JSONL file.
#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    act_id: String,
    event_type: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level` controls verbosity: 1 = act summary, 2 = generation
    /// transitions, 3 = queueing and retries.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self { log_dir, level }
    }

    /// Subscribe now and log in a background task until `cancel` fires or
    /// the bus closes. Subscribing before returning means no event published
    /// after this call is missed.
    pub fn spawn(self, event_bus: &EventBus, cancel: CancellationToken) -> JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.run(rx, cancel))
    }

    async fn run(self, mut rx: broadcast::Receiver<ActEvent>, cancel: CancellationToken) {
        let mut files: HashMap<ActId, BufWriter<File>> = HashMap::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => {
                        let Some(entry) = self.event_to_entry(&event) else {
                            continue;
                        };
                        let act_id = event.act_id().clone();
                        if !files.contains_key(&act_id) {
                            match self.open(&act_id).await {
                                Some(writer) => {
                                    files.insert(act_id.clone(), writer);
                                }
                                None => continue,
                            }
                        }
                        if let Some(writer) = files.get_mut(&act_id) {
                            write_entry(writer, &entry).await;
                        }
                        if matches!(event, ActEvent::ActFinished { .. }) {
                            if let Some(mut writer) = files.remove(&act_id) {
                                writer.flush().await.ok();
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        debug!(skipped = n, "RunLogger lagged, skipped events");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, RunLogger stopping");
                        break;
                    }
                },
            }
        }

        for (_, mut writer) in files {
            writer.flush().await.ok();
        }
    }

    async fn open(&self, act_id: &ActId) -> Option<BufWriter<File>> {
        let act_dir = self.log_dir.join(act_id.as_str());
        if let Err(e) = tokio::fs::create_dir_all(&act_dir).await {
            error!(error = %e, "Failed to create log directory");
            return None;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = act_dir.join(format!("{}.jsonl", timestamp));
        match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => {
                info!(path = %log_path.display(), "Run log opened");
                Some(BufWriter::new(f))
            }
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                None
            }
        }
    }

    /// Convert an event to a log entry, or `None` if filtered by level.
    fn event_to_entry(&self, event: &ActEvent) -> Option<LogEntry> {
        let entry = |event_type, node_id: Option<String>, generation_id: Option<String>, detail| LogEntry {
            timestamp: Utc::now().to_rfc3339(),
            act_id: event.act_id().to_string(),
            event_type,
            node_id,
            generation_id,
            detail,
        };

        match event {
            // L1: act summary
            ActEvent::ActStarted {
                workspace_id, steps, ..
            } => Some(entry(
                "act_started",
                None,
                None,
                Some(serde_json::json!({ "workspace_id": workspace_id, "steps": steps })),
            )),
            ActEvent::ActFinished {
                status,
                agent_time_ms,
                ..
            } => Some(entry(
                "act_finished",
                None,
                None,
                Some(serde_json::json!({ "status": status, "agent_time_ms": agent_time_ms })),
            )),

            // L2: generation transitions
            ActEvent::GenerationStarted {
                generation_id,
                node_id,
                ..
            } if self.level >= 2 => Some(entry(
                "generation_started",
                Some(node_id.to_string()),
                Some(generation_id.to_string()),
                None,
            )),
            ActEvent::GenerationFinished {
                generation_id,
                node_id,
                status,
                duration_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "generation_finished",
                Some(node_id.to_string()),
                Some(generation_id.to_string()),
                Some(serde_json::json!({ "status": status, "duration_ms": duration_ms })),
            )),

            // L3: queueing and retries
            ActEvent::GenerationQueued {
                generation_id,
                node_id,
                ..
            } if self.level >= 3 => Some(entry(
                "generation_queued",
                Some(node_id.to_string()),
                Some(generation_id.to_string()),
                None,
            )),
            ActEvent::GenerationRetrying {
                generation_id,
                node_id,
                attempt,
                error,
                ..
            } if self.level >= 3 => Some(entry(
                "generation_retrying",
                Some(node_id.to_string()),
                Some(generation_id.to_string()),
                Some(serde_json::json!({ "attempt": attempt, "error": truncate_str(error, 200) })),
            )),

            _ => None,
        }
    }
}

async fn write_entry(writer: &mut BufWriter<File>, entry: &LogEntry) {
    let Ok(json) = serde_json::to_string(entry) else {
        return;
    };
    let line = format!("{}\n", json);
    if let Err(e) = writer.write_all(line.as_bytes()).await {
        error!(error = %e, "Failed to write log entry");
        return;
    }
    // Flush after each entry for crash resilience
    if let Err(e) = writer.flush().await {
        error!(error = %e, "Failed to flush log");
    }
}

/// Truncate a string for logging, on a char boundary.
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
