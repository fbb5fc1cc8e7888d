use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::PathBuf;

use crate::errors::DeskPilotResult;

/// One control-loop tick as persisted to the session log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TickRecord {
    pub ts: i64,
    pub subtask: String,
    pub action: String,
    pub command: serde_json::Value,
}

/// Append-only JSONL log of everything the loop emitted this session.
pub struct TrajectoryLog {
    pub session_id: String,
    entries: Vec<TickRecord>,
    file_path: PathBuf,
}

impl TrajectoryLog {
    pub fn new() -> Self {
        let session_id = uuid::Uuid::new_v4().to_string();
        let dir = data_dir_or_cwd();
        let file_path = dir.join(format!("session_{session_id}.jsonl"));
        Self {
            session_id,
            entries: Vec::new(),
            file_path,
        }
    }

    pub fn record(&mut self, subtask: &str, action: &str, command: serde_json::Value) {
        self.entries.push(TickRecord {
            ts: chrono::Utc::now().timestamp_millis(),
            subtask: subtask.to_string(),
            action: action.to_string(),
            command,
        });
        if let Err(e) = self.flush() {
            tracing::warn!(error = %e, "failed to flush trajectory entry");
        }
    }

    /// Appends the latest entry to the JSONL file.
    fn flush(&self) -> DeskPilotResult<()> {
        if let Some(last) = self.entries.last() {
            let line = serde_json::to_string(last)?;
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.file_path)?;
            writeln!(file, "{}", line)?;
        }
        Ok(())
    }

}

impl Default for TrajectoryLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Platform data directory (`~/.local/share/deskpilot/sessions` or the OS
/// equivalent), falling back to the current working directory.
fn data_dir_or_cwd() -> PathBuf {
    if let Some(base) = dirs::data_local_dir() {
        let dir = base.join("deskpilot").join("sessions");
        let _ = std::fs::create_dir_all(&dir);
        return dir;
    }
    std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."))
}
