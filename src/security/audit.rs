use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

pub const LOG_FILE: &str = "download.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditAction {
    Attempt,
    Success,
    Failed,
    Blocked,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Attempt => "attempt",
            AuditAction::Success => "success",
            AuditAction::Failed => "failed",
            AuditAction::Blocked => "blocked",
        }
    }
}

/// One line of the append-only download log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub ip: String,
    pub file_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

/// An event to record; the log stamps the timestamp itself.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub ip: String,
    pub file_id: String,
    pub file_name: Option<String>,
    pub action: AuditAction,
    pub reason: Option<String>,
    pub user_agent: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub file_id: Option<String>,
    pub limit: usize,
}

/// Append-only JSONL record of every download attempt.
///
/// This file is the durable source of truth for attempt history; the
/// in-memory throttle is a restart-losable cache derived from it. Appends are
/// serialized so concurrent requests never interleave lines. A failed append
/// must not fail the request being recorded.
#[derive(Debug, Clone)]
pub struct AuditLog {
    path: PathBuf,
    write_lock: Arc<Mutex<()>>,
}

impl AuditLog {
    pub fn new(log_dir: &Path) -> Self {
        Self {
            path: log_dir.join(LOG_FILE),
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stamp the event with the current time and append it. Persist failures
    /// are logged to the operational channel and swallowed.
    pub async fn record(&self, event: AuditEvent) {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            ip: event.ip,
            file_id: event.file_id,
            file_name: event.file_name,
            action: event.action,
            reason: event.reason,
            user_agent: event.user_agent,
        };

        // Mirror to the operational log
        match entry.action {
            AuditAction::Attempt | AuditAction::Success => {
                info!(target: "audit", event = entry.action.as_str(), ip = %entry.ip, file_id = %entry.file_id, reason = entry.reason.as_deref().unwrap_or(""));
            }
            AuditAction::Failed | AuditAction::Blocked => {
                warn!(target: "audit", event = entry.action.as_str(), ip = %entry.ip, file_id = %entry.file_id, reason = entry.reason.as_deref().unwrap_or(""));
            }
        }

        if let Err(e) = self.append(&entry).await {
            error!("failed to write audit log: {e:#}");
        }
    }

    async fn append(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry).context("serializing audit entry")?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        if let Some(dir) = self.path.parent() {
            tokio::fs::create_dir_all(dir)
                .await
                .context("creating log directory")?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .context("opening audit log")?;
        file.write_all(line.as_bytes())
            .await
            .context("appending audit entry")?;
        Ok(())
    }

    /// Read back entries, most recent first, at most `limit`, optionally
    /// filtered by file id. Unparseable lines are skipped.
    pub async fn query(&self, filter: &AuditQuery) -> Result<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).context("reading audit log"),
        };

        let mut entries: Vec<AuditEntry> = content
            .lines()
            .filter_map(|line| serde_json::from_str(line).ok())
            .collect();

        if let Some(file_id) = &filter.file_id {
            entries.retain(|e| &e.file_id == file_id);
        }

        entries.reverse();
        entries.truncate(filter.limit);
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn event(file_id: &str, action: AuditAction, reason: Option<&str>) -> AuditEvent {
        AuditEvent {
            ip: "1.2.3.4".to_string(),
            file_id: file_id.to_string(),
            file_name: Some("report.pdf".to_string()),
            action,
            reason: reason.map(str::to_string),
            user_agent: Some("curl/8.0".to_string()),
        }
    }

    #[tokio::test]
    async fn test_record_query_round_trip() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        log.record(event("file-a", AuditAction::Failed, Some("bad password")))
            .await;
        log.record(event("file-a", AuditAction::Success, None)).await;

        let entries = log
            .query(&AuditQuery {
                file_id: None,
                limit: 100,
            })
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        // Most recent first
        assert_eq!(entries[0].action, AuditAction::Success);
        assert_eq!(entries[1].action, AuditAction::Failed);
        assert_eq!(entries[1].reason.as_deref(), Some("bad password"));
        assert_eq!(entries[0].ip, "1.2.3.4");
        assert_eq!(entries[0].file_name.as_deref(), Some("report.pdf"));
        assert_eq!(entries[0].user_agent.as_deref(), Some("curl/8.0"));
    }

    #[tokio::test]
    async fn test_query_filters_by_file_id() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        log.record(event("file-a", AuditAction::Failed, None)).await;
        log.record(event("file-b", AuditAction::Success, None)).await;
        log.record(event("file-a", AuditAction::Blocked, None)).await;

        let entries = log
            .query(&AuditQuery {
                file_id: Some("file-a".to_string()),
                limit: 100,
            })
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.file_id == "file-a"));
        assert_eq!(entries[0].action, AuditAction::Blocked);
    }

    #[tokio::test]
    async fn test_query_respects_limit() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        for i in 0..5 {
            log.record(event(&format!("file-{i}"), AuditAction::Failed, None))
                .await;
        }

        let entries = log
            .query(&AuditQuery {
                file_id: None,
                limit: 2,
            })
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file_id, "file-4");
        assert_eq!(entries[1].file_id, "file-3");
    }

    #[tokio::test]
    async fn test_corrupt_lines_are_skipped() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        log.record(event("file-a", AuditAction::Success, None)).await;
        tokio::fs::write(
            log.path(),
            format!(
                "{}not json at all\n{{\"half\": \n",
                tokio::fs::read_to_string(log.path()).await.unwrap()
            ),
        )
        .await
        .unwrap();
        log.record(event("file-b", AuditAction::Failed, None)).await;

        let entries = log
            .query(&AuditQuery {
                file_id: None,
                limit: 100,
            })
            .await
            .unwrap();

        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].file_id, "file-b");
        assert_eq!(entries[1].file_id, "file-a");
    }

    #[tokio::test]
    async fn test_query_on_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let log = AuditLog::new(dir.path());

        let entries = log
            .query(&AuditQuery {
                file_id: None,
                limit: 10,
            })
            .await
            .unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_wire_format_field_names() {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            ip: "1.2.3.4".to_string(),
            file_id: "abc".to_string(),
            file_name: None,
            action: AuditAction::Blocked,
            reason: Some("Rate limited (60s remaining)".to_string()),
            user_agent: None,
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"fileId\":\"abc\""));
        assert!(json.contains("\"action\":\"blocked\""));
        assert!(json.contains("\"timestamp\":"));
        // Absent optionals are omitted, not null
        assert!(!json.contains("fileName"));
        assert!(!json.contains("userAgent"));
    }
}
