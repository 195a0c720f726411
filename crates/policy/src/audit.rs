//! Access audit trail: one record per query, whatever its outcome.

use std::fmt::Debug;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use riq_common::{Result, RiqError};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::principal::Principal;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Success,
    /// Stopped early; some partitions were never read.
    Partial,
    Denied,
    Failed,
    /// Cancelled, or dropped by its caller before it finished.
    Cancelled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp_ms: u64,
    pub role: String,
    #[serde(default)]
    pub user_id: Option<String>,
    pub table: String,
    pub action: String,
    pub rows_returned: u64,
    pub partitions_read: u64,
    pub outcome: AuditOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl AuditEvent {
    /// Event stamped now, with zero counts.
    pub fn new(principal: &Principal, table: &str, action: &str, outcome: AuditOutcome) -> Self {
        Self {
            timestamp_ms: now_ms(),
            role: principal.role_name.clone(),
            user_id: principal.user_id().map(str::to_string),
            table: table.to_string(),
            action: action.to_string(),
            rows_returned: 0,
            partitions_read: 0,
            outcome,
            detail: None,
        }
    }

    pub fn with_counts(mut self, rows_returned: u64, partitions_read: u64) -> Self {
        self.rows_returned = rows_returned;
        self.partitions_read = partitions_read;
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Destination for audit events.
pub trait AuditSink: Send + Sync + Debug {
    fn record(&self, event: &AuditEvent) -> Result<()>;
}

/// Appends events as JSON lines to a file.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads back recorded events, optionally only those of one user.
    ///
    /// Lines that do not decode are skipped with a warning.
    pub fn read_events(&self, user_id: Option<&str>) -> Result<Vec<AuditEvent>> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<AuditEvent>(line) {
                Ok(event) => {
                    if user_id.is_none() || event.user_id.as_deref() == user_id {
                        out.push(event);
                    }
                }
                Err(e) => warn!(
                    operator = "JsonLinesAuditSink",
                    path = %self.path.display(),
                    line = idx + 1,
                    error = %e,
                    "skipping undecodable audit line"
                ),
            }
        }
        Ok(out)
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        let mut line = serde_json::to_string(event)
            .map_err(|e| RiqError::Execution(format!("audit event encode failed: {e}")))?;
        line.push('\n');
        let _guard = self
            .write_lock
            .lock()
            .map_err(|_| RiqError::Execution("audit sink lock poisoned".to_string()))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }
}

/// Keeps events in memory; used by tests and embedded callers.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    events: Mutex<Vec<AuditEvent>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, event: &AuditEvent) -> Result<()> {
        self.events
            .lock()
            .map_err(|_| RiqError::Execution("audit sink lock poisoned".to_string()))?
            .push(event.clone());
        Ok(())
    }
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&self, _event: &AuditEvent) -> Result<()> {
        Ok(())
    }
}
