//! Last-run summary log
//!
//! One JSON object per line in `<state dir>/runs.log`, appended after each
//! cycle or dedupe pass. The log is for operators only: writing it is best
//! effort and nothing reads it to decide what a cycle does.
use crate::core::dedupe::DedupeReport;
use crate::core::reconcile::{CycleReport, StoreReport};
use crate::utils::truncate_string;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

pub const RUN_LOG_FILE: &str = "runs.log";

/// Longest error text kept per record; CLI stderr can run to pages
const MAX_ERROR_LEN: usize = 512;

fn short_error(error: &str) -> String {
    truncate_string(error, MAX_ERROR_LEN)
}

/// What produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum RunKind {
    Sync,
    DaemonTick,
    Dedupe,
}

/// Counts for one store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreSummary {
    pub store: String,
    pub status: String,
    pub added: usize,
    pub covered: usize,
    #[serde(default)]
    pub removed: usize,
    pub failed: usize,
    pub error: Option<String>,
}

impl From<&StoreReport> for StoreSummary {
    fn from(report: &StoreReport) -> Self {
        Self {
            store: report.store.to_string(),
            status: report.status.to_string(),
            added: report.added.len(),
            covered: report.covered.len(),
            removed: 0,
            failed: report.failed.len(),
            error: report.error.as_deref().map(short_error),
        }
    }
}

/// A single run log entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    /// When the run started (UTC)
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub cycle_id: Uuid,
    pub kind: RunKind,
    pub exit_code: u8,
    /// Size of the desired port set
    pub desired: usize,
    pub stores: Vec<StoreSummary>,
    /// SHA-256 of the security list rules before any update
    pub cloud_fingerprint: Option<String>,
    pub error: Option<String>,
}

impl RunRecord {
    pub fn from_cycle(report: &CycleReport, kind: RunKind) -> Self {
        Self {
            timestamp: report.started_at,
            cycle_id: report.cycle_id,
            kind,
            exit_code: report.exit_status().code(),
            desired: report.desired.len(),
            stores: report.stores().map(StoreSummary::from).collect(),
            cloud_fingerprint: report.cloud_fingerprint.clone(),
            error: report.discovery_error.as_deref().map(short_error),
        }
    }

    /// `reports` pairs a store name with its outcome (or the error that stopped it).
    pub fn from_dedupe(reports: &[(&str, Result<DedupeReport, String>)], exit_code: u8) -> Self {
        let stores = reports
            .iter()
            .map(|(store, outcome)| match outcome {
                Ok(r) => StoreSummary {
                    store: (*store).to_string(),
                    status: if r.declined { "declined" } else { "deduplicated" }.to_string(),
                    added: 0,
                    covered: 0,
                    removed: r.removed,
                    failed: r.failed.len(),
                    error: None,
                },
                Err(e) => StoreSummary {
                    store: (*store).to_string(),
                    status: "failed".to_string(),
                    added: 0,
                    covered: 0,
                    removed: 0,
                    failed: 0,
                    error: Some(short_error(e)),
                },
            })
            .collect();
        Self {
            timestamp: chrono::Utc::now(),
            cycle_id: Uuid::new_v4(),
            kind: RunKind::Dedupe,
            exit_code,
            desired: 0,
            stores,
            cloud_fingerprint: None,
            error: None,
        }
    }

    /// One-line rendering for `status`
    pub fn summary(&self) -> String {
        let stores: Vec<String> = self
            .stores
            .iter()
            .map(|s| {
                format!(
                    "{} {} (+{} ={} -{} !{})",
                    s.store, s.status, s.added, s.covered, s.removed, s.failed
                )
            })
            .collect();
        format!(
            "{} {} exit {}: {}",
            self.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            self.kind,
            self.exit_code,
            if stores.is_empty() {
                self.error.clone().unwrap_or_else(|| "no stores".to_string())
            } else {
                stores.join("; ")
            }
        )
    }
}

/// Run log writer
pub struct RunLog {
    log_path: PathBuf,
}

impl RunLog {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            log_path: state_dir.join(RUN_LOG_FILE),
        }
    }

    /// Appends a record to the run log
    ///
    /// Records are written as JSON-lines format (one JSON object per line)
    ///
    /// # Errors
    ///
    /// Returns `Err` if file cannot be opened or written
    pub async fn append(&self, record: &RunRecord) -> std::io::Result<()> {
        let json = serde_json::to_string(record)?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .mode(0o600)
            .open(&self.log_path)
            .await?;

        file.write_all(json.as_bytes()).await?;
        file.write_all(b"\n").await?;
        file.sync_all().await?;

        Ok(())
    }

    /// Appends, logging a warning instead of failing
    pub async fn record(&self, record: &RunRecord) {
        if let Err(e) = self.append(record).await {
            tracing::warn!("Failed to write run log {}: {}", self.log_path.display(), e);
        }
    }

    /// Reads the most recent records, newest first
    ///
    /// Lines that do not parse are skipped. A missing log is empty.
    pub async fn read_recent(&self, count: usize) -> std::io::Result<Vec<RunRecord>> {
        let content = match tokio::fs::read_to_string(&self.log_path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        Ok(content
            .lines()
            .rev()
            .filter_map(|line| serde_json::from_str(line).ok())
            .take(count)
            .collect())
    }

    pub async fn latest(&self) -> std::io::Result<Option<RunRecord>> {
        Ok(self.read_recent(1).await?.into_iter().next())
    }

    pub fn path(&self) -> &Path {
        &self.log_path
    }
}
