//! Counters and recent entries describing pipeline health.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Number of recent entries kept in memory.
const RECENT_CAPACITY: usize = 64;

/// Where a diagnostic came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    Session,
    Extraction,
    Transport,
    Persistence,
    Cleanup,
}

/// One structured diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    pub at: DateTime<Utc>,
    /// Tick the entry belongs to, if any
    pub tick: Option<u64>,
    pub kind: DiagnosticKind,
    pub message: String,
}

/// Pipeline health counters for the current run.
#[derive(Debug)]
pub struct DiagnosticsLog {
    /// Ticks executed
    ticks: AtomicU64,
    /// Records successfully persisted
    records_written: AtomicU64,
    /// Ticks that found no new data
    no_data_ticks: AtomicU64,
    /// Ticks skipped because of an error
    failed_ticks: AtomicU64,
    /// Records that could not be persisted
    write_failures: AtomicU64,
    /// Errors swallowed during shutdown
    cleanup_errors: AtomicU64,
    recent: Mutex<VecDeque<DiagnosticEntry>>,
    run_start: DateTime<Utc>,
    persist_path: Option<PathBuf>,
}

impl DiagnosticsLog {
    pub fn new() -> Self {
        Self {
            ticks: AtomicU64::new(0),
            records_written: AtomicU64::new(0),
            no_data_ticks: AtomicU64::new(0),
            failed_ticks: AtomicU64::new(0),
            write_failures: AtomicU64::new(0),
            cleanup_errors: AtomicU64::new(0),
            recent: Mutex::new(VecDeque::with_capacity(RECENT_CAPACITY)),
            run_start: Utc::now(),
            persist_path: None,
        }
    }

    /// Create a log that loads and saves its counters at `path`.
    pub fn with_persistence(path: PathBuf) -> Self {
        let mut log = Self::new();
        log.persist_path = Some(path);

        if let Err(e) = log.load() {
            tracing::warn!(error = %e, "Could not load previous diagnostics");
        }

        log
    }

    pub fn record_tick(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_written(&self) {
        self.records_written.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_no_data(&self) {
        self.no_data_ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a skipped tick.
    pub fn record_tick_failure(&self, tick: u64, kind: DiagnosticKind, message: impl Into<String>) {
        self.failed_ticks.fetch_add(1, Ordering::Relaxed);
        self.push(Some(tick), kind, message.into());
    }

    /// Record a record that was produced but not persisted.
    pub fn record_write_failure(&self, tick: u64, message: impl Into<String>) {
        self.write_failures.fetch_add(1, Ordering::Relaxed);
        self.push(Some(tick), DiagnosticKind::Persistence, message.into());
    }

    /// Record an error swallowed while shutting down.
    pub fn record_cleanup_error(&self, message: impl Into<String>) {
        self.cleanup_errors.fetch_add(1, Ordering::Relaxed);
        self.push(None, DiagnosticKind::Cleanup, message.into());
    }

    fn push(&self, tick: Option<u64>, kind: DiagnosticKind, message: String) {
        let mut recent = self.recent.lock().unwrap_or_else(|p| p.into_inner());
        if recent.len() == RECENT_CAPACITY {
            recent.pop_front();
        }
        recent.push_back(DiagnosticEntry {
            at: Utc::now(),
            tick,
            kind,
            message,
        });
    }

    /// Copy of the most recent entries, oldest first.
    pub fn recent(&self) -> Vec<DiagnosticEntry> {
        self.recent
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> DiagnosticsStats {
        DiagnosticsStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            no_data_ticks: self.no_data_ticks.load(Ordering::Relaxed),
            failed_ticks: self.failed_ticks.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
            cleanup_errors: self.cleanup_errors.load(Ordering::Relaxed),
            run_start: self.run_start,
            run_duration_secs: (Utc::now() - self.run_start).num_seconds().max(0) as u64,
        }
    }

    /// Summary string for display.
    pub fn summary(&self) -> String {
        let stats = self.stats();
        let mut summary = format!(
            "Pipeline Statistics:\n\
             - Ticks: {}\n\
             - Records written: {}\n\
             - Ticks without data: {}\n\
             - Ticks skipped on error: {}\n\
             - Write failures: {}\n\
             - Cleanup errors: {}\n\
             - Run duration: {} seconds",
            stats.ticks,
            stats.records_written,
            stats.no_data_ticks,
            stats.failed_ticks,
            stats.write_failures,
            stats.cleanup_errors,
            stats.run_duration_secs
        );
        if stats.write_failures > 0 {
            summary.push_str("\n\nWARNING: some records were not written to disk.");
        }
        summary
    }

    /// Save counters and recent entries to disk.
    pub fn save(&self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }

            let stats = self.stats();
            let persisted = PersistedDiagnostics {
                ticks: stats.ticks,
                records_written: stats.records_written,
                no_data_ticks: stats.no_data_ticks,
                failed_ticks: stats.failed_ticks,
                write_failures: stats.write_failures,
                cleanup_errors: stats.cleanup_errors,
                recent: self.recent(),
                last_updated: Utc::now(),
            };

            let json = serde_json::to_string_pretty(&persisted).map_err(std::io::Error::other)?;

            std::fs::write(path, json)?;
        }
        Ok(())
    }

    fn load(&mut self) -> Result<(), std::io::Error> {
        if let Some(ref path) = self.persist_path {
            if path.exists() {
                let content = std::fs::read_to_string(path)?;
                let persisted: PersistedDiagnostics =
                    serde_json::from_str(&content).map_err(std::io::Error::other)?;

                self.ticks.store(persisted.ticks, Ordering::Relaxed);
                self.records_written
                    .store(persisted.records_written, Ordering::Relaxed);
                self.no_data_ticks
                    .store(persisted.no_data_ticks, Ordering::Relaxed);
                self.failed_ticks
                    .store(persisted.failed_ticks, Ordering::Relaxed);
                self.write_failures
                    .store(persisted.write_failures, Ordering::Relaxed);
                self.cleanup_errors
                    .store(persisted.cleanup_errors, Ordering::Relaxed);
                *self.recent.get_mut().unwrap_or_else(|p| p.into_inner()) =
                    persisted.recent.into_iter().collect();
            }
        }
        Ok(())
    }
}

impl Default for DiagnosticsLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of the counters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsStats {
    pub ticks: u64,
    pub records_written: u64,
    pub no_data_ticks: u64,
    pub failed_ticks: u64,
    pub write_failures: u64,
    pub cleanup_errors: u64,
    pub run_start: DateTime<Utc>,
    pub run_duration_secs: u64,
}

/// On-disk format.
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedDiagnostics {
    pub ticks: u64,
    pub records_written: u64,
    pub no_data_ticks: u64,
    pub failed_ticks: u64,
    pub write_failures: u64,
    pub cleanup_errors: u64,
    #[serde(default)]
    pub recent: Vec<DiagnosticEntry>,
    pub last_updated: DateTime<Utc>,
}

/// Thread-safe shared diagnostics log.
pub type SharedDiagnostics = Arc<DiagnosticsLog>;

pub fn create_shared_log() -> SharedDiagnostics {
    Arc::new(DiagnosticsLog::new())
}

pub fn create_shared_log_with_persistence(path: PathBuf) -> SharedDiagnostics {
    Arc::new(DiagnosticsLog::with_persistence(path))
}
