//! Diagnostics for the acquisition pipeline.
//!
//! Every skipped or failed tick and every swallowed cleanup error ends up
//! here as a structured entry, alongside running counters that survive
//! restarts.

pub mod log;

// Re-export commonly used types
pub use log::{
    create_shared_log, create_shared_log_with_persistence, DiagnosticEntry, DiagnosticKind,
    DiagnosticsLog, DiagnosticsStats, PersistedDiagnostics, SharedDiagnostics,
};
