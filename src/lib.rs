//! NeuroFocus Agent - band-power focus features from biosignal boards.
//!
//! This library acquires raw samples from an EEG-style board, turns them
//! into band powers and a focus index once per tick, and records every tick
//! to CSV next to an optional video frame index.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                         NeuroFocus Agent                          │
//! ├───────────────────────────────────────────────────────────────────┤
//! │  ┌───────────┐   ┌─────────────┐   ┌─────────────┐                │
//! │  │  Session  │──▶│  Band-power │──▶│   Feature   │                │
//! │  │ (board)   │   │  Extractor  │   │   Deriver   │                │
//! │  └───────────┘   └─────────────┘   └──────┬──────┘                │
//! │        ▲                                  │                       │
//! │        │ tick every 1s                    ├──▶ Recording (CSV)    │
//! │  ┌───────────┐                            ├──▶ live display       │
//! │  │  Poller   │                            └──▶ /data server       │
//! │  └───────────┘                                                    │
//! └───────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A display process without board access can instead poll another
//! agent's `/data` endpoint; the poller then skips extraction.
//!
//! # Example
//!
//! ```no_run
//! use neurofocus_agent::{Acquisition, Config, ConnectionKind};
//! use neurofocus_agent::diagnostics::create_shared_log;
//!
//! let mut config = Config::default();
//! config.session.kind = ConnectionKind::Synthetic;
//!
//! let mut acquisition = Acquisition::new(config, create_shared_log());
//! acquisition.start().expect("Failed to start acquisition");
//!
//! // Records arrive on acquisition.live_feed() once per tick
//! acquisition.stop();
//! ```

pub mod acquisition;
pub mod config;
pub mod core;
pub mod diagnostics;
pub mod poller;
pub mod recording;
pub mod remote;
pub mod session;

#[cfg(feature = "server")]
pub mod server;

// Re-export key types at crate root for convenience
pub use acquisition::{Acquisition, AcquisitionError};
pub use config::{Config, ConfigError};
pub use core::{
    BandPowerExtractor, BandPowers, ChannelGrouping, ExtractionError, FeatureDeriver,
    FeatureRecord, FocusFormula,
};
pub use diagnostics::{DiagnosticsLog, DiagnosticsStats, SharedDiagnostics};
pub use poller::{FrameCounter, LatestSlot, LatestValue, Poller, TickDriver, TickError, TickOutcome};
pub use recording::{PersistenceError, RecordLayout, RecordingSession};
pub use remote::{FeatureEnvelope, RemoteConfig, TransportError};
pub use session::{ConnectionKind, Session, SessionConfig, SessionError, SessionState};

#[cfg(feature = "remote")]
pub use remote::{BlockingRemoteClient, RemoteFeatureClient};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
