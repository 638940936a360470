//! Start/stop control over one acquisition run.
//!
//! [`Acquisition`] opens the configured source, creates the recording,
//! arms the poller and, on stop, tears everything down in order: the
//! in-flight tick completes, the recording is closed, then the session.

use crate::config::Config;
use crate::core::{BandPowerExtractor, ExtractionError, FeatureDeriver, FeatureRecord};
use crate::diagnostics::SharedDiagnostics;
use crate::poller::{
    FeatureSource, FrameCounter, LatestSlot, LatestValue, Poller, SessionSource, TickDriver,
};
use crate::recording::{PersistenceError, RecordLayout, RecordingSession};
use crate::remote::TransportError;
use crate::session::{ConnectionKind, Session, SessionError};
use crossbeam_channel::Receiver;
use std::path::{Path, PathBuf};

/// Records buffered for the live consumer before new ones are dropped.
const LIVE_FEED_CAPACITY: usize = 64;

/// Failures that prevent a run from starting.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
    #[error("cannot start poller thread: {0}")]
    Worker(#[source] std::io::Error),
}

/// Owner of one acquisition run.
pub struct Acquisition {
    config: Config,
    diagnostics: SharedDiagnostics,
    latest: LatestSlot,
    frames: Option<FrameCounter>,
    record: bool,
    poller: Option<Poller>,
    live_feed: Option<Receiver<FeatureRecord>>,
    recording_path: Option<PathBuf>,
}

impl Acquisition {
    pub fn new(config: Config, diagnostics: SharedDiagnostics) -> Self {
        Self {
            config,
            diagnostics,
            latest: LatestSlot::new(),
            frames: None,
            record: true,
            poller: None,
            live_feed: None,
            recording_path: None,
        }
    }

    /// Add a `frame_index` column sampled from `frames`.
    pub fn with_frame_counter(mut self, frames: FrameCounter) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Serve features without writing a recording.
    pub fn without_recording(mut self) -> Self {
        self.record = false;
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Slot holding the latest record, for the feature server.
    pub fn latest(&self) -> LatestSlot {
        self.latest.clone()
    }

    /// Records as they are produced, while running.
    pub fn live_feed(&self) -> Option<&Receiver<FeatureRecord>> {
        self.live_feed.as_ref()
    }

    /// File of the current or most recent recording.
    pub fn recording_path(&self) -> Option<&Path> {
        self.recording_path.as_deref()
    }

    pub fn is_running(&self) -> bool {
        self.poller.is_some()
    }

    /// Open the source and start ticking. Does nothing when already running.
    pub fn start(&mut self) -> Result<(), AcquisitionError> {
        if self.poller.is_some() {
            return Ok(());
        }

        let source = self.open_source()?;

        let mut driver = TickDriver::new(
            source,
            FeatureDeriver::new(self.config.focus_formula, self.config.emit_relaxation),
            self.diagnostics.clone(),
        )
        .with_latest(self.latest.clone());

        if self.record {
            let layout = RecordLayout {
                frame_index: self.frames.is_some(),
                relaxation: self.config.emit_relaxation,
                formula: self.config.focus_formula,
                precision: self.config.precision,
            };
            std::fs::create_dir_all(&self.config.recording_path).map_err(PersistenceError::from)?;
            let sink = RecordingSession::create(&self.config.recording_path, layout)?;
            tracing::info!(path = %sink.path().display(), "Recording to file");
            self.recording_path = Some(sink.path().to_path_buf());
            driver = driver.with_sink(sink);
        }

        if let Some(frames) = &self.frames {
            driver = driver.with_frame_counter(frames.clone());
        }

        let live_feed = driver.subscribe(LIVE_FEED_CAPACITY);
        self.latest.publish(LatestValue::NoData);

        let mut poller = Poller::new(driver, self.config.tick_interval);
        poller.arm().map_err(AcquisitionError::Worker)?;

        self.poller = Some(poller);
        self.live_feed = Some(live_feed);
        tracing::info!(kind = ?self.config.session.kind, "Acquisition started");
        Ok(())
    }

    fn open_source(&self) -> Result<Box<dyn FeatureSource>, AcquisitionError> {
        let session_config = &self.config.session;

        if session_config.kind == ConnectionKind::RemoteHttp {
            return self.open_remote();
        }

        let mut session = Session::open(session_config)?;
        let description = session.description();

        let channels = session_config.analysed_channels();
        if let Some(&channel) = channels.iter().find(|&&c| c >= description.channel_count) {
            return Err(ExtractionError::ChannelOutOfRange {
                channel,
                available: description.channel_count,
            }
            .into());
        }

        let extractor = BandPowerExtractor::new(
            session.sampling_rate(),
            channels,
            self.config.channel_grouping,
        )?;
        session.start()?;

        Ok(Box::new(
            SessionSource::new(session, extractor).with_reopen(session_config.clone()),
        ))
    }

    #[cfg(feature = "remote")]
    fn open_remote(&self) -> Result<Box<dyn FeatureSource>, AcquisitionError> {
        use crate::remote::{BlockingRemoteClient, RemoteConfig};

        let session_config = &self.config.session;
        let remote = RemoteConfig::new(
            session_config.address.clone(),
            session_config.port,
            self.config.remote_timeout,
        );
        let client = BlockingRemoteClient::new(remote)?;

        match client.test_connection() {
            Ok(true) => tracing::info!(url = %client.config().url(), "Remote feature server reachable"),
            Ok(false) | Err(_) => tracing::warn!(
                url = %client.config().url(),
                "Remote feature server not answering yet; ticks will be skipped until it does"
            ),
        }

        Ok(Box::new(crate::poller::RemoteSource::new(client)))
    }

    #[cfg(not(feature = "remote"))]
    fn open_remote(&self) -> Result<Box<dyn FeatureSource>, AcquisitionError> {
        Err(SessionError::InvalidConfig(
            "remote-http sources need the `remote` feature".to_string(),
        )
        .into())
    }

    /// Stop ticking, then close the recording and the source.
    ///
    /// Safe to call when not running. Cleanup errors are logged, not returned.
    pub fn stop(&mut self) {
        let Some(poller) = self.poller.take() else {
            return;
        };
        self.live_feed = None;

        if let Some(mut driver) = poller.into_driver() {
            driver.shutdown();
        }

        if let Err(e) = self.diagnostics.save() {
            tracing::warn!(error = %e, "Could not save diagnostics");
        }
        tracing::info!("Acquisition stopped");
    }
}

impl Drop for Acquisition {
    fn drop(&mut self) {
        self.stop();
    }
}
