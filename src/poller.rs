//! Fixed-interval scheduler driving the acquisition pipeline.
//!
//! A [`TickDriver`] owns everything one tick touches: the feature source,
//! the deriver, the recording sink and the outputs. A [`Poller`] moves the
//! driver onto a worker thread while armed and hands it back on disarm, so
//! the owner can close the sink and the session after the last tick.
//!
//! ```text
//!  ┌──────────────┐  acquire   ┌──────────┐  derive  ┌────────────────┐
//!  │ FeatureSource│──────────▶│  Bands   │────────▶│ FeatureRecord  │
//!  │ session/http │            └──────────┘          └───────┬────────┘
//!  └──────────────┘                                          │
//!                       ┌──────────────┬─────────────────────┤
//!                       ▼              ▼                     ▼
//!                 RecordingSession  subscribers          LatestSlot
//! ```

use crate::core::{BandPowerExtractor, BandPowers, ExtractionError, FeatureDeriver, FeatureRecord};
use crate::diagnostics::{DiagnosticKind, SharedDiagnostics};
use crate::recording::RecordingSession;
use crate::remote::TransportError;
use crate::session::{Session, SessionConfig, SessionError, SessionState};
use chrono::{DateTime, Utc};
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Default feature polling interval.
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Channels reported in per-channel averages.
pub const MAX_RAW_CHANNELS: usize = 8;

/// Consecutive failed re-opens after which a failed session is left alone.
pub const MAX_REOPEN_ATTEMPTS: u32 = 3;

/// Why a single tick produced nothing.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TickError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Extraction(#[from] ExtractionError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl TickError {
    pub fn kind(&self) -> DiagnosticKind {
        match self {
            TickError::Session(_) => DiagnosticKind::Session,
            TickError::Extraction(_) => DiagnosticKind::Extraction,
            TickError::Transport(_) => DiagnosticKind::Transport,
        }
    }
}

/// What a tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Recorded(FeatureRecord),
    NoData,
    Failed(TickError),
}

/// Output of one acquisition step.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Acquired {
    /// `None` when nothing new arrived since the previous tick
    pub bands: Option<BandPowers>,
    /// Averages of the raw window, first channels only
    pub channel_means: Vec<f64>,
}

/// Something the poller can pull band powers from each tick.
pub trait FeatureSource: Send {
    fn acquire(&mut self) -> Result<Acquired, TickError>;

    /// Release the source. Returns the errors swallowed on the way.
    fn shutdown(&mut self) -> Vec<String>;
}

/// Local board: raw samples from a [`Session`], band powers computed here.
///
/// With [`with_reopen`](Self::with_reopen), a session that failed is
/// re-opened on the next tick, up to [`MAX_REOPEN_ATTEMPTS`] times in a row.
pub struct SessionSource {
    session: Session,
    extractor: BandPowerExtractor,
    reopen: Option<SessionConfig>,
    reopen_attempts: u32,
}

impl SessionSource {
    pub fn new(session: Session, extractor: BandPowerExtractor) -> Self {
        Self {
            session,
            extractor,
            reopen: None,
            reopen_attempts: 0,
        }
    }

    /// Re-open failed sessions from `config`.
    pub fn with_reopen(mut self, config: SessionConfig) -> Self {
        self.reopen = Some(config);
        self
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn reopen(&mut self) -> Result<(), TickError> {
        let Some(config) = &self.reopen else {
            return Ok(());
        };
        if self.reopen_attempts >= MAX_REOPEN_ATTEMPTS {
            return Ok(());
        }
        self.reopen_attempts += 1;
        let attempt = self.reopen_attempts;

        for e in self.session.close() {
            tracing::warn!(error = %e, "Cleanup error closing failed session");
        }

        let result = Session::open(config).and_then(|mut session| {
            if session.sampling_rate() != self.extractor.sampling_rate() {
                return Err(SessionError::InvalidConfig(format!(
                    "board came back at {} Hz, expected {} Hz",
                    session.sampling_rate(),
                    self.extractor.sampling_rate()
                )));
            }
            session.start()?;
            Ok(session)
        });

        match result {
            Ok(session) => {
                tracing::info!(attempt, "Session re-opened");
                self.session = session;
                Ok(())
            }
            Err(e) => {
                if attempt >= MAX_REOPEN_ATTEMPTS {
                    tracing::error!(attempt, error = %e, "Giving up re-opening session");
                } else {
                    tracing::warn!(attempt, error = %e, "Re-opening session failed");
                }
                Err(e.into())
            }
        }
    }
}

impl FeatureSource for SessionSource {
    fn acquire(&mut self) -> Result<Acquired, TickError> {
        if self.session.state() == SessionState::Failed {
            self.reopen()?;
        }
        let window = self.session.poll_raw()?;
        self.reopen_attempts = 0;
        let channel_means = window.channel_means(MAX_RAW_CHANNELS);

        let bands = match self.extractor.extract(&window) {
            Ok(bands) => Some(bands),
            Err(ExtractionError::InsufficientSamples) => None,
            Err(e) => return Err(e.into()),
        };

        Ok(Acquired {
            bands,
            channel_means,
        })
    }

    fn shutdown(&mut self) -> Vec<String> {
        self.session
            .close()
            .into_iter()
            .map(|e| e.to_string())
            .collect()
    }
}

/// Remote feature server: band powers arrive already extracted.
#[cfg(feature = "remote")]
pub struct RemoteSource {
    client: crate::remote::BlockingRemoteClient,
}

#[cfg(feature = "remote")]
impl RemoteSource {
    pub fn new(client: crate::remote::BlockingRemoteClient) -> Self {
        Self { client }
    }
}

#[cfg(feature = "remote")]
impl FeatureSource for RemoteSource {
    fn acquire(&mut self) -> Result<Acquired, TickError> {
        let bands = self.client.fetch_band_powers()?;
        Ok(Acquired {
            bands,
            channel_means: Vec::new(),
        })
    }

    fn shutdown(&mut self) -> Vec<String> {
        Vec::new()
    }
}

/// Video frame counter shared with an external video writer.
///
/// The writer advances it once per frame; each tick samples it.
#[derive(Debug, Clone, Default)]
pub struct FrameCounter(Arc<AtomicU64>);

impl FrameCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one frame. Returns the new index.
    pub fn advance(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Last value published by the poller.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LatestValue {
    #[default]
    NoData,
    Record {
        record: FeatureRecord,
        channel_means: Vec<f64>,
    },
    Error(String),
}

/// Single-writer slot readers take copies from.
#[derive(Debug, Clone, Default)]
pub struct LatestSlot(Arc<RwLock<LatestValue>>);

impl LatestSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, value: LatestValue) {
        *self.0.write().unwrap_or_else(|p| p.into_inner()) = value;
    }

    pub fn snapshot(&self) -> LatestValue {
        self.0.read().unwrap_or_else(|p| p.into_inner()).clone()
    }
}

/// Runs ticks against one source and fans the results out.
pub struct TickDriver {
    source: Box<dyn FeatureSource>,
    deriver: FeatureDeriver,
    sink: Option<RecordingSession>,
    frames: Option<FrameCounter>,
    subscribers: Vec<Sender<FeatureRecord>>,
    latest: Option<LatestSlot>,
    diagnostics: SharedDiagnostics,
    ticks: u64,
    last_timestamp: Option<DateTime<Utc>>,
    shut_down: bool,
}

impl TickDriver {
    pub fn new(
        source: Box<dyn FeatureSource>,
        deriver: FeatureDeriver,
        diagnostics: SharedDiagnostics,
    ) -> Self {
        Self {
            source,
            deriver,
            sink: None,
            frames: None,
            subscribers: Vec::new(),
            latest: None,
            diagnostics,
            ticks: 0,
            last_timestamp: None,
            shut_down: false,
        }
    }

    /// Persist every record to `sink`.
    pub fn with_sink(mut self, sink: RecordingSession) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Stamp records with the current value of `frames`.
    pub fn with_frame_counter(mut self, frames: FrameCounter) -> Self {
        self.frames = Some(frames);
        self
    }

    /// Publish every outcome to `latest`.
    pub fn with_latest(mut self, latest: LatestSlot) -> Self {
        self.latest = Some(latest);
        self
    }

    /// Add a live consumer. Records are dropped for it when its queue is full.
    pub fn subscribe(&mut self, capacity: usize) -> Receiver<FeatureRecord> {
        let (tx, rx) = bounded(capacity.max(1));
        self.subscribers.push(tx);
        rx
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn sink(&self) -> Option<&RecordingSession> {
        self.sink.as_ref()
    }

    /// Run one acquisition, derivation and persistence cycle.
    ///
    /// Never fails: every error is logged, counted and returned as
    /// [`TickOutcome::Failed`].
    pub fn tick(&mut self) -> TickOutcome {
        self.ticks += 1;
        let tick = self.ticks;
        self.diagnostics.record_tick();

        let acquired = match self.source.acquire() {
            Ok(acquired) => acquired,
            Err(e) => {
                tracing::warn!(tick, kind = ?e.kind(), error = %e, "Tick skipped");
                self.diagnostics
                    .record_tick_failure(tick, e.kind(), e.to_string());
                if let Some(latest) = &self.latest {
                    latest.publish(LatestValue::Error(e.to_string()));
                }
                return TickOutcome::Failed(e);
            }
        };

        let Some(bands) = acquired.bands else {
            tracing::debug!(tick, "No new samples");
            self.diagnostics.record_no_data();
            // Readers must not see the previous record as current.
            if let Some(latest) = &self.latest {
                latest.publish(LatestValue::NoData);
            }
            return TickOutcome::NoData;
        };

        let frame_index = self.frames.as_ref().map(FrameCounter::current);
        let timestamp = self.next_timestamp();
        let record = self.deriver.derive(bands, timestamp, tick, frame_index);

        if let Some(sink) = self.sink.as_mut() {
            match sink.write(&record) {
                Ok(()) => self.diagnostics.record_written(),
                Err(e) => {
                    tracing::error!(
                        tick,
                        path = %sink.path().display(),
                        error = %e,
                        "Record was not persisted"
                    );
                    self.diagnostics.record_write_failure(tick, e.to_string());
                }
            }
        }

        self.subscribers
            .retain(|tx| match tx.try_send(record.clone()) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(tick, "Live consumer is lagging; record dropped for it");
                    true
                }
                Err(TrySendError::Disconnected(_)) => false,
            });

        if let Some(latest) = &self.latest {
            latest.publish(LatestValue::Record {
                record: record.clone(),
                channel_means: acquired.channel_means,
            });
        }

        tracing::debug!(tick, focus = record.focus, "Tick recorded");
        TickOutcome::Recorded(record)
    }

    /// Wall clock, clamped so timestamps never go backwards.
    fn next_timestamp(&mut self) -> DateTime<Utc> {
        let now = Utc::now();
        let timestamp = match self.last_timestamp {
            Some(last) if now < last => last,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        timestamp
    }

    /// Close the sink, then release the source. Later calls do nothing.
    ///
    /// Secondary errors are logged and counted, never returned.
    pub fn shutdown(&mut self) {
        if self.shut_down {
            return;
        }
        self.shut_down = true;

        if let Some(sink) = self.sink.as_mut() {
            let rows = sink.rows_written();
            match sink.close() {
                Ok(()) => tracing::info!(
                    path = %sink.path().display(),
                    rows,
                    "Recording closed"
                ),
                Err(e) => {
                    tracing::warn!(error = %e, "Error closing recording");
                    self.diagnostics.record_cleanup_error(e.to_string());
                }
            }
        }

        for message in self.source.shutdown() {
            tracing::warn!(error = %message, "Error releasing source");
            self.diagnostics.record_cleanup_error(message);
        }
    }
}

/// Whether the poller is ticking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerState {
    Idle,
    Armed,
}

struct Worker {
    stop_tx: Sender<()>,
    handle: JoinHandle<TickDriver>,
}

/// Thread-based fixed-interval scheduler.
pub struct Poller {
    interval: Duration,
    driver: Option<TickDriver>,
    worker: Option<Worker>,
}

impl Poller {
    pub fn new(driver: TickDriver, interval: Duration) -> Self {
        Self {
            interval,
            driver: Some(driver),
            worker: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn state(&self) -> PollerState {
        if self.worker.is_some() {
            PollerState::Armed
        } else {
            PollerState::Idle
        }
    }

    /// Start ticking once per interval. Does nothing when already armed.
    ///
    /// The first tick runs one interval after arming.
    pub fn arm(&mut self) -> std::io::Result<()> {
        if self.worker.is_some() {
            return Ok(());
        }
        let Some(mut driver) = self.driver.take() else {
            tracing::warn!("Poller has no pipeline left to drive");
            return Ok(());
        };

        let interval = self.interval;
        let (stop_tx, stop_rx) = bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("poller".to_string())
            .spawn(move || {
                let mut next = Instant::now() + interval;
                loop {
                    let wait = next.saturating_duration_since(Instant::now());
                    match stop_rx.recv_timeout(wait) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }

                    driver.tick();

                    next += interval;
                    let now = Instant::now();
                    if next < now {
                        tracing::debug!("Tick overran its interval");
                        next = now;
                    }
                }
                driver
            })?;

        self.worker = Some(Worker { stop_tx, handle });
        tracing::info!(interval_ms = interval.as_millis() as u64, "Poller armed");
        Ok(())
    }

    /// Stop ticking. The in-flight tick finishes before this returns.
    pub fn disarm(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        let _ = worker.stop_tx.send(());
        match worker.handle.join() {
            Ok(driver) => {
                tracing::info!(ticks = driver.ticks(), "Poller disarmed");
                self.driver = Some(driver);
            }
            Err(_) => tracing::error!("Poller worker panicked; pipeline was dropped"),
        }
    }

    /// The pipeline, when not armed.
    pub fn driver(&self) -> Option<&TickDriver> {
        self.driver.as_ref()
    }

    pub fn driver_mut(&mut self) -> Option<&mut TickDriver> {
        self.driver.as_mut()
    }

    /// Disarm and give the pipeline back.
    pub fn into_driver(mut self) -> Option<TickDriver> {
        self.disarm();
        self.driver.take()
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.disarm();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChannelGrouping, FocusFormula};
    use crate::diagnostics::create_shared_log;
    use crate::recording::{read_recording, Precision, RecordLayout};
    use crate::session::SyntheticBoard;
    use crate::session::tests::ScriptedBoard;
    use crate::session::types::RawSampleWindow;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Source replaying canned results; counts shutdown calls.
    struct CannedSource {
        results: VecDeque<Result<Acquired, TickError>>,
        shutdowns: Arc<Mutex<u32>>,
    }

    impl CannedSource {
        fn new(results: Vec<Result<Acquired, TickError>>) -> Self {
            Self {
                results: results.into(),
                shutdowns: Arc::new(Mutex::new(0)),
            }
        }
    }

    impl FeatureSource for CannedSource {
        fn acquire(&mut self) -> Result<Acquired, TickError> {
            self.results.pop_front().unwrap_or_else(|| Ok(Acquired::default()))
        }

        fn shutdown(&mut self) -> Vec<String> {
            *self.shutdowns.lock().unwrap() += 1;
            vec!["board already gone".to_string()]
        }
    }

    fn bands(values: [f64; 5]) -> Acquired {
        Acquired {
            bands: Some(BandPowers::from_vector(&values).unwrap()),
            channel_means: vec![0.5, -0.5],
        }
    }

    fn layout() -> RecordLayout {
        RecordLayout {
            frame_index: false,
            relaxation: true,
            formula: FocusFormula::V1,
            precision: Precision::default(),
        }
    }

    #[test]
    fn test_success_tick_writes_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSession::create(dir.path(), layout()).unwrap();
        let path = sink.path().to_path_buf();
        let diagnostics = create_shared_log();

        let source = CannedSource::new(vec![Ok(bands([1.0, 2.0, 3.0, 4.0, 5.0]))]);
        let mut driver = TickDriver::new(
            Box::new(source),
            FeatureDeriver::default(),
            diagnostics.clone(),
        )
        .with_sink(sink);

        let TickOutcome::Recorded(record) = driver.tick() else {
            panic!("expected a record");
        };
        assert!((record.focus - 4.0 / 6.0).abs() < 1e-12);
        assert_eq!(record.relaxation, Some(0.5));

        driver.shutdown();
        let rows = read_recording(&path).unwrap();
        assert_eq!(rows.len(), 1);
        assert!((rows[0].focus - 0.67).abs() < 1e-9);
        assert_eq!(diagnostics.stats().records_written, 1);
    }

    #[test]
    fn test_no_data_tick_leaves_sink_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let sink = RecordingSession::create(dir.path(), layout()).unwrap();
        let diagnostics = create_shared_log();
        let latest = LatestSlot::new();

        let source = CannedSource::new(vec![
            Ok(Acquired::default()),
            Ok(bands([1.0, 1.0, 1.0, 1.0, 1.0])),
        ]);
        let mut driver = TickDriver::new(
            Box::new(source),
            FeatureDeriver::default(),
            diagnostics.clone(),
        )
        .with_sink(sink)
        .with_latest(latest.clone());

        assert_eq!(driver.tick(), TickOutcome::NoData);
        assert_eq!(driver.sink().unwrap().rows_written(), 0);
        assert_eq!(latest.snapshot(), LatestValue::NoData);

        assert!(matches!(driver.tick(), TickOutcome::Recorded(_)));
        assert_eq!(driver.sink().unwrap().rows_written(), 1);
        assert_eq!(diagnostics.stats().no_data_ticks, 1);
    }

    #[test]
    fn test_silent_source_clears_latest_record() {
        let latest = LatestSlot::new();
        let source = CannedSource::new(vec![Ok(bands([1.0, 2.0, 3.0, 4.0, 5.0]))]);
        let mut driver = TickDriver::new(
            Box::new(source),
            FeatureDeriver::default(),
            create_shared_log(),
        )
        .with_latest(latest.clone());

        assert!(matches!(driver.tick(), TickOutcome::Recorded(_)));
        assert!(matches!(latest.snapshot(), LatestValue::Record { .. }));

        for _ in 0..10 {
            assert_eq!(driver.tick(), TickOutcome::NoData);
            assert_eq!(latest.snapshot(), LatestValue::NoData);
        }
    }

    #[test]
    fn test_failed_tick_is_logged_and_next_tick_runs() {
        let diagnostics = create_shared_log();
        let latest = LatestSlot::new();
        let source = CannedSource::new(vec![
            Err(TransportError::ServerReported("timeout".to_string()).into()),
            Ok(bands([1.0, 2.0, 3.0, 4.0, 5.0])),
        ]);
        let mut driver = TickDriver::new(
            Box::new(source),
            FeatureDeriver::default(),
            diagnostics.clone(),
        )
        .with_latest(latest.clone());

        assert!(matches!(
            driver.tick(),
            TickOutcome::Failed(TickError::Transport(_))
        ));
        assert!(matches!(latest.snapshot(), LatestValue::Error(m) if m.contains("timeout")));

        let recent = diagnostics.recent();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].kind, DiagnosticKind::Transport);
        assert_eq!(recent[0].tick, Some(1));

        assert!(matches!(driver.tick(), TickOutcome::Recorded(_)));
        assert!(matches!(latest.snapshot(), LatestValue::Record { .. }));
        assert_eq!(diagnostics.stats().failed_ticks, 1);
        assert_eq!(driver.ticks(), 2);
    }

    #[test]
    fn test_timestamps_never_decrease() {
        let results = (0..20)
            .map(|_| Ok(bands([1.0, 2.0, 3.0, 4.0, 5.0])))
            .collect();
        let mut driver = TickDriver::new(
            Box::new(CannedSource::new(results)),
            FeatureDeriver::default(),
            create_shared_log(),
        );

        let mut last = None;
        for expected_tick in 1..=20 {
            let TickOutcome::Recorded(record) = driver.tick() else {
                panic!("expected a record");
            };
            assert_eq!(record.tick, expected_tick);
            if let Some(last) = last {
                assert!(record.timestamp >= last);
            }
            last = Some(record.timestamp);
        }
    }

    #[test]
    fn test_frame_counter_is_sampled() {
        let frames = FrameCounter::new();
        let mut driver = TickDriver::new(
            Box::new(CannedSource::new(vec![
                Ok(bands([1.0; 5])),
                Ok(bands([1.0; 5])),
            ])),
            FeatureDeriver::default(),
            create_shared_log(),
        )
        .with_frame_counter(frames.clone());

        frames.advance();
        frames.advance();
        let TickOutcome::Recorded(first) = driver.tick() else {
            panic!("expected a record");
        };
        assert_eq!(first.frame_index, Some(2));

        assert_eq!(frames.advance(), 3);
        let TickOutcome::Recorded(second) = driver.tick() else {
            panic!("expected a record");
        };
        assert_eq!(second.frame_index, Some(3));
    }

    #[test]
    fn test_lagging_subscriber_never_blocks() {
        let results = (0..5).map(|_| Ok(bands([1.0; 5]))).collect();
        let mut driver = TickDriver::new(
            Box::new(CannedSource::new(results)),
            FeatureDeriver::default(),
            create_shared_log(),
        );
        let rx = driver.subscribe(2);

        for _ in 0..5 {
            assert!(matches!(driver.tick(), TickOutcome::Recorded(_)));
        }
        let received: Vec<_> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert_eq!(received[0].tick, 1);
    }

    #[test]
    fn test_shutdown_is_idempotent_and_swallows_errors() {
        let diagnostics = create_shared_log();
        let source = CannedSource::new(vec![]);
        let shutdowns = source.shutdowns.clone();
        let mut driver = TickDriver::new(
            Box::new(source),
            FeatureDeriver::default(),
            diagnostics.clone(),
        );

        driver.shutdown();
        driver.shutdown();
        assert_eq!(*shutdowns.lock().unwrap(), 1);
        assert_eq!(diagnostics.stats().cleanup_errors, 1);
    }

    #[test]
    fn test_session_source_maps_empty_window_to_no_data() {
        let window = SyntheticBoard::generate(2, 250, 0, 250);
        let board = ScriptedBoard::new(vec![
            Ok(RawSampleWindow::empty(2)),
            Ok(window),
            Err(SessionError::MalformedFrame("bad packet".to_string())),
        ]);
        let mut session = Session::with_driver(Box::new(board), Duration::from_secs(1)).unwrap();
        session.start().unwrap();
        let extractor =
            BandPowerExtractor::new(250, vec![0, 1], ChannelGrouping::PerChannel).unwrap();
        let mut source = SessionSource::new(session, extractor);

        let first = source.acquire().unwrap();
        assert!(first.bands.is_none());

        let second = source.acquire().unwrap();
        assert!(second.bands.is_some());
        assert_eq!(second.channel_means.len(), 2);

        assert!(matches!(
            source.acquire(),
            Err(TickError::Session(SessionError::MalformedFrame(_)))
        ));

        assert!(source.shutdown().is_empty());
        assert!(source.session().is_closed());
    }

    fn scripted_source(
        reads: Vec<Result<RawSampleWindow, SessionError>>,
    ) -> (SessionSource, Arc<Mutex<Vec<&'static str>>>) {
        let board = ScriptedBoard::new(reads);
        let calls = board.calls.clone();
        let mut session = Session::with_driver(Box::new(board), Duration::from_secs(1)).unwrap();
        session.start().unwrap();
        let extractor =
            BandPowerExtractor::new(250, vec![0, 1], ChannelGrouping::PerChannel).unwrap();
        (SessionSource::new(session, extractor), calls)
    }

    #[test]
    fn test_failed_session_is_reopened() {
        let (source, calls) =
            scripted_source(vec![Err(SessionError::Disconnected("cable pulled".to_string()))]);
        let mut source = source.with_reopen(SessionConfig {
            kind: crate::session::ConnectionKind::Synthetic,
            channel_count: 2,
            sampling_rate: 250,
            ..SessionConfig::default()
        });

        assert!(matches!(
            source.acquire(),
            Err(TickError::Session(SessionError::Disconnected(_)))
        ));
        assert_eq!(source.session().state(), SessionState::Failed);

        source.acquire().unwrap();
        assert_eq!(source.session().state(), SessionState::Streaming);
        assert!(calls.lock().unwrap().contains(&"release"));

        std::thread::sleep(Duration::from_millis(100));
        assert!(source.acquire().unwrap().bands.is_some());
    }

    #[test]
    fn test_reopen_attempts_are_bounded() {
        let (source, _) =
            scripted_source(vec![Err(SessionError::Disconnected("cable pulled".to_string()))]);
        // Remote endpoints cannot back a session, so every re-open fails.
        let mut source = source.with_reopen(SessionConfig {
            kind: crate::session::ConnectionKind::RemoteHttp,
            ..SessionConfig::default()
        });

        assert!(source.acquire().is_err());
        for _ in 0..MAX_REOPEN_ATTEMPTS {
            assert!(matches!(
                source.acquire(),
                Err(TickError::Session(SessionError::InvalidConfig(_)))
            ));
        }
        assert!(matches!(
            source.acquire(),
            Err(TickError::Session(SessionError::InvalidState {
                state: SessionState::Failed,
                ..
            }))
        ));
    }

    #[test]
    fn test_poller_arm_disarm() {
        let results = (0..1000).map(|_| Ok(bands([1.0; 5]))).collect();
        let driver = TickDriver::new(
            Box::new(CannedSource::new(results)),
            FeatureDeriver::default(),
            create_shared_log(),
        );
        let mut poller = Poller::new(driver, Duration::from_millis(10));
        assert_eq!(poller.state(), PollerState::Idle);

        poller.arm().unwrap();
        poller.arm().unwrap();
        assert_eq!(poller.state(), PollerState::Armed);
        assert!(poller.driver().is_none());

        std::thread::sleep(Duration::from_millis(100));
        poller.disarm();
        assert_eq!(poller.state(), PollerState::Idle);

        let ticks = poller.driver().unwrap().ticks();
        assert!(ticks >= 1, "expected ticks, got {ticks}");

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(poller.driver().unwrap().ticks(), ticks);

        poller.disarm();
        let driver = poller.into_driver().unwrap();
        assert_eq!(driver.ticks(), ticks);
    }

    #[test]
    fn test_poller_can_be_rearmed() {
        let driver = TickDriver::new(
            Box::new(CannedSource::new(vec![])),
            FeatureDeriver::default(),
            create_shared_log(),
        );
        let mut poller = Poller::new(driver, Duration::from_millis(5));
        poller.arm().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        poller.disarm();
        let first = poller.driver().unwrap().ticks();

        poller.arm().unwrap();
        std::thread::sleep(Duration::from_millis(30));
        poller.disarm();
        assert!(poller.driver().unwrap().ticks() > first);
    }
}
