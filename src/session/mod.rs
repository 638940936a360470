//! Session handling for biosignal boards.
//!
//! A [`Session`] owns exactly one [`BoardDriver`] and walks it through the
//! prepare / stream / stop / release lifecycle. Drivers only know how to move
//! samples; the session enforces the state machine and makes shutdown safe
//! to repeat.

pub mod serial;
pub mod streamer;
pub mod synthetic;
pub mod types;

use serde::{Deserialize, Serialize};
use std::time::Duration;

pub use streamer::StreamerBoard;
pub use synthetic::SyntheticBoard;
pub use types::{BoardDescription, DropCounter, RawSampleWindow, SessionState};

#[cfg(feature = "serial")]
pub use serial::SerialBoard;

/// Serial device used when none is configured.
pub const DEFAULT_SERIAL_PORT: &str = "/dev/ttyUSB0";

/// Kind of endpoint a session connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionKind {
    /// Board attached to a local serial port
    LocalSerial,
    /// UDP streamer forwarding board samples
    NetworkStreamer,
    /// Remote feature server (band powers over HTTP, no raw samples)
    RemoteHttp,
    /// In-process generated signal
    Synthetic,
}

impl std::str::FromStr for ConnectionKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "serial" | "local-serial" => Ok(ConnectionKind::LocalSerial),
            "streamer" | "network-streamer" => Ok(ConnectionKind::NetworkStreamer),
            "remote" | "remote-http" => Ok(ConnectionKind::RemoteHttp),
            "synthetic" => Ok(ConnectionKind::Synthetic),
            other => Err(format!("unknown connection kind '{other}'")),
        }
    }
}

/// Where and how to open a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    pub kind: ConnectionKind,
    /// Serial port path, or host for network kinds
    pub address: String,
    /// UDP/HTTP port (ignored for serial and synthetic)
    pub port: u16,
    /// Baud rate for serial boards
    pub baud_rate: u32,
    /// Number of signal rows the board produces
    pub channel_count: usize,
    /// Sampling rate for boards that cannot report one themselves
    pub sampling_rate: u32,
    /// Channel rows to analyse; empty means all of them
    #[serde(default)]
    pub channels: Vec<usize>,
    /// How long the board may take to come up
    #[serde(with = "crate::config::duration_millis")]
    pub startup_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            kind: ConnectionKind::NetworkStreamer,
            address: "127.0.0.1".to_string(),
            port: 6677,
            baud_rate: 115_200,
            channel_count: 8,
            sampling_rate: 250,
            channels: Vec::new(),
            startup_timeout: Duration::from_secs(5),
        }
    }
}

impl SessionConfig {
    /// Socket address string for network kinds.
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.address, self.port)
    }

    /// Serial device path. A network host in `address` means none was given.
    pub fn serial_port(&self) -> &str {
        if self.address.is_empty() || self.address.parse::<std::net::IpAddr>().is_ok() {
            DEFAULT_SERIAL_PORT
        } else {
            &self.address
        }
    }

    /// Channel rows selected for analysis.
    pub fn analysed_channels(&self) -> Vec<usize> {
        if self.channels.is_empty() {
            (0..self.channel_count).collect()
        } else {
            self.channels.clone()
        }
    }
}

/// Errors raised by sessions and board drivers.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SessionError {
    #[error("could not connect to board: {0}")]
    ConnectFailed(String),
    #[error("invalid session config: {0}")]
    InvalidConfig(String),
    #[error("cannot {operation} while session is {state}")]
    InvalidState {
        operation: &'static str,
        state: SessionState,
    },
    #[error("stream error: {0}")]
    StreamFailed(String),
    #[error("board disconnected: {0}")]
    Disconnected(String),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("release failed: {0}")]
    ReleaseFailed(String),
}

impl SessionError {
    /// Errors after which the board cannot be used again without re-opening.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SessionError::Disconnected(_))
    }
}

/// A pluggable board backend.
///
/// Implementations must make `read_available` non-blocking and return an
/// empty window when nothing has arrived.
pub trait BoardDriver: Send {
    /// Bring the board up, waiting at most `startup_timeout`.
    fn prepare(&mut self, startup_timeout: Duration) -> Result<BoardDescription, SessionError>;

    /// Begin producing samples.
    fn start_stream(&mut self) -> Result<(), SessionError>;

    /// Drain everything buffered since the previous call.
    fn read_available(&mut self) -> Result<RawSampleWindow, SessionError>;

    /// Stop producing samples. The board stays prepared.
    fn stop_stream(&mut self) -> Result<(), SessionError>;

    /// Release the underlying device or socket.
    fn release(&mut self) -> Result<(), SessionError>;
}

/// An open connection to one board.
pub struct Session {
    driver: Box<dyn BoardDriver>,
    state: SessionState,
    description: BoardDescription,
    released: bool,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("state", &self.state)
            .field("description", &self.description)
            .field("released", &self.released)
            .finish()
    }
}

impl Session {
    /// Open a session for the configured endpoint.
    pub fn open(config: &SessionConfig) -> Result<Self, SessionError> {
        let driver: Box<dyn BoardDriver> = match config.kind {
            ConnectionKind::Synthetic => Box::new(SyntheticBoard::new(
                config.channel_count,
                config.sampling_rate,
            )),
            ConnectionKind::NetworkStreamer => Box::new(StreamerBoard::new(
                config.socket_addr(),
                config.channel_count,
                config.sampling_rate,
            )),
            #[cfg(feature = "serial")]
            ConnectionKind::LocalSerial => Box::new(SerialBoard::new(
                config.serial_port().to_string(),
                config.baud_rate,
                config.channel_count,
                config.sampling_rate,
            )),
            #[cfg(not(feature = "serial"))]
            ConnectionKind::LocalSerial => {
                return Err(SessionError::InvalidConfig(
                    "serial boards need the `serial` feature".to_string(),
                ))
            }
            ConnectionKind::RemoteHttp => {
                return Err(SessionError::InvalidConfig(
                    "remote-http endpoints deliver band powers; poll them with RemoteFeatureClient"
                        .to_string(),
                ))
            }
        };

        Self::with_driver(driver, config.startup_timeout)
    }

    /// Open a session on an already constructed driver.
    pub fn with_driver(
        mut driver: Box<dyn BoardDriver>,
        startup_timeout: Duration,
    ) -> Result<Self, SessionError> {
        let description = driver.prepare(startup_timeout)?;
        if description.sampling_rate == 0 {
            // Leave nothing half-open behind.
            if let Err(e) = driver.release() {
                tracing::warn!(error = %e, "Cleanup error releasing rejected board");
            }
            return Err(SessionError::InvalidConfig(
                "board reported a sampling rate of 0 Hz".to_string(),
            ));
        }

        tracing::info!(
            sampling_rate = description.sampling_rate,
            channels = description.channel_count,
            "Session prepared"
        );

        Ok(Self {
            driver,
            state: SessionState::Prepared,
            description,
            released: false,
        })
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Sampling rate reported by the board when the session was opened.
    pub fn sampling_rate(&self) -> u32 {
        self.description.sampling_rate
    }

    /// Board description captured at open time.
    pub fn description(&self) -> BoardDescription {
        self.description
    }

    /// Start streaming. Calling this while already streaming does nothing.
    pub fn start(&mut self) -> Result<(), SessionError> {
        match self.state {
            SessionState::Streaming => Ok(()),
            SessionState::Prepared | SessionState::Stopped if !self.released => {
                match self.driver.start_stream() {
                    Ok(()) => {
                        self.state = SessionState::Streaming;
                        tracing::info!("Session streaming");
                        Ok(())
                    }
                    Err(e) => {
                        if e.is_fatal() {
                            self.state = SessionState::Failed;
                        }
                        Err(e)
                    }
                }
            }
            state => Err(SessionError::InvalidState {
                operation: "start",
                state,
            }),
        }
    }

    /// Drain buffered samples without blocking.
    ///
    /// An empty window is returned when nothing new has arrived.
    pub fn poll_raw(&mut self) -> Result<RawSampleWindow, SessionError> {
        if self.state != SessionState::Streaming {
            return Err(SessionError::InvalidState {
                operation: "poll",
                state: self.state,
            });
        }

        match self.driver.read_available() {
            Ok(window) => Ok(window),
            Err(e) => {
                if e.is_fatal() {
                    tracing::error!(error = %e, "Session failed");
                    self.state = SessionState::Failed;
                }
                Err(e)
            }
        }
    }

    /// Stop streaming.
    ///
    /// Safe to call repeatedly and in the failed state. Errors are returned
    /// for the caller to log; they never abort the shutdown.
    pub fn stop(&mut self) -> Vec<SessionError> {
        let mut errors = Vec::new();
        match self.state {
            SessionState::Streaming => {
                if let Err(e) = self.driver.stop_stream() {
                    errors.push(e);
                }
                self.state = SessionState::Stopped;
            }
            SessionState::Failed if !self.released => {
                if let Err(e) = self.driver.stop_stream() {
                    errors.push(e);
                }
            }
            _ => {}
        }
        errors
    }

    /// Stop and release the board. Later calls are no-ops.
    pub fn close(&mut self) -> Vec<SessionError> {
        if self.released {
            return Vec::new();
        }
        let mut errors = self.stop();
        if let Err(e) = self.driver.release() {
            errors.push(e);
        }
        self.released = true;
        if self.state != SessionState::Failed {
            self.state = SessionState::Stopped;
        }
        tracing::info!(errors = errors.len(), "Session closed");
        errors
    }

    /// Whether `close` has already run.
    pub fn is_closed(&self) -> bool {
        self.released
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for e in self.close() {
            tracing::warn!(error = %e, "Session cleanup error on drop");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Driver replaying a fixed script of reads, recording lifecycle calls.
    pub(crate) struct ScriptedBoard {
        pub reads: VecDeque<Result<RawSampleWindow, SessionError>>,
        pub calls: Arc<Mutex<Vec<&'static str>>>,
        pub fail_release: bool,
        pub sampling_rate: u32,
    }

    impl ScriptedBoard {
        pub(crate) fn new(reads: Vec<Result<RawSampleWindow, SessionError>>) -> Self {
            Self {
                reads: reads.into(),
                calls: Arc::new(Mutex::new(Vec::new())),
                fail_release: false,
                sampling_rate: 250,
            }
        }
    }

    impl BoardDriver for ScriptedBoard {
        fn prepare(&mut self, _: Duration) -> Result<BoardDescription, SessionError> {
            self.calls.lock().unwrap().push("prepare");
            Ok(BoardDescription {
                sampling_rate: self.sampling_rate,
                channel_count: 2,
            })
        }

        fn start_stream(&mut self) -> Result<(), SessionError> {
            self.calls.lock().unwrap().push("start");
            Ok(())
        }

        fn read_available(&mut self) -> Result<RawSampleWindow, SessionError> {
            self.reads
                .pop_front()
                .unwrap_or_else(|| Ok(RawSampleWindow::empty(2)))
        }

        fn stop_stream(&mut self) -> Result<(), SessionError> {
            self.calls.lock().unwrap().push("stop");
            Ok(())
        }

        fn release(&mut self) -> Result<(), SessionError> {
            self.calls.lock().unwrap().push("release");
            if self.fail_release {
                Err(SessionError::ReleaseFailed("already unplugged".to_string()))
            } else {
                Ok(())
            }
        }
    }

    fn open_scripted(board: ScriptedBoard) -> Session {
        Session::with_driver(Box::new(board), Duration::from_secs(1)).unwrap()
    }

    #[test]
    fn test_open_prepares_session() {
        let session = open_scripted(ScriptedBoard::new(vec![]));
        assert_eq!(session.state(), SessionState::Prepared);
        assert_eq!(session.sampling_rate(), 250);
    }

    #[test]
    fn test_zero_sampling_rate_rejected() {
        let mut board = ScriptedBoard::new(vec![]);
        board.sampling_rate = 0;
        let result = Session::with_driver(Box::new(board), Duration::from_secs(1));
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
    }

    #[test]
    fn test_rejected_board_release_error_is_not_fatal() {
        let mut board = ScriptedBoard::new(vec![]);
        board.sampling_rate = 0;
        board.fail_release = true;
        let calls = board.calls.clone();

        let result = Session::with_driver(Box::new(board), Duration::from_secs(1));
        assert!(matches!(result, Err(SessionError::InvalidConfig(_))));
        assert_eq!(*calls.lock().unwrap(), vec!["prepare", "release"]);
    }

    #[test]
    fn test_start_is_idempotent() {
        let board = ScriptedBoard::new(vec![]);
        let calls = board.calls.clone();
        let mut session = open_scripted(board);

        session.start().unwrap();
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);

        let starts = calls.lock().unwrap().iter().filter(|c| **c == "start").count();
        assert_eq!(starts, 1);
    }

    #[test]
    fn test_poll_before_start_is_invalid_state() {
        let mut session = open_scripted(ScriptedBoard::new(vec![]));
        assert!(matches!(
            session.poll_raw(),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_poll_without_data_returns_empty_window() {
        let mut session = open_scripted(ScriptedBoard::new(vec![]));
        session.start().unwrap();
        let window = session.poll_raw().unwrap();
        assert!(window.is_empty());
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_disconnect_moves_to_failed() {
        let board = ScriptedBoard::new(vec![Err(SessionError::Disconnected(
            "cable".to_string(),
        ))]);
        let mut session = open_scripted(board);
        session.start().unwrap();

        assert!(session.poll_raw().is_err());
        assert_eq!(session.state(), SessionState::Failed);
        assert!(matches!(
            session.start(),
            Err(SessionError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_close_twice_has_single_side_effect() {
        let board = ScriptedBoard::new(vec![]);
        let calls = board.calls.clone();
        let mut session = open_scripted(board);
        session.start().unwrap();

        assert!(session.close().is_empty());
        assert!(session.close().is_empty());
        assert!(session.stop().is_empty());

        let log = calls.lock().unwrap().clone();
        assert_eq!(log, vec!["prepare", "start", "stop", "release"]);
        assert!(session.is_closed());
    }

    #[test]
    fn test_close_reports_release_error_without_panicking() {
        let mut board = ScriptedBoard::new(vec![]);
        board.fail_release = true;
        let mut session = open_scripted(board);

        let errors = session.close();
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], SessionError::ReleaseFailed(_)));
        assert!(session.close().is_empty());
    }

    #[test]
    fn test_close_in_failed_state() {
        let board = ScriptedBoard::new(vec![Err(SessionError::Disconnected(
            "gone".to_string(),
        ))]);
        let mut session = open_scripted(board);
        session.start().unwrap();
        let _ = session.poll_raw();

        assert!(session.close().is_empty());
        assert_eq!(session.state(), SessionState::Failed);
    }

    #[test]
    fn test_restart_after_stop() {
        let mut session = open_scripted(ScriptedBoard::new(vec![]));
        session.start().unwrap();
        assert!(session.stop().is_empty());
        assert_eq!(session.state(), SessionState::Stopped);
        session.start().unwrap();
        assert_eq!(session.state(), SessionState::Streaming);
    }

    #[test]
    fn test_remote_kind_rejected() {
        let config = SessionConfig {
            kind: ConnectionKind::RemoteHttp,
            ..SessionConfig::default()
        };
        assert!(matches!(
            Session::open(&config),
            Err(SessionError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_connection_kind_parsing() {
        assert_eq!(
            "streamer".parse::<ConnectionKind>(),
            Ok(ConnectionKind::NetworkStreamer)
        );
        assert_eq!(
            "remote-http".parse::<ConnectionKind>(),
            Ok(ConnectionKind::RemoteHttp)
        );
        assert!("bluetooth".parse::<ConnectionKind>().is_err());
    }

    #[test]
    fn test_analysed_channels_default_to_all() {
        let config = SessionConfig {
            channel_count: 3,
            ..SessionConfig::default()
        };
        assert_eq!(config.analysed_channels(), vec![0, 1, 2]);

        let config = SessionConfig {
            channels: vec![1],
            ..SessionConfig::default()
        };
        assert_eq!(config.analysed_channels(), vec![1]);
    }

    #[test]
    fn test_serial_port_defaults_when_address_is_a_host() {
        let config = SessionConfig {
            kind: ConnectionKind::LocalSerial,
            ..SessionConfig::default()
        };
        assert_eq!(config.serial_port(), DEFAULT_SERIAL_PORT);

        let config = SessionConfig {
            address: "COM3".to_string(),
            ..config
        };
        assert_eq!(config.serial_port(), "COM3");
    }
}
