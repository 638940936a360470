//! Network streamer board.
//!
//! Binds a UDP socket and receives JSON datagrams of the form
//! `{"samples": [[ch0 ...], [ch1 ...], ...]}`. A receiver thread parses
//! datagrams and hands them over through a bounded channel, so reads from
//! the session never block on the network.

use crate::session::types::{BoardDescription, DropCounter, RawSampleWindow};
use crate::session::{BoardDriver, SessionError};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::Deserialize;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Maximum datagram size accepted.
const DATAGRAM_BUFFER: usize = 65_536;

/// Pending chunks held between reads.
const CHANNEL_CAPACITY: usize = 4_096;

/// Socket read timeout so the receiver notices stop requests.
const READ_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
struct StreamerDatagram {
    samples: Vec<Vec<f64>>,
}

/// Parse one datagram into a sample window.
pub fn parse_datagram(bytes: &[u8], channel_count: usize) -> Result<RawSampleWindow, SessionError> {
    let datagram: StreamerDatagram = serde_json::from_slice(bytes)
        .map_err(|e| SessionError::MalformedFrame(format!("invalid datagram: {e}")))?;
    if datagram.samples.len() != channel_count {
        return Err(SessionError::MalformedFrame(format!(
            "datagram has {} channels, expected {channel_count}",
            datagram.samples.len()
        )));
    }
    RawSampleWindow::from_rows(datagram.samples)
}

/// UDP-fed board.
pub struct StreamerBoard {
    bind_addr: String,
    channel_count: usize,
    sampling_rate: u32,
    socket: Option<UdpSocket>,
    receiver: Option<Receiver<RawSampleWindow>>,
    worker: Option<JoinHandle<()>>,
    running: Arc<AtomicBool>,
    fault: Arc<Mutex<Option<String>>>,
    capacity: usize,
    dropped: DropCounter,
    reported_drops: u64,
}

impl StreamerBoard {
    pub fn new(bind_addr: impl Into<String>, channel_count: usize, sampling_rate: u32) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            channel_count,
            sampling_rate,
            socket: None,
            receiver: None,
            worker: None,
            running: Arc::new(AtomicBool::new(false)),
            fault: Arc::new(Mutex::new(None)),
            capacity: CHANNEL_CAPACITY,
            dropped: DropCounter::default(),
            reported_drops: 0,
        }
    }

    /// Hold at most `capacity` chunks between reads.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity.max(1);
        self
    }

    /// Address the socket is actually bound to (useful with port 0).
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Chunks discarded because the reader fell behind.
    pub fn dropped_chunks(&self) -> u64 {
        self.dropped.total()
    }

    fn receive_loop(
        socket: UdpSocket,
        sender: Sender<RawSampleWindow>,
        channel_count: usize,
        running: Arc<AtomicBool>,
        fault: Arc<Mutex<Option<String>>>,
        dropped: DropCounter,
    ) {
        let mut buffer = vec![0u8; DATAGRAM_BUFFER];

        while running.load(Ordering::SeqCst) {
            match socket.recv(&mut buffer) {
                Ok(len) => match parse_datagram(&buffer[..len], channel_count) {
                    Ok(window) => match sender.try_send(window) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => dropped.record(),
                        Err(TrySendError::Disconnected(_)) => break,
                    },
                    Err(e) => {
                        tracing::debug!(error = %e, "Skipping streamer datagram");
                    }
                },
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut => {}
                Err(e) => {
                    tracing::error!(error = %e, "Streamer socket failed");
                    let mut slot = fault.lock().unwrap_or_else(|p| p.into_inner());
                    *slot = Some(e.to_string());
                    break;
                }
            }
        }
    }
}

impl BoardDriver for StreamerBoard {
    fn prepare(&mut self, startup_timeout: Duration) -> Result<BoardDescription, SessionError> {
        if self.channel_count == 0 {
            return Err(SessionError::InvalidConfig(
                "streamer needs at least one channel".to_string(),
            ));
        }

        // The port may still be held by a previous run; retry until the window closes.
        let deadline = Instant::now() + startup_timeout;
        let socket = loop {
            match UdpSocket::bind(&self.bind_addr) {
                Ok(socket) => break socket,
                Err(e) if Instant::now() < deadline => {
                    tracing::debug!(error = %e, addr = %self.bind_addr, "Bind failed, retrying");
                    thread::sleep(Duration::from_millis(250));
                }
                Err(e) => {
                    return Err(SessionError::ConnectFailed(format!(
                        "cannot bind {}: {e}",
                        self.bind_addr
                    )))
                }
            }
        };
        socket
            .set_read_timeout(Some(READ_TIMEOUT))
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        tracing::info!(addr = %self.bind_addr, "Streamer socket bound");
        self.socket = Some(socket);

        Ok(BoardDescription {
            sampling_rate: self.sampling_rate,
            channel_count: self.channel_count,
        })
    }

    fn start_stream(&mut self) -> Result<(), SessionError> {
        if self.worker.is_some() {
            return Ok(());
        }
        let socket = self
            .socket
            .as_ref()
            .ok_or_else(|| SessionError::StreamFailed("socket not bound".to_string()))?
            .try_clone()
            .map_err(|e| SessionError::StreamFailed(e.to_string()))?;

        let (sender, receiver) = bounded(self.capacity);
        self.running.store(true, Ordering::SeqCst);

        let channel_count = self.channel_count;
        let running = self.running.clone();
        let fault = self.fault.clone();
        let dropped = self.dropped.clone();
        let worker = thread::Builder::new()
            .name("streamer-rx".to_string())
            .spawn(move || {
                Self::receive_loop(socket, sender, channel_count, running, fault, dropped)
            })
            .map_err(|e| SessionError::StreamFailed(e.to_string()))?;

        self.receiver = Some(receiver);
        self.worker = Some(worker);
        Ok(())
    }

    fn read_available(&mut self) -> Result<RawSampleWindow, SessionError> {
        if let Some(message) = self
            .fault
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
        {
            return Err(SessionError::Disconnected(message));
        }

        let new_drops = self.dropped.take_new(&mut self.reported_drops);
        if new_drops > 0 {
            tracing::warn!(
                dropped = new_drops,
                total = self.reported_drops,
                addr = %self.bind_addr,
                "Streamer queue full; chunks dropped"
            );
        }

        let mut window = RawSampleWindow::empty(self.channel_count);
        if let Some(receiver) = &self.receiver {
            for chunk in receiver.try_iter() {
                window.extend(chunk)?;
            }
        }
        Ok(window)
    }

    fn stop_stream(&mut self) -> Result<(), SessionError> {
        self.running.store(false, Ordering::SeqCst);
        if let Some(worker) = self.worker.take() {
            worker
                .join()
                .map_err(|_| SessionError::StreamFailed("receiver thread panicked".to_string()))?;
        }
        self.receiver = None;
        Ok(())
    }

    fn release(&mut self) -> Result<(), SessionError> {
        let result = self.stop_stream();
        self.socket = None;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_datagram() {
        let window = parse_datagram(br#"{"samples": [[1.0, 2.0], [3.0, 4.0]]}"#, 2).unwrap();
        assert_eq!(window.sample_count(), 2);
        assert_eq!(window.channel(1), Some(&[3.0, 4.0][..]));
    }

    #[test]
    fn test_parse_datagram_channel_mismatch() {
        let result = parse_datagram(br#"{"samples": [[1.0]]}"#, 2);
        assert!(matches!(result, Err(SessionError::MalformedFrame(_))));
    }

    #[test]
    fn test_parse_datagram_garbage() {
        assert!(parse_datagram(b"not json", 2).is_err());
    }

    #[test]
    fn test_streamer_receives_datagrams() {
        let mut board = StreamerBoard::new("127.0.0.1:0", 2, 250);
        board.prepare(Duration::from_secs(1)).unwrap();
        board.start_stream().unwrap();
        let addr = board.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        sender
            .send_to(br#"{"samples": [[1.0, 2.0], [3.0, 4.0]]}"#, addr)
            .unwrap();
        sender.send_to(br#"{"samples": [[5.0], [6.0]]}"#, addr).unwrap();

        let mut total = 0;
        for _ in 0..50 {
            total += board.read_available().unwrap().sample_count();
            if total >= 3 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(total, 3);

        board.release().unwrap();
        board.release().unwrap();
    }

    #[test]
    fn test_full_queue_counts_dropped_chunks() {
        let mut board = StreamerBoard::new("127.0.0.1:0", 1, 250).with_queue_capacity(1);
        board.prepare(Duration::from_secs(1)).unwrap();
        board.start_stream().unwrap();
        let addr = board.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..3 {
            sender.send_to(br#"{"samples": [[1.0]]}"#, addr).unwrap();
        }

        for _ in 0..50 {
            if board.dropped_chunks() >= 2 {
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(board.dropped_chunks(), 2);
        assert_eq!(board.read_available().unwrap().sample_count(), 1);

        board.release().unwrap();
    }
}
