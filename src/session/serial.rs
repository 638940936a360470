//! Serial-attached board.
//!
//! Reads newline-delimited samples, one sample per line with one
//! comma-separated value per channel:
//!
//! ```text
//! 12.5,-3.1,0.4,8.8,1.0,2.2,-0.7,4.1
//! ```
//!
//! The line format is always available; the port driver itself needs the
//! `serial` feature.

use crate::session::SessionError;
use std::io::{BufRead, ErrorKind};

#[cfg(feature = "serial")]
pub use board::SerialBoard;

/// Parse one line of comma-separated channel values.
pub fn parse_line(line: &str, channel_count: usize) -> Result<Vec<f64>, SessionError> {
    let values = line
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| SessionError::MalformedFrame(format!("bad sample '{line}': {e}")))?;
    if values.len() != channel_count {
        return Err(SessionError::MalformedFrame(format!(
            "line has {} values, expected {channel_count}",
            values.len()
        )));
    }
    Ok(values)
}

/// Result of one read attempt on a line stream.
#[derive(Debug, PartialEq)]
pub enum LineEvent {
    Sample(Vec<f64>),
    /// Blank line, banner or status output
    Skipped,
    /// Read timed out; any partial line stays buffered
    Pending,
    Closed,
}

/// Read the next line from `reader` into `line` and classify it.
///
/// `line` is only cleared once a complete line has been consumed, so a
/// sample split across a read timeout is reassembled on the next call.
pub fn next_event<R: BufRead>(
    reader: &mut R,
    line: &mut String,
    channel_count: usize,
) -> std::io::Result<LineEvent> {
    match reader.read_line(line) {
        Ok(0) if line.is_empty() => Ok(LineEvent::Closed),
        Ok(_) => {
            let complete = std::mem::take(line);
            let trimmed = complete.trim();
            if trimmed.is_empty() {
                return Ok(LineEvent::Skipped);
            }
            match parse_line(trimmed, channel_count) {
                Ok(sample) => Ok(LineEvent::Sample(sample)),
                // Boards print banners and status lines between samples.
                Err(e) => {
                    tracing::debug!(error = %e, "Skipping serial line");
                    Ok(LineEvent::Skipped)
                }
            }
        }
        Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
            Ok(LineEvent::Pending)
        }
        Err(e) => Err(e),
    }
}

#[cfg(feature = "serial")]
mod board {
    use super::{next_event, LineEvent};
    use crate::session::types::{BoardDescription, DropCounter, RawSampleWindow};
    use crate::session::{BoardDriver, SessionError};
    use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
    use std::io::BufReader;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};
    use tokio_serial::SerialPort;

    const READ_TIMEOUT: Duration = Duration::from_millis(100);

    /// A board on a local serial port.
    pub struct SerialBoard {
        port_name: String,
        baud_rate: u32,
        channel_count: usize,
        sampling_rate: u32,
        port: Option<Box<dyn SerialPort>>,
        receiver: Option<Receiver<Vec<f64>>>,
        worker: Option<JoinHandle<()>>,
        running: Arc<AtomicBool>,
        fault: Arc<Mutex<Option<String>>>,
        dropped: DropCounter,
        reported_drops: u64,
    }

    impl SerialBoard {
        pub fn new(
            port_name: impl Into<String>,
            baud_rate: u32,
            channel_count: usize,
            sampling_rate: u32,
        ) -> Self {
            Self {
                port_name: port_name.into(),
                baud_rate,
                channel_count,
                sampling_rate,
                port: None,
                receiver: None,
                worker: None,
                running: Arc::new(AtomicBool::new(false)),
                fault: Arc::new(Mutex::new(None)),
                dropped: DropCounter::default(),
                reported_drops: 0,
            }
        }

        /// Samples discarded because the reader fell behind.
        pub fn dropped_samples(&self) -> u64 {
            self.dropped.total()
        }

        fn read_loop(
            port: Box<dyn SerialPort>,
            sender: Sender<Vec<f64>>,
            channel_count: usize,
            running: Arc<AtomicBool>,
            fault: Arc<Mutex<Option<String>>>,
            dropped: DropCounter,
        ) {
            let mut reader = BufReader::new(port);
            let mut line = String::new();

            while running.load(Ordering::SeqCst) {
                match next_event(&mut reader, &mut line, channel_count) {
                    Ok(LineEvent::Sample(sample)) => match sender.try_send(sample) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => dropped.record(),
                        Err(TrySendError::Disconnected(_)) => break,
                    },
                    Ok(LineEvent::Skipped) | Ok(LineEvent::Pending) => {}
                    Ok(LineEvent::Closed) => {
                        let mut slot = fault.lock().unwrap_or_else(|p| p.into_inner());
                        *slot = Some("serial port closed".to_string());
                        break;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Serial read failed");
                        let mut slot = fault.lock().unwrap_or_else(|p| p.into_inner());
                        *slot = Some(e.to_string());
                        break;
                    }
                }
            }
        }
    }

    impl BoardDriver for SerialBoard {
        fn prepare(
            &mut self,
            startup_timeout: Duration,
        ) -> Result<BoardDescription, SessionError> {
            // Boards reset when the port opens and need a few seconds of firmware init.
            let deadline = Instant::now() + startup_timeout;
            let port = loop {
                match tokio_serial::new(&self.port_name, self.baud_rate)
                    .timeout(READ_TIMEOUT)
                    .open()
                {
                    Ok(port) => break port,
                    Err(e) if Instant::now() < deadline => {
                        tracing::debug!(error = %e, port = %self.port_name, "Open failed, retrying");
                        thread::sleep(Duration::from_millis(500));
                    }
                    Err(e) => {
                        return Err(SessionError::ConnectFailed(format!(
                            "cannot open {}: {e}",
                            self.port_name
                        )))
                    }
                }
            };

            tracing::info!(port = %self.port_name, baud = self.baud_rate, "Serial port opened");
            self.port = Some(port);

            Ok(BoardDescription {
                sampling_rate: self.sampling_rate,
                channel_count: self.channel_count,
            })
        }

        fn start_stream(&mut self) -> Result<(), SessionError> {
            if self.worker.is_some() {
                return Ok(());
            }
            let port = self
                .port
                .as_ref()
                .ok_or_else(|| SessionError::StreamFailed("port not open".to_string()))?
                .try_clone()
                .map_err(|e| SessionError::StreamFailed(e.to_string()))?;

            let (sender, receiver) = bounded(self.sampling_rate as usize * 10);
            self.running.store(true, Ordering::SeqCst);

            let channel_count = self.channel_count;
            let running = self.running.clone();
            let fault = self.fault.clone();
            let dropped = self.dropped.clone();
            let worker = thread::Builder::new()
                .name("serial-rx".to_string())
                .spawn(move || {
                    Self::read_loop(port, sender, channel_count, running, fault, dropped)
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
                    port = %self.port_name,
                    "Serial queue full; samples dropped"
                );
            }

            let mut rows = vec![Vec::new(); self.channel_count];
            if let Some(receiver) = &self.receiver {
                for sample in receiver.try_iter() {
                    for (row, value) in rows.iter_mut().zip(sample) {
                        row.push(value);
                    }
                }
            }
            RawSampleWindow::from_rows(rows)
        }

        fn stop_stream(&mut self) -> Result<(), SessionError> {
            self.running.store(false, Ordering::SeqCst);
            if let Some(worker) = self.worker.take() {
                worker.join().map_err(|_| {
                    SessionError::StreamFailed("reader thread panicked".to_string())
                })?;
            }
            self.receiver = None;
            Ok(())
        }

        fn release(&mut self) -> Result<(), SessionError> {
            let result = self.stop_stream();
            self.port = None;
            result
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::io::{BufReader, Read};

    /// Byte stream delivering scripted chunks and read errors.
    struct ChunkedPort {
        chunks: VecDeque<std::io::Result<&'static [u8]>>,
    }

    impl Read for ChunkedPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.chunks.pop_front() {
                Some(Ok(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                Some(Err(e)) => Err(e),
                None => Ok(0),
            }
        }
    }

    fn port(chunks: Vec<std::io::Result<&'static [u8]>>) -> BufReader<ChunkedPort> {
        BufReader::new(ChunkedPort {
            chunks: chunks.into(),
        })
    }

    #[test]
    fn test_parse_line() {
        assert_eq!(parse_line("1.0, 2.5,-3", 3).unwrap(), vec![1.0, 2.5, -3.0]);
    }

    #[test]
    fn test_parse_line_wrong_width() {
        assert!(parse_line("1.0,2.0", 3).is_err());
    }

    #[test]
    fn test_parse_line_banner() {
        assert!(parse_line("OpenBCI V3 8-16 channel", 8).is_err());
    }

    #[test]
    fn test_sample_split_by_timeout_is_reassembled() {
        let mut reader = port(vec![
            Ok(&b"1.0,2."[..]),
            Err(ErrorKind::TimedOut.into()),
            Ok(&b"5\n"[..]),
            Ok(&b"3.0,4.0\n"[..]),
        ]);
        let mut line = String::new();

        assert_eq!(next_event(&mut reader, &mut line, 2).unwrap(), LineEvent::Pending);
        assert_eq!(line, "1.0,2.");
        assert_eq!(
            next_event(&mut reader, &mut line, 2).unwrap(),
            LineEvent::Sample(vec![1.0, 2.5])
        );
        assert!(line.is_empty());
        assert_eq!(
            next_event(&mut reader, &mut line, 2).unwrap(),
            LineEvent::Sample(vec![3.0, 4.0])
        );
        assert_eq!(next_event(&mut reader, &mut line, 2).unwrap(), LineEvent::Closed);
    }

    #[test]
    fn test_banner_and_blank_lines_skipped() {
        let mut reader = port(vec![Ok(&b"OpenBCI V3\n\n7.0,8.0\n"[..])]);
        let mut line = String::new();

        assert_eq!(next_event(&mut reader, &mut line, 2).unwrap(), LineEvent::Skipped);
        assert_eq!(next_event(&mut reader, &mut line, 2).unwrap(), LineEvent::Skipped);
        assert_eq!(
            next_event(&mut reader, &mut line, 2).unwrap(),
            LineEvent::Sample(vec![7.0, 8.0])
        );
    }

    #[test]
    fn test_hard_read_error_is_returned() {
        let mut reader = port(vec![Err(ErrorKind::BrokenPipe.into())]);
        let mut line = String::new();
        let err = next_event(&mut reader, &mut line, 2).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);
    }
}
