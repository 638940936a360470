//! Synthetic board producing a deterministic multi-band test signal.
//!
//! Samples are generated on demand from elapsed wall time, so a reader
//! polling once a second gets roughly one second of data, like a real board.

use crate::session::types::{BoardDescription, RawSampleWindow};
use crate::session::{BoardDriver, SessionError};
use std::f64::consts::PI;
use std::time::{Duration, Instant};

/// Component frequencies (Hz) and amplitudes, one per canonical band.
const COMPONENTS: [(f64, f64); 5] = [
    (2.0, 12.0),  // delta
    (6.0, 8.0),   // theta
    (10.0, 10.0), // alpha
    (20.0, 5.0),  // beta
    (40.0, 2.0),  // gamma
];

/// Never hand out more than this many seconds of backlog in one read.
const MAX_BACKLOG_SECS: u64 = 10;

/// A board that needs no hardware.
pub struct SyntheticBoard {
    channel_count: usize,
    sampling_rate: u32,
    started_at: Option<Instant>,
    emitted: u64,
}

impl SyntheticBoard {
    pub fn new(channel_count: usize, sampling_rate: u32) -> Self {
        Self {
            channel_count,
            sampling_rate,
            started_at: None,
            emitted: 0,
        }
    }

    /// Generate `count` samples starting at sample index `start`.
    pub fn generate(
        channel_count: usize,
        sampling_rate: u32,
        start: u64,
        count: usize,
    ) -> RawSampleWindow {
        let fs = f64::from(sampling_rate.max(1));
        let rows = (0..channel_count)
            .map(|ch| {
                let phase = ch as f64 * 0.3;
                (0..count as u64)
                    .map(|i| {
                        let t = (start + i) as f64 / fs;
                        COMPONENTS
                            .iter()
                            .map(|(freq, amp)| amp * (2.0 * PI * freq * t + phase).sin())
                            .sum()
                    })
                    .collect()
            })
            .collect();

        RawSampleWindow::from_rows(rows).unwrap_or_else(|_| RawSampleWindow::empty(channel_count))
    }
}

impl BoardDriver for SyntheticBoard {
    fn prepare(&mut self, _startup_timeout: Duration) -> Result<BoardDescription, SessionError> {
        if self.channel_count == 0 {
            return Err(SessionError::InvalidConfig(
                "synthetic board needs at least one channel".to_string(),
            ));
        }
        Ok(BoardDescription {
            sampling_rate: self.sampling_rate,
            channel_count: self.channel_count,
        })
    }

    fn start_stream(&mut self) -> Result<(), SessionError> {
        self.started_at = Some(Instant::now());
        self.emitted = 0;
        Ok(())
    }

    fn read_available(&mut self) -> Result<RawSampleWindow, SessionError> {
        let Some(started_at) = self.started_at else {
            return Ok(RawSampleWindow::empty(self.channel_count));
        };

        let fs = u64::from(self.sampling_rate);
        let due = (started_at.elapsed().as_secs_f64() * fs as f64) as u64;
        let backlog = due.saturating_sub(self.emitted);
        if backlog > fs * MAX_BACKLOG_SECS {
            // Reader fell behind; skip ahead instead of growing without bound.
            self.emitted = due - fs * MAX_BACKLOG_SECS;
        }
        let count = due.saturating_sub(self.emitted) as usize;

        let window = Self::generate(self.channel_count, self.sampling_rate, self.emitted, count);
        self.emitted = due;
        Ok(window)
    }

    fn stop_stream(&mut self) -> Result<(), SessionError> {
        self.started_at = None;
        Ok(())
    }

    fn release(&mut self) -> Result<(), SessionError> {
        self.started_at = None;
        Ok(())
    }
}
