//! Sample and state types shared by every board driver.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::session::SessionError;

/// A block of raw samples drained from a board.
///
/// Rows are channels, columns are consecutive samples since the previous
/// retrieval. A window with zero columns means "nothing new yet".
#[derive(Debug, Clone, PartialEq)]
pub struct RawSampleWindow {
    rows: Vec<Vec<f64>>,
}

impl RawSampleWindow {
    /// Create an empty window with `channel_count` rows and no samples.
    pub fn empty(channel_count: usize) -> Self {
        Self {
            rows: vec![Vec::new(); channel_count],
        }
    }

    /// Build a window from per-channel rows. All rows must have the same length.
    pub fn from_rows(rows: Vec<Vec<f64>>) -> Result<Self, SessionError> {
        if let Some(first) = rows.first() {
            let len = first.len();
            if let Some(bad) = rows.iter().position(|r| r.len() != len) {
                return Err(SessionError::MalformedFrame(format!(
                    "channel {bad} has {} samples, expected {len}",
                    rows[bad].len()
                )));
            }
        }
        Ok(Self { rows })
    }

    /// Number of channel rows.
    pub fn channel_count(&self) -> usize {
        self.rows.len()
    }

    /// Number of samples (columns).
    pub fn sample_count(&self) -> usize {
        self.rows.first().map(Vec::len).unwrap_or(0)
    }

    /// True when the window carries no samples.
    pub fn is_empty(&self) -> bool {
        self.sample_count() == 0
    }

    /// Samples for one channel.
    pub fn channel(&self, index: usize) -> Option<&[f64]> {
        self.rows.get(index).map(Vec::as_slice)
    }

    /// Append the columns of `other` after our own.
    pub fn extend(&mut self, other: RawSampleWindow) -> Result<(), SessionError> {
        if self.rows.is_empty() {
            self.rows = other.rows;
            return Ok(());
        }
        if other.channel_count() != self.channel_count() {
            return Err(SessionError::MalformedFrame(format!(
                "chunk has {} channels, expected {}",
                other.channel_count(),
                self.channel_count()
            )));
        }
        for (row, extra) in self.rows.iter_mut().zip(other.rows) {
            row.extend(extra);
        }
        Ok(())
    }

    /// Per-channel mean over the window, limited to the first `limit` channels.
    ///
    /// Empty windows yield an empty vector.
    pub fn channel_means(&self, limit: usize) -> Vec<f64> {
        if self.is_empty() {
            return Vec::new();
        }
        self.rows.iter().take(limit).map(|r| r.iter().mean()).collect()
    }
}

/// Lifecycle state of a [`Session`](crate::session::Session).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Uninitialized,
    Prepared,
    Streaming,
    Stopped,
    Failed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Prepared => "prepared",
            SessionState::Streaming => "streaming",
            SessionState::Stopped => "stopped",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// What a board reports about itself once prepared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoardDescription {
    /// Samples per second on every channel
    pub sampling_rate: u32,
    /// Number of signal rows produced per sample
    pub channel_count: usize,
}

/// Data a driver discarded because its reader fell behind.
///
/// The receiver thread records drops; the driver reports new ones from
/// `read_available`.
#[derive(Debug, Clone, Default)]
pub struct DropCounter(Arc<AtomicU64>);

impl DropCounter {
    pub fn record(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    /// Drops since `seen`; advances `seen` to the current total.
    pub fn take_new(&self, seen: &mut u64) -> u64 {
        let total = self.total();
        let new = total.saturating_sub(*seen);
        *seen = total;
        new
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_window_has_no_columns() {
        let window = RawSampleWindow::empty(8);
        assert_eq!(window.channel_count(), 8);
        assert_eq!(window.sample_count(), 0);
        assert!(window.is_empty());
        assert!(window.channel_means(8).is_empty());
    }

    #[test]
    fn test_ragged_rows_rejected() {
        let result = RawSampleWindow::from_rows(vec![vec![1.0, 2.0], vec![1.0]]);
        assert!(matches!(result, Err(SessionError::MalformedFrame(_))));
    }

    #[test]
    fn test_extend_appends_columns() {
        let mut window = RawSampleWindow::empty(2);
        window
            .extend(RawSampleWindow::from_rows(vec![vec![1.0], vec![2.0]]).unwrap())
            .unwrap();
        window
            .extend(RawSampleWindow::from_rows(vec![vec![3.0], vec![4.0]]).unwrap())
            .unwrap();
        assert_eq!(window.sample_count(), 2);
        assert_eq!(window.channel(0), Some(&[1.0, 3.0][..]));
        assert_eq!(window.channel(1), Some(&[2.0, 4.0][..]));
    }

    #[test]
    fn test_extend_rejects_channel_mismatch() {
        let mut window = RawSampleWindow::from_rows(vec![vec![1.0], vec![2.0]]).unwrap();
        let other = RawSampleWindow::from_rows(vec![vec![1.0]]).unwrap();
        assert!(window.extend(other).is_err());
    }

    #[test]
    fn test_channel_means_limit() {
        let window =
            RawSampleWindow::from_rows(vec![vec![1.0, 3.0], vec![2.0, 4.0], vec![9.0, 9.0]])
                .unwrap();
        let means = window.channel_means(2);
        assert_eq!(means, vec![2.0, 3.0]);
    }

    #[test]
    fn test_drop_counter_reports_each_drop_once() {
        let counter = DropCounter::default();
        let receiver_side = counter.clone();
        let mut seen = 0;

        assert_eq!(counter.take_new(&mut seen), 0);
        receiver_side.record();
        receiver_side.record();
        assert_eq!(counter.take_new(&mut seen), 2);
        assert_eq!(counter.take_new(&mut seen), 0);

        receiver_side.record();
        assert_eq!(counter.take_new(&mut seen), 1);
        assert_eq!(counter.total(), 3);
    }
}
