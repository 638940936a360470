//! Append-only CSV recording of feature records.
//!
//! One [`RecordingSession`] owns one file. The header is fixed when the file
//! is created and every row is flushed as soon as it is written, so a crash
//! loses at most the tick in flight.

use crate::core::{Band, BandPowers, FeatureRecord, FocusFormula};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};

/// Decimal places used when writing numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Precision {
    /// Places for band powers
    pub bands: usize,
    /// Places for focus and relaxation
    pub indices: usize,
}

impl Default for Precision {
    fn default() -> Self {
        Self {
            bands: 5,
            indices: 2,
        }
    }
}

/// Which columns a recording carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordLayout {
    pub frame_index: bool,
    pub relaxation: bool,
    pub formula: FocusFormula,
    pub precision: Precision,
}

impl RecordLayout {
    /// Header row for this layout.
    pub fn header(&self) -> Vec<&'static str> {
        let mut header = vec!["timestamp"];
        if self.frame_index {
            header.push("frame_index");
        }
        header.extend(Band::ALL.iter().map(|b| b.name()));
        header.push(self.formula.column());
        if self.relaxation {
            header.push("relaxation");
        }
        header
    }

    fn row(&self, record: &FeatureRecord) -> Vec<String> {
        let p = self.precision;
        let mut row = vec![record
            .timestamp
            .to_rfc3339_opts(SecondsFormat::Millis, true)];
        if self.frame_index {
            row.push(record.frame_index.map(|f| f.to_string()).unwrap_or_default());
        }
        row.extend(
            record
                .bands
                .as_array()
                .iter()
                .map(|v| format!("{v:.prec$}", prec = p.bands)),
        );
        row.push(format!("{:.prec$}", record.focus, prec = p.indices));
        if self.relaxation {
            row.push(
                record
                    .relaxation
                    .map(|r| format!("{r:.prec$}", prec = p.indices))
                    .unwrap_or_default(),
            );
        }
        row
    }
}

/// Recording failures. A failed write means a tick was lost.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("recording I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("recording CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("recording is already closed")]
    Closed,
    #[error("cannot parse recording: {0}")]
    Parse(String),
}

/// One open recording file.
pub struct RecordingSession {
    path: PathBuf,
    layout: RecordLayout,
    writer: Option<csv::Writer<File>>,
    rows_written: u64,
}

impl std::fmt::Debug for RecordingSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordingSession")
            .field("path", &self.path)
            .field("rows_written", &self.rows_written)
            .field("closed", &self.writer.is_none())
            .finish()
    }
}

impl RecordingSession {
    /// Create a new recording with a generated file name inside `dir`.
    pub fn create(dir: &Path, layout: RecordLayout) -> Result<Self, PersistenceError> {
        std::fs::create_dir_all(dir)?;
        let id = uuid::Uuid::new_v4().to_string();
        let path = dir.join(format!(
            "session_{}_{}.csv",
            Utc::now().format("%Y%m%d_%H%M%S"),
            &id[..8]
        ));
        Self::create_at(path, layout)
    }

    /// Create a new recording at an explicit path, truncating any existing file.
    pub fn create_at(path: PathBuf, layout: RecordLayout) -> Result<Self, PersistenceError> {
        let file = File::create(&path)?;
        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(layout.header())?;
        writer.flush()?;

        tracing::info!(path = %path.display(), "Recording started");

        Ok(Self {
            path,
            layout,
            writer: Some(writer),
            rows_written: 0,
        })
    }

    /// Append one record.
    pub fn write(&mut self, record: &FeatureRecord) -> Result<(), PersistenceError> {
        let writer = self.writer.as_mut().ok_or(PersistenceError::Closed)?;
        writer.write_record(self.layout.row(record))?;
        writer.flush()?;
        self.rows_written += 1;
        Ok(())
    }

    /// Flush and release the file. Further calls do nothing.
    pub fn close(&mut self) -> Result<(), PersistenceError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer.flush()?;
        let file = writer
            .into_inner()
            .map_err(|e| PersistenceError::Io(e.into_error()))?;
        file.sync_all()?;
        tracing::info!(
            path = %self.path.display(),
            rows = self.rows_written,
            "Recording closed"
        );
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> RecordLayout {
        self.layout
    }

    pub fn rows_written(&self) -> u64 {
        self.rows_written
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::error!(error = %e, path = %self.path.display(), "Recording close failed");
        }
    }
}

/// A row read back from a recording.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedRow {
    pub timestamp: DateTime<Utc>,
    pub frame_index: Option<u64>,
    pub bands: BandPowers,
    pub formula: FocusFormula,
    pub focus: f64,
    pub relaxation: Option<f64>,
}

/// Parse a recording written by [`RecordingSession`].
pub fn read_recording(path: &Path) -> Result<Vec<RecordedRow>, PersistenceError> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();
    let column = |name: &str| headers.iter().position(|h| h == name);
    let require = |name: &str| {
        column(name).ok_or_else(|| PersistenceError::Parse(format!("missing column '{name}'")))
    };

    let timestamp_col = require("timestamp")?;
    let band_cols = Band::ALL
        .iter()
        .map(|b| require(b.name()))
        .collect::<Result<Vec<_>, _>>()?;
    let (formula, focus_col) = headers
        .iter()
        .enumerate()
        .find_map(|(i, h)| FocusFormula::from_column(h).map(|f| (f, i)))
        .ok_or_else(|| PersistenceError::Parse("missing focus column".to_string()))?;
    let frame_col = column("frame_index");
    let relaxation_col = column("relaxation");

    let mut rows = Vec::new();
    for (line, result) in reader.records().enumerate() {
        let record = result?;
        let field = |i: usize| {
            record
                .get(i)
                .ok_or_else(|| PersistenceError::Parse(format!("row {line}: missing field {i}")))
        };
        let number = |i: usize| -> Result<f64, PersistenceError> {
            field(i)?
                .parse::<f64>()
                .map_err(|e| PersistenceError::Parse(format!("row {line}: {e}")))
        };
        let optional = |col: Option<usize>| -> Result<Option<f64>, PersistenceError> {
            match col {
                Some(i) if !field(i)?.is_empty() => number(i).map(Some),
                _ => Ok(None),
            }
        };

        let timestamp = DateTime::parse_from_rfc3339(field(timestamp_col)?)
            .map_err(|e| PersistenceError::Parse(format!("row {line}: {e}")))?
            .with_timezone(&Utc);
        let band_values = band_cols
            .iter()
            .map(|&i| number(i))
            .collect::<Result<Vec<_>, _>>()?;
        let bands = BandPowers::from_vector(&band_values)
            .map_err(|e| PersistenceError::Parse(format!("row {line}: {e}")))?;

        rows.push(RecordedRow {
            timestamp,
            frame_index: optional(frame_col)?.map(|f| f as u64),
            bands,
            formula,
            focus: number(focus_col)?,
            relaxation: optional(relaxation_col)?,
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::FeatureDeriver;
    use chrono::Duration;

    fn layout(frame_index: bool, relaxation: bool) -> RecordLayout {
        RecordLayout {
            frame_index,
            relaxation,
            formula: FocusFormula::V1,
            precision: Precision::default(),
        }
    }

    fn record(tick: u64, values: [f64; 5], frame: Option<u64>) -> FeatureRecord {
        FeatureDeriver::default().derive(
            BandPowers::from_vector(&values).unwrap(),
            Utc::now() + Duration::milliseconds(tick as i64),
            tick,
            frame,
        )
    }

    #[test]
    fn test_header_variants() {
        assert_eq!(
            layout(false, false).header(),
            vec!["timestamp", "delta", "theta", "alpha", "beta", "gamma", "focus_v1"]
        );
        assert_eq!(
            layout(true, true).header(),
            vec![
                "timestamp",
                "frame_index",
                "delta",
                "theta",
                "alpha",
                "beta",
                "gamma",
                "focus_v1",
                "relaxation"
            ]
        );
    }

    #[test]
    fn test_round_trip_to_precision() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = RecordingSession::create(dir.path(), layout(true, true)).unwrap();
        let original = record(0, [1.234567891, 0.000004, 3.5, 12.3456789, 0.1], Some(17));
        session.write(&original).unwrap();
        session.close().unwrap();

        let rows = read_recording(session.path()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        for (read, written) in row.bands.as_array().iter().zip(original.bands.as_array()) {
            assert!((read - written).abs() <= 0.5e-5, "{read} vs {written}");
        }
        assert!((row.focus - original.focus).abs() <= 0.005);
        assert!((row.relaxation.unwrap() - original.relaxation.unwrap()).abs() <= 0.005);
        assert_eq!(row.frame_index, Some(17));
        assert_eq!(row.formula, FocusFormula::V1);
        assert_eq!(
            row.timestamp.timestamp_millis(),
            original.timestamp.timestamp_millis()
        );
    }

    #[test]
    fn test_rows_follow_write_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = RecordingSession::create(dir.path(), layout(false, true)).unwrap();
        for tick in 0..5 {
            session
                .write(&record(tick, [1.0, 1.0, 1.0, tick as f64, 1.0], None))
                .unwrap();
        }
        session.close().unwrap();

        let rows = read_recording(session.path()).unwrap();
        assert_eq!(rows.len(), 5);
        for (i, row) in rows.iter().enumerate() {
            assert_eq!(row.bands.beta, i as f64);
            assert_eq!(row.frame_index, None);
        }
        assert!(rows.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut session = RecordingSession::create(dir.path(), layout(false, false)).unwrap();
        session.write(&record(0, [1.0; 5], None)).unwrap();
        session.close().unwrap();
        session.close().unwrap();
        assert!(session.is_closed());
        assert_eq!(session.rows_written(), 1);

        assert!(matches!(
            session.write(&record(1, [1.0; 5], None)),
            Err(PersistenceError::Closed)
        ));
        assert_eq!(read_recording(session.path()).unwrap().len(), 1);
    }

    #[test]
    fn test_drop_flushes() {
        let dir = tempfile::tempdir().unwrap();
        let path = {
            let mut session = RecordingSession::create(dir.path(), layout(false, true)).unwrap();
            session.write(&record(0, [2.0; 5], None)).unwrap();
            session.path().to_path_buf()
        };
        assert_eq!(read_recording(&path).unwrap().len(), 1);
    }

    #[test]
    fn test_missing_focus_column_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.csv");
        std::fs::write(
            &path,
            "timestamp,delta,theta,alpha,beta,gamma\n2024-01-01T00:00:00.000Z,1,1,1,1,1\n",
        )
        .unwrap();
        assert!(matches!(
            read_recording(&path),
            Err(PersistenceError::Parse(_))
        ));
    }
}
