//! Measurement sources
//!
//! The publish loop pulls one [`Measurement`] at a time from any
//! [`MeasurementSource`]. Files are loaded up front (CSV with a header row, or
//! JSON lines); a channel receiver works as an unbounded live source.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;

/// One externally sourced reading
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    /// Raw timestamp as produced by the source
    pub timestamp: String,
    pub value: f64,
}

impl Measurement {
    pub fn new(timestamp: impl Into<String>, value: f64) -> Self {
        Self {
            timestamp: timestamp.into(),
            value,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("Failed to read measurements from {path}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: missing '{column}' column in header")]
    MissingColumn { path: PathBuf, column: &'static str },
    #[error("{path}:{line}: {reason}")]
    InvalidRow {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("Unsupported measurement file format: {0} (expected .csv or .jsonl)")]
    UnsupportedFormat(PathBuf),
}

/// Ordered, possibly unbounded sequence of measurements
#[async_trait]
pub trait MeasurementSource: Send {
    /// `Ok(None)` once the source is exhausted
    async fn next_measurement(&mut self) -> Result<Option<Measurement>, SourceError>;
}

/// In-memory measurements, optionally replayed from the start when exhausted
#[derive(Debug, Clone)]
pub struct VecSource {
    items: Vec<Measurement>,
    position: usize,
    repeat: bool,
}

impl VecSource {
    pub fn new(items: Vec<Measurement>) -> Self {
        Self {
            items,
            position: 0,
            repeat: false,
        }
    }

    pub fn repeating(items: Vec<Measurement>) -> Self {
        Self {
            repeat: true,
            ..Self::new(items)
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[async_trait]
impl MeasurementSource for VecSource {
    async fn next_measurement(&mut self) -> Result<Option<Measurement>, SourceError> {
        if self.position >= self.items.len() {
            if !self.repeat || self.items.is_empty() {
                return Ok(None);
            }
            self.position = 0;
        }
        let item = self.items[self.position].clone();
        self.position += 1;
        Ok(Some(item))
    }
}

#[async_trait]
impl MeasurementSource for mpsc::Receiver<Measurement> {
    async fn next_measurement(&mut self) -> Result<Option<Measurement>, SourceError> {
        Ok(self.recv().await)
    }
}

/// Load a measurement file, choosing the parser from the extension
pub fn load_file(path: &Path, repeat: bool) -> Result<VecSource, SourceError> {
    let content = std::fs::read_to_string(path).map_err(|source| SourceError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let items = match path.extension().and_then(|e| e.to_str()) {
        Some("csv") => parse_csv(&content, path)?,
        Some("jsonl") | Some("ndjson") => parse_json_lines(&content, path)?,
        _ => return Err(SourceError::UnsupportedFormat(path.to_path_buf())),
    };

    info!(
        path = %path.display(),
        count = items.len(),
        repeat,
        "Loaded measurements"
    );

    Ok(if repeat {
        VecSource::repeating(items)
    } else {
        VecSource::new(items)
    })
}

/// Parse CSV with a header naming `timestamp` and `value` columns (any order).
/// Other columns are ignored.
pub fn parse_csv(content: &str, path: &Path) -> Result<Vec<Measurement>, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(content.as_bytes());

    let headers = reader.headers().map_err(|e| invalid_csv(path, &e))?;
    if headers.is_empty() {
        return Ok(Vec::new());
    }
    for column in ["timestamp", "value"] {
        if !headers.iter().any(|header| header == column) {
            return Err(SourceError::MissingColumn {
                path: path.to_path_buf(),
                column,
            });
        }
    }

    reader
        .deserialize::<Measurement>()
        .map(|row| row.map_err(|e| invalid_csv(path, &e)))
        .collect()
}

fn invalid_csv(path: &Path, error: &csv::Error) -> SourceError {
    let line = error.position().map_or(0, |position| position.line() as usize);
    SourceError::InvalidRow {
        path: path.to_path_buf(),
        line,
        reason: error.to_string(),
    }
}

/// Parse one JSON object per line: `{"timestamp": "...", "value": 1.0}`
pub fn parse_json_lines(content: &str, path: &Path) -> Result<Vec<Measurement>, SourceError> {
    content
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(index, line)| {
            serde_json::from_str::<Measurement>(line).map_err(|e| SourceError::InvalidRow {
                path: path.to_path_buf(),
                line: index + 1,
                reason: e.to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::Builder;

    #[tokio::test]
    async fn test_vec_source_exhausts() {
        let mut source = VecSource::new(vec![Measurement::new("a", 1.0), Measurement::new("b", 2.0)]);
        assert_eq!(source.next_measurement().await.unwrap().unwrap().value, 1.0);
        assert_eq!(source.next_measurement().await.unwrap().unwrap().value, 2.0);
        assert!(source.next_measurement().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_repeating_source_cycles() {
        let mut source = VecSource::repeating(vec![Measurement::new("a", 1.0), Measurement::new("b", 2.0)]);
        let mut values = Vec::new();
        for _ in 0..5 {
            values.push(source.next_measurement().await.unwrap().unwrap().value);
        }
        assert_eq!(values, vec![1.0, 2.0, 1.0, 2.0, 1.0]);
    }

    #[tokio::test]
    async fn test_repeating_empty_source_is_exhausted() {
        let mut source = VecSource::repeating(Vec::new());
        assert!(source.next_measurement().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_channel_source() {
        let (tx, mut rx) = mpsc::channel(4);
        tx.send(Measurement::new("2021-01-01 10:00:00", 3.5)).await.unwrap();
        drop(tx);
        assert_eq!(rx.next_measurement().await.unwrap().unwrap().value, 3.5);
        assert!(rx.next_measurement().await.unwrap().is_none());
    }

    #[test]
    fn test_parse_csv_any_column_order() {
        let content = "value,device,timestamp\n1.5,pump,2021-01-01 10:00:00\n\n\"2\",pump,\"2021-01-01 10:01:00\"\n";
        let items = parse_csv(content, Path::new("data.csv")).unwrap();
        assert_eq!(
            items,
            vec![
                Measurement::new("2021-01-01 10:00:00", 1.5),
                Measurement::new("2021-01-01 10:01:00", 2.0),
            ]
        );
    }

    #[test]
    fn test_parse_csv_quoted_fields() {
        let content = "timestamp,value,note\n\"Jan 1, 2021 10:00:00\",5,\"said \"\"hi\"\", left\"\n";
        let items = parse_csv(content, Path::new("data.csv")).unwrap();
        assert_eq!(items, vec![Measurement::new("Jan 1, 2021 10:00:00", 5.0)]);
    }

    #[test]
    fn test_parse_csv_errors() {
        let missing = parse_csv("time,value\n", Path::new("data.csv"));
        assert!(matches!(
            missing,
            Err(SourceError::MissingColumn {
                column: "timestamp",
                ..
            })
        ));

        let bad_value = parse_csv("timestamp,value\nt,1\nt,abc\n", Path::new("data.csv"));
        assert!(matches!(bad_value, Err(SourceError::InvalidRow { line: 3, .. })));

        let short_row = parse_csv("timestamp,value\nt\n", Path::new("data.csv"));
        assert!(matches!(short_row, Err(SourceError::InvalidRow { line: 2, .. })));

        assert!(parse_csv("", Path::new("data.csv")).unwrap().is_empty());
    }

    #[test]
    fn test_parse_json_lines() {
        let content = "{\"timestamp\": \"t1\", \"value\": 1}\n\n{\"timestamp\": \"t2\", \"value\": -0.5}\n";
        let items = parse_json_lines(content, Path::new("data.jsonl")).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], Measurement::new("t2", -0.5));

        let err = parse_json_lines("{\"value\": 1}", Path::new("data.jsonl"));
        assert!(matches!(err, Err(SourceError::InvalidRow { line: 1, .. })));
    }

    #[test]
    fn test_load_file_by_extension() {
        let mut file = Builder::new().suffix(".csv").tempfile().unwrap();
        writeln!(file, "timestamp,value\n2021-01-01 10:00:00,42").unwrap();
        let source = load_file(file.path(), false).unwrap();
        assert_eq!(source.len(), 1);

        let other = Builder::new().suffix(".txt").tempfile().unwrap();
        assert!(matches!(
            load_file(other.path(), false),
            Err(SourceError::UnsupportedFormat(_))
        ));

        assert!(matches!(
            load_file(Path::new("/nonexistent/data.csv"), false),
            Err(SourceError::Read { .. })
        ));
    }
}
