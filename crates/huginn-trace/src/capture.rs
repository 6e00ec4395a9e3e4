//! JSONL capture files.
//!
//! A capture is a recording of telemetry as exported, one record per line:
//!
//! ```text
//! {"span":{...}}
//! {"log":{...}}
//! {"metrics":{...}}
//! ```
//!
//! Snapshot batches for a remote mirror use the same framing: each line is a
//! JSON array of [`SpanSnapshot`]s produced by one flush.

use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Lines, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::db::Db;
use crate::span::SpanSnapshot;
use crate::telemetry::{LogRecord, MetricData, SpanData};

/// Error type for capture I/O.
#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error on line {line}: {source}")]
    Parse {
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CaptureError>;

/// One line of a capture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureRecord {
    Span(SpanData),
    Log(LogRecord),
    Metrics(MetricData),
}

/// Streams records from a capture, skipping blank lines.
pub struct CaptureReader<R> {
    lines: Lines<R>,
    line: usize,
}

impl<R: BufRead> CaptureReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
            line: 0,
        }
    }
}

impl CaptureReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> Iterator for CaptureReader<R> {
    type Item = Result<CaptureRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let text = match self.lines.next()? {
                Ok(text) => text,
                Err(e) => return Some(Err(e.into())),
            };
            self.line += 1;
            if text.trim().is_empty() {
                continue;
            }
            let line = self.line;
            return Some(
                serde_json::from_str(&text).map_err(|source| CaptureError::Parse { line, source }),
            );
        }
    }
}

/// Read a whole capture file.
pub fn read_capture(path: &Path) -> Result<Vec<CaptureRecord>> {
    CaptureReader::open(path)?.collect()
}

/// Feed records into a database, batching consecutive spans and logs the
/// way an exporter would.
pub fn ingest_records(db: &mut Db, records: impl IntoIterator<Item = CaptureRecord>) {
    let mut spans = Vec::new();
    let mut logs = Vec::new();
    for record in records {
        match record {
            CaptureRecord::Span(span) => {
                if !logs.is_empty() {
                    db.export_logs(std::mem::take(&mut logs));
                }
                spans.push(span);
            }
            CaptureRecord::Log(log) => {
                if !spans.is_empty() {
                    db.export_spans(std::mem::take(&mut spans));
                }
                logs.push(log);
            }
            CaptureRecord::Metrics(metric) => {
                if !spans.is_empty() {
                    db.export_spans(std::mem::take(&mut spans));
                }
                if !logs.is_empty() {
                    db.export_logs(std::mem::take(&mut logs));
                }
                db.export_metrics(vec![metric]);
            }
        }
    }
    if !spans.is_empty() {
        db.export_spans(spans);
    }
    if !logs.is_empty() {
        db.export_logs(logs);
    }
}

/// Writes capture records, one per line.
pub struct CaptureWriter<W: Write> {
    writer: W,
}

impl<W: Write> CaptureWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn write(&mut self, record: &CaptureRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", line)?;
        Ok(())
    }

    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Writes snapshot batches, one JSON array per line.
pub struct SnapshotWriter<W: Write> {
    writer: W,
}

impl SnapshotWriter<BufWriter<File>> {
    /// Create the output file, and its parent directory if needed.
    pub fn create(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }
}

impl<W: Write> SnapshotWriter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write and flush one batch. Empty batches are skipped; returns whether
    /// anything was written.
    pub fn write_batch(&mut self, batch: &[SpanSnapshot]) -> Result<bool> {
        if batch.is_empty() {
            return Ok(false);
        }
        let line = serde_json::to_string(batch)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(true)
    }

    pub fn into_inner(mut self) -> Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}

/// Read every batch written by a [`SnapshotWriter`].
pub fn read_snapshot_batches<R: BufRead>(reader: R) -> Result<Vec<Vec<SpanSnapshot>>> {
    let mut batches = Vec::new();
    for (idx, text) in reader.lines().enumerate() {
        let text = text?;
        if text.trim().is_empty() {
            continue;
        }
        let batch = serde_json::from_str(&text).map_err(|source| CaptureError::Parse {
            line: idx + 1,
            source,
        })?;
        batches.push(batch);
    }
    Ok(batches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attrs::{DAG_DIGEST_ATTR, KeyValue};
    use crate::ids::{SpanContext, SpanId, TraceId};
    use crate::telemetry::DataPoint;
    use chrono::{TimeZone, Utc};
    use std::io::Cursor;
    use tempfile::tempdir;

    fn sid(n: u8) -> SpanId {
        SpanId([0, 0, 0, 0, 0, 0, 0, n])
    }

    fn span(id: u8, parent: Option<u8>) -> SpanData {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, id as u32).unwrap();
        SpanData {
            span_context: SpanContext::new(TraceId([2; 16]), sid(id)),
            parent_span_id: parent.map(sid).unwrap_or_default(),
            name: format!("step {}", id),
            start_time: start,
            end_time: start + chrono::Duration::seconds(1),
            ..SpanData::default()
        }
    }

    fn sample() -> Vec<CaptureRecord> {
        vec![
            CaptureRecord::Span(span(1, None)),
            CaptureRecord::Span(span(2, Some(1))),
            CaptureRecord::Log(LogRecord {
                span_id: sid(2),
                body: "compiling".into(),
                ..LogRecord::default()
            }),
            CaptureRecord::Metrics(MetricData {
                name: "mem".into(),
                points: vec![DataPoint {
                    attributes: vec![KeyValue::new(DAG_DIGEST_ATTR, "sha256:x")],
                    time: Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 5).unwrap(),
                    value: 42,
                }],
            }),
        ]
    }

    #[test]
    fn test_write_and_read_capture() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("capture.jsonl");

        let mut writer = CaptureWriter::new(File::create(&path).unwrap());
        for record in sample() {
            writer.write(&record).unwrap();
        }
        writer.into_inner().unwrap();

        let records = read_capture(&path).unwrap();
        assert_eq!(records, sample());
    }

    #[test]
    fn test_record_framing() {
        let json = serde_json::to_string(&CaptureRecord::Log(LogRecord::default())).unwrap();
        assert!(json.starts_with(r#"{"log":"#));
    }

    #[test]
    fn test_reader_skips_blank_lines_and_reports_bad_line() {
        let mut text = String::new();
        let record = serde_json::to_string(&CaptureRecord::Span(span(1, None))).unwrap();
        text.push_str(&record);
        text.push_str("\n\n   \n{not json}\n");

        let mut reader = CaptureReader::new(Cursor::new(text));
        assert!(matches!(reader.next(), Some(Ok(CaptureRecord::Span(_)))));
        match reader.next() {
            Some(Err(CaptureError::Parse { line, .. })) => assert_eq!(line, 4),
            other => panic!("expected parse error, got {:?}", other),
        }
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_ingest_records() {
        let mut db = Db::new();
        ingest_records(&mut db, sample());
        assert_eq!(db.root_span, Some(sid(1)));
        assert!(db.span(&sid(1)).unwrap().child_spans.contains(&sid(2)));
        assert!(db.span(&sid(2)).unwrap().snapshot.has_logs);
        assert_eq!(db.metrics_by_call["sha256:x"]["mem"][0].value, 42);
    }

    #[test]
    fn test_snapshot_batches() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("out").join("snapshots.jsonl");

        let mut db = Db::new();
        db.export_spans(vec![span(1, None), span(2, Some(1))]);

        let mut writer = SnapshotWriter::create(&path).unwrap();
        assert!(writer.write_batch(&db.updated_snapshots(None)).unwrap());
        assert!(!writer.write_batch(&db.updated_snapshots(None)).unwrap());
        writer.into_inner().unwrap();

        let batches = read_snapshot_batches(BufReader::new(File::open(&path).unwrap())).unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 2);
        assert!(batches[0].iter().all(|s| s.r#final));

        let mut mirror = Db::new();
        for batch in batches {
            mirror.import_snapshots(batch);
        }
        assert!(mirror.span(&sid(1)).unwrap().child_spans.contains(&sid(2)));
    }
}
