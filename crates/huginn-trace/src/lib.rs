//! huginn-trace: Live span aggregation
//!
//! This crate turns a stream of exported telemetry into a navigable model:
//!
//! - **Db**: ingests spans, logs and metrics; wires parents, children and causal links
//! - **Activity**: merged active time per span, including work it caused
//! - **Rollups**: running, failed and canceled state propagated up the graph
//! - **Sync**: versioned snapshots drained from one database and applied to a mirror
//! - **Views**: visible trees and flattened rows for rendering
//! - **Capture**: JSONL recordings of telemetry and snapshot batches
//!
//! # Usage
//!
//! ```rust
//! use chrono::{Duration, Utc};
//! use huginn_trace::{Db, SpanContext, SpanData, SpanId, SpanStatus, TraceId};
//!
//! let trace = TraceId([1; 16]);
//! let root = SpanId([0, 0, 0, 0, 0, 0, 0, 1]);
//! let child = SpanId([0, 0, 0, 0, 0, 0, 0, 2]);
//! let start = Utc::now();
//!
//! let mut db = Db::new();
//! db.export_spans(vec![
//!     SpanData {
//!         span_context: SpanContext::new(trace, child),
//!         parent_span_id: root,
//!         name: "build".into(),
//!         start_time: start,
//!         end_time: start + Duration::seconds(1),
//!         status: SpanStatus::error("exit code 1"),
//!         ..SpanData::default()
//!     },
//!     SpanData {
//!         span_context: SpanContext::new(trace, root),
//!         name: "pipeline".into(),
//!         start_time: start,
//!         end_time: start + Duration::seconds(2),
//!         ..SpanData::default()
//!     },
//! ]);
//!
//! let root_span = db.span(&root).unwrap();
//! assert!(root_span.is_failed_or_caused_failure(&db));
//!
//! let mut mirror = Db::new();
//! mirror.import_snapshots(db.updated_snapshots(None));
//! assert!(mirror.span(&root).unwrap().is_failed_or_caused_failure(&mirror));
//! ```

pub mod activity;
pub mod attrs;
pub mod capture;
pub mod db;
pub mod ids;
pub mod ordered_set;
pub mod rows;
pub mod span;
pub mod telemetry;

pub use activity::{Activity, Interval, SpanInterval};
pub use attrs::{AttrKey, AttrValue, AttributeError, KeyValue};
pub use capture::{
    CaptureError, CaptureReader, CaptureRecord, CaptureWriter, SnapshotWriter, ingest_records,
    read_capture, read_snapshot_batches,
};
pub use db::Db;
pub use ids::{IdError, SpanContext, SpanId, SpanLink, TraceId};
pub use ordered_set::{Keyed, OrderedSet, SpanSet};
pub use rows::{FrontendOpts, Row, RowsView, TraceTree, format_duration, walk_tree};
pub use span::{RollUpState, Span, SpanSnapshot, SpanStatus, StatusCode};
pub use telemetry::{DataPoint, LogRecord, MetricData, Resource, SpanData};
