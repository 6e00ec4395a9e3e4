//! Cross-crate integration and E2E tests
//!
//! These tests verify that call payloads recorded on spans flow through the
//! span database, the capture format and snapshot sync intact.

use std::io::BufReader;

use chrono::{DateTime, Duration, TimeZone, Utc};
use huginn_call::{Call, Dag, Literal, Type};
use huginn_trace::attrs::{DAG_CALL_ATTR, DAG_DIGEST_ATTR, DAG_OUTPUT_ATTR};
use huginn_trace::{
    CaptureReader, CaptureRecord, CaptureWriter, DataPoint, Db, FrontendOpts, KeyValue,
    MetricData, SnapshotWriter, SpanContext, SpanData, SpanId, TraceId, ingest_records,
    read_snapshot_batches,
};

fn sid(n: u8) -> SpanId {
    SpanId([0, 0, 0, 0, 0, 0, 9, n])
}

fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
}

fn span(id: u8, parent: Option<u8>, start: i64, end: i64) -> SpanData {
    SpanData {
        span_context: SpanContext::new(TraceId([5; 16]), sid(id)),
        parent_span_id: parent.map(sid).unwrap_or_default(),
        name: format!("span-{}", id),
        start_time: at(start),
        end_time: at(end),
        ..SpanData::default()
    }
}

fn with_call(mut data: SpanData, call: &Call) -> SpanData {
    data.attributes.push(KeyValue::new(DAG_DIGEST_ATTR, call.digest.as_str()));
    data.attributes.push(KeyValue::new(DAG_CALL_ATTR, call.encode()));
    data
}

/// `container.from("alpine").withExec(["echo"])`
fn pipeline() -> (Call, Call) {
    let from = Call::new("from")
        .with_type(Type::named("Container"))
        .with_arg("address", Literal::String("alpine".into()))
        .sealed();
    let exec = Call::new("withExec")
        .with_receiver(from.digest.clone())
        .with_type(Type::named("Container"))
        .with_arg(
            "args",
            Literal::List(vec![Literal::String("echo".into())]),
        )
        .sealed();
    (from, exec)
}

#[test]
fn span_call_payloads_resolve_and_rebuild_dag() {
    let (from, exec) = pipeline();
    let mut db = Db::new();
    db.export_spans(vec![
        span(1, None, 0, 10),
        with_call(span(2, Some(1), 1, 3), &from),
        with_call(span(3, Some(1), 4, 8), &exec),
    ]);

    let resolved = db.call(&exec.digest).unwrap();
    assert_eq!(resolved.display_self(), exec.display_self());
    assert_eq!(
        db.span(&sid(3)).unwrap().base.as_ref().map(|b| b.digest.clone()),
        Some(from.digest.clone())
    );

    let dag = db.span_call_dag(sid(3)).unwrap();
    assert_eq!(dag.calls_by_digest.len(), 2);

    let decoded = Dag::decode(&dag.encode()).unwrap();
    assert_eq!(decoded.root().map(|c| c.field.as_str()), Some("withExec"));
    assert!(decoded.calls_by_digest.contains_key(&from.digest));
}

#[test]
fn output_digest_resolves_through_creator() {
    let (from, _) = pipeline();
    let output = "sha256:container-state";
    let mut creator = with_call(span(2, Some(1), 1, 3), &from);
    creator.attributes.push(KeyValue::new(DAG_OUTPUT_ATTR, output));

    let mut db = Db::new();
    db.export_spans(vec![span(1, None, 0, 10), creator]);

    let call = db.call(output).unwrap();
    assert_eq!(call.digest, from.digest);
    assert!(db.call("sha256:unknown").is_none());
    assert_eq!(db.must_call("sha256:unknown").field, "no");
}

#[test]
fn load_from_id_spans_are_inlined() {
    let load = Call::new("loadContainerFromID")
        .with_type(Type::named("Container"))
        .with_arg("id", Literal::String("opaque".into()))
        .sealed();
    let mut db = Db::new();
    db.export_spans(vec![
        span(1, None, 0, 10),
        with_call(span(2, Some(1), 1, 9), &load),
        span(3, Some(2), 2, 4),
    ]);
    assert!(db.span(&sid(2)).unwrap().snapshot.passthrough);

    let rows: Vec<SpanId> = db
        .rows_view(&FrontendOpts::default())
        .rows
        .iter()
        .map(|r| r.span)
        .collect();
    assert_eq!(rows, vec![sid(3)]);

    let debug = FrontendOpts {
        debug: true,
        ..FrontendOpts::default()
    };
    let rows: Vec<SpanId> = db.rows_view(&debug).rows.iter().map(|r| r.span).collect();
    assert_eq!(rows, vec![sid(2), sid(3)]);
}

#[test]
fn capture_replay_feeds_spans_and_metrics() {
    let (from, _) = pipeline();
    let mut writer = CaptureWriter::new(Vec::new());
    writer
        .write(&CaptureRecord::Span(span(1, None, 0, 10)))
        .unwrap();
    writer
        .write(&CaptureRecord::Span(with_call(span(2, Some(1), 1, 3), &from)))
        .unwrap();
    writer
        .write(&CaptureRecord::Metrics(MetricData {
            name: "disk.bytes".into(),
            points: vec![DataPoint {
                attributes: vec![KeyValue::new(DAG_DIGEST_ATTR, from.digest.as_str())],
                time: at(2),
                value: 4096,
            }],
        }))
        .unwrap();
    let bytes = writer.into_inner().unwrap();

    let records: Vec<CaptureRecord> = CaptureReader::new(BufReader::new(bytes.as_slice()))
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 3);

    let mut db = Db::new();
    ingest_records(&mut db, records);
    assert_eq!(db.len(), 2);
    assert_eq!(db.call(&from.digest).unwrap().field, "from");
    assert_eq!(db.metrics_by_call[&from.digest]["disk.bytes"][0].value, 4096);
}

#[test]
fn snapshot_batches_carry_calls_to_mirror() {
    let (from, exec) = pipeline();
    let mut source = Db::new();
    source.export_spans(vec![
        span(1, None, 0, 10),
        with_call(span(2, Some(1), 1, 3), &from),
    ]);

    let mut writer = SnapshotWriter::new(Vec::new());
    assert!(writer.write_batch(&source.updated_snapshots(None)).unwrap());
    source.export_spans(vec![with_call(span(3, Some(1), 4, 8), &exec)]);
    assert!(writer.write_batch(&source.updated_snapshots(None)).unwrap());
    assert!(!writer.write_batch(&source.updated_snapshots(None)).unwrap());
    let bytes = writer.into_inner().unwrap();

    let batches = read_snapshot_batches(BufReader::new(bytes.as_slice())).unwrap();
    assert_eq!(batches.len(), 2);

    let mut mirror = Db::new();
    for batch in batches {
        mirror.import_snapshots(batch);
    }
    assert_eq!(mirror.len(), 3);
    assert_eq!(
        mirror.call(&exec.digest).unwrap().display_self(),
        exec.display_self()
    );
    assert_eq!(mirror.span_call_dag(sid(3)).unwrap().calls_by_digest.len(), 2);
    assert!(mirror.span(&sid(1)).unwrap().child_spans.contains(&sid(3)));
}

#[test]
fn replayed_root_completion_cancels_running_call_in_same_batch() {
    let (_, exec) = pipeline();
    let mut running = with_call(span(2, Some(1), 1, 0), &exec);
    running.end_time = DateTime::<Utc>::default();
    let root = span(1, None, 0, 20);

    for records in [
        vec![CaptureRecord::Span(root.clone()), CaptureRecord::Span(running.clone())],
        vec![CaptureRecord::Span(running.clone()), CaptureRecord::Span(root.clone())],
    ] {
        let mut writer = CaptureWriter::new(Vec::new());
        for record in &records {
            writer.write(record).unwrap();
        }
        let bytes = writer.into_inner().unwrap();
        let replayed: Vec<CaptureRecord> = CaptureReader::new(BufReader::new(bytes.as_slice()))
            .collect::<Result<_, _>>()
            .unwrap();

        let mut db = Db::new();
        ingest_records(&mut db, replayed);

        let child = db.span(&sid(2)).unwrap();
        assert!(!child.is_running());
        assert!(child.is_canceled(&db));
        assert_eq!(child.snapshot.end_time, at(20));
        assert!(db.span(&sid(1)).unwrap().running_spans.is_empty());
        assert_eq!(db.most_interesting_span(&exec.digest), Some(sid(2)));
    }
}
