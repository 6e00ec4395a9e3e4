//! Plain-text rendering of row views.

use chrono::{DateTime, Utc};
use huginn_trace::{Db, FrontendOpts, Span, format_duration, walk_tree};

/// Single-character status marker for a span.
pub fn status_glyph(db: &Db, span: &Span) -> &'static str {
    if span.is_running_or_effects_running() {
        "●"
    } else if span.is_failed_or_caused_failure(db) {
        "✘"
    } else if span.is_canceled(db) {
        "∅"
    } else if span.is_pending(db) {
        "?"
    } else if span.is_cached(db) {
        "$"
    } else {
        "✔"
    }
}

/// The span's call rendered as a selection when known, else its name.
pub fn span_label(db: &Db, span: &Span) -> String {
    let digest = &span.snapshot.call_digest;
    if !digest.is_empty() {
        if let Some(call) = db.call(digest) {
            return call.display_self();
        }
    }
    if !span.snapshot.message.is_empty() {
        return span.snapshot.message.clone();
    }
    span.name().to_string()
}

/// Render the visible tree, one span per line, indented by depth.
///
/// With `errors_only` the tree is pruned to the paths leading to failures.
pub fn render_rows(db: &Db, opts: &FrontendOpts, errors_only: bool, now: DateTime<Utc>) -> String {
    let view = db.rows_view(opts);
    let trees = if errors_only {
        db.collect_errors(&view)
    } else {
        view.body
    };

    let mut out = String::new();
    walk_tree(&trees, &mut |tree, depth| {
        let Some(span) = db.span(&tree.span) else {
            return false;
        };
        let duration = format_duration(span.snapshot.activity.duration(now));
        out.push_str(&format!(
            "{}{} {} {}",
            "  ".repeat(depth),
            status_glyph(db, span),
            span_label(db, span),
            duration
        ));
        if let Some(state) = db.roll_up_state(tree.span) {
            let done = state.success_count + state.cached_count;
            let total = done
                + state.pending_count
                + state.running_count
                + state.failed_count
                + state.canceled_count;
            out.push_str(&format!(" [{}/{}]", done, total));
        }
        out.push('\n');
        false
    });
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use huginn_call::Call;
    use huginn_trace::attrs::{DAG_CALL_ATTR, DAG_DIGEST_ATTR, UI_ROLLUP_ATTR};
    use huginn_trace::{KeyValue, SpanContext, SpanData, SpanId, SpanStatus, TraceId};

    fn sid(n: u8) -> SpanId {
        SpanId([0, 0, 0, 0, 0, 0, 2, n])
    }

    fn span(id: u8, parent: Option<u8>, start: i64, end: i64) -> SpanData {
        let base = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        SpanData {
            span_context: SpanContext::new(TraceId([3; 16]), sid(id)),
            parent_span_id: parent.map(sid).unwrap_or_default(),
            name: format!("task {}", id),
            start_time: base + Duration::seconds(start),
            end_time: base + Duration::seconds(end),
            ..SpanData::default()
        }
    }

    #[test]
    fn test_render_tree() {
        let call = Call::new("withExec").sealed();
        let mut exec = span(3, Some(2), 2, 5);
        exec.attributes = vec![
            KeyValue::new(DAG_DIGEST_ATTR, call.digest.as_str()),
            KeyValue::new(DAG_CALL_ATTR, call.encode()),
        ];
        exec.status = SpanStatus::error("exit 1");

        let mut db = Db::new();
        db.export_spans(vec![span(1, None, 0, 100), span(2, Some(1), 1, 62), exec]);

        let out = render_rows(&db, &FrontendOpts::default(), false, Utc::now());
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec!["✘ task 2 1m1s", "  ✘ withExec 3.0s"]);
    }

    #[test]
    fn test_render_errors_only() {
        let mut failed = span(3, Some(1), 10, 11);
        failed.status = SpanStatus::error("bad");
        let mut db = Db::new();
        db.export_spans(vec![span(1, None, 0, 100), span(2, Some(1), 1, 2), failed]);

        let out = render_rows(&db, &FrontendOpts::default(), true, Utc::now());
        assert_eq!(out, "✘ task 3 1.0s\n");
    }

    #[test]
    fn test_render_roll_up_progress() {
        let mut parent = span(2, Some(1), 1, 10);
        parent.attributes = vec![KeyValue::new(UI_ROLLUP_ATTR, true)];
        let mut db = Db::new();
        db.export_spans(vec![
            span(1, None, 0, 100),
            parent,
            span(3, Some(2), 2, 3),
            span(4, Some(2), 4, 5),
        ]);
        let out = render_rows(&db, &FrontendOpts::default(), false, Utc::now());
        assert!(out.lines().next().unwrap().ends_with("[2/2]"));
    }
}
