//! Tree and row views over a [`Db`].

use std::collections::{HashMap, HashSet};

use chrono::Duration;

use crate::db::Db;
use crate::ids::SpanId;
use crate::ordered_set::SpanSet;
use crate::span::{RollUpState, Span};

pub const HIDE_COMPLETED_VERBOSITY: i32 = 0;
pub const SHOW_COMPLETED_VERBOSITY: i32 = 1;
pub const EXPAND_COMPLETED_VERBOSITY: i32 = 2;
pub const SHOW_INTERNAL_VERBOSITY: i32 = 3;
pub const SHOW_ENCAPSULATED_VERBOSITY: i32 = 3;
pub const SHOW_SPAMMY_VERBOSITY: i32 = 4;

/// Presentation options for building views.
#[derive(Debug, Clone, Default)]
pub struct FrontendOpts {
    /// Show everything, including passthrough and hidden spans.
    pub debug: bool,
    pub verbosity: i32,
    /// Per-span verbosity overrides.
    pub span_verbosity: HashMap<SpanId, i32>,
    /// Span to show the children of, instead of the primary span.
    pub zoomed_span: Option<SpanId>,
    /// Show all children even when some were explicitly revealed.
    pub reveal_noisy_spans: bool,
}

impl FrontendOpts {
    pub fn verbosity_for(&self, id: SpanId) -> i32 {
        self.span_verbosity
            .get(&id)
            .copied()
            .unwrap_or(self.verbosity)
    }
}

/// A span and its visible children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceTree {
    pub span: SpanId,
    pub children: Vec<TraceTree>,
}

/// One line of a flattened tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Row {
    pub span: SpanId,
    pub depth: usize,
    pub has_children: bool,
    pub is_running: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RowsView {
    pub zoomed: Option<SpanId>,
    pub body: Vec<TraceTree>,
    pub rows: Vec<Row>,
}

impl Db {
    /// Whether a span is hidden at the effective verbosity.
    ///
    /// Internal spans need [`SHOW_INTERNAL_VERBOSITY`]. Encapsulated spans,
    /// and children of encapsulating spans, stay hidden unless their parent
    /// failed or the verbosity reaches [`SHOW_ENCAPSULATED_VERBOSITY`].
    pub fn hidden(&self, span: &Span, opts: &FrontendOpts) -> bool {
        let verbosity = opts.verbosity_for(span.id());
        if span.is_internal() && verbosity < SHOW_INTERNAL_VERBOSITY {
            return true;
        }
        if let Some(parent) = span.parent_span.and_then(|p| self.span(&p)) {
            if (span.snapshot.encapsulated || parent.snapshot.encapsulate)
                && !parent.is_failed()
                && verbosity < SHOW_ENCAPSULATED_VERBOSITY
            {
                return true;
            }
        }
        false
    }

    /// Revealed descendants stand in for the children unless noisy spans
    /// are requested. The flag says which set was returned.
    pub fn child_or_revealed_spans<'a>(&self, span: &'a Span, opts: &FrontendOpts) -> (&'a SpanSet, bool) {
        let verbosity = opts.verbosity_for(span.id());
        if !span.revealed_spans.is_empty()
            && !opts.reveal_noisy_spans
            && verbosity < SHOW_SPAMMY_VERBOSITY
        {
            (&span.revealed_spans, true)
        } else {
            (&span.child_spans, false)
        }
    }

    /// Build the visible tree under the zoomed span (or the primary span)
    /// and flatten it into rows.
    pub fn rows_view(&self, opts: &FrontendOpts) -> RowsView {
        let zoomed = opts
            .zoomed_span
            .filter(SpanId::is_valid)
            .or_else(|| self.primary_span.is_valid().then_some(self.primary_span))
            .or(self.root_span);

        let mut seen = HashSet::new();
        let body = match zoomed {
            Some(id) => {
                seen.insert(id);
                self.tree_children(id, opts, &mut seen)
            }
            None => Vec::new(),
        };

        let mut rows = Vec::new();
        walk_tree(&body, &mut |tree, depth| {
            rows.push(Row {
                span: tree.span,
                depth,
                has_children: !tree.children.is_empty(),
                is_running: self
                    .span(&tree.span)
                    .is_some_and(Span::is_running_or_effects_running),
            });
            false
        });

        RowsView { zoomed, body, rows }
    }

    fn tree_children(&self, id: SpanId, opts: &FrontendOpts, seen: &mut HashSet<SpanId>) -> Vec<TraceTree> {
        let Some(span) = self.span(&id) else {
            return Vec::new();
        };
        let (set, _) = self.child_or_revealed_spans(span, opts);
        let mut children: Vec<&Span> = set.iter().filter_map(|c| self.span(c)).collect();
        children.sort_by_key(|c| c.snapshot.start_time);

        let mut out = Vec::new();
        for child in children {
            let child_id = child.id();
            if !seen.insert(child_id) || child.snapshot.ignore {
                continue;
            }
            if !opts.debug {
                if child.snapshot.passthrough {
                    out.extend(self.tree_children(child_id, opts, seen));
                    continue;
                }
                if self.hidden(child, opts) {
                    continue;
                }
            }
            out.push(TraceTree {
                span: child_id,
                children: self.tree_children(child_id, opts, seen),
            });
        }
        out
    }

    /// Prune a view to the paths leading to failures.
    ///
    /// Failure is searched below failed spans and spans with no status yet;
    /// subtrees under successful spans are left out.
    pub fn collect_errors(&self, rows: &RowsView) -> Vec<TraceTree> {
        let mut failed = HashSet::new();
        for tree in &rows.body {
            self.collect_failed(tree, &mut failed);
        }
        retain_paths(&rows.body, &failed)
    }

    fn collect_failed(&self, tree: &TraceTree, failed: &mut HashSet<SpanId>) {
        let Some(span) = self.span(&tree.span) else {
            return;
        };
        let is_failed = span.is_failed_or_caused_failure(self);
        if is_failed {
            failed.insert(tree.span);
        }
        if is_failed || span.is_unset() {
            for child in &tree.children {
                self.collect_failed(child, failed);
            }
        }
    }

    /// Progress counts over every descendant of a roll-up span.
    pub fn roll_up_state(&self, id: SpanId) -> Option<RollUpState> {
        let span = self.span(&id)?;
        if !span.snapshot.roll_up {
            return None;
        }

        let mut seen = HashSet::from([id]);
        let mut stack: Vec<SpanId> = span.child_spans.iter().rev().copied().collect();
        let mut state = RollUpState::default();
        let mut any = false;
        while let Some(next) = stack.pop() {
            if !seen.insert(next) {
                continue;
            }
            let Some(child) = self.span(&next) else {
                continue;
            };
            any = true;
            if child.is_running_or_effects_running() {
                state.running_count += 1;
            } else if child.is_pending(self) {
                state.pending_count += 1;
            } else if child.is_cached(self) {
                state.cached_count += 1;
            } else if child.is_canceled(self) {
                state.canceled_count += 1;
            } else if child.is_failed_or_caused_failure(self) {
                state.failed_count += 1;
            } else {
                state.success_count += 1;
            }
            stack.extend(child.child_spans.iter().rev().copied());
        }
        any.then_some(state)
    }
}

/// Visit trees depth-first. Returning `true` from `f` skips the remaining
/// siblings at that level.
pub fn walk_tree(trees: &[TraceTree], f: &mut impl FnMut(&TraceTree, usize) -> bool) {
    walk_level(trees, 0, f);
}

fn walk_level(trees: &[TraceTree], depth: usize, f: &mut impl FnMut(&TraceTree, usize) -> bool) {
    for tree in trees {
        if f(tree, depth) {
            return;
        }
        walk_level(&tree.children, depth + 1, f);
    }
}

fn contains_any(tree: &TraceTree, targets: &HashSet<SpanId>) -> bool {
    targets.contains(&tree.span) || tree.children.iter().any(|c| contains_any(c, targets))
}

fn retain_paths(trees: &[TraceTree], targets: &HashSet<SpanId>) -> Vec<TraceTree> {
    trees
        .iter()
        .filter(|tree| contains_any(tree, targets))
        .map(|tree| TraceTree {
            span: tree.span,
            children: retain_paths(&tree.children, targets),
        })
        .collect()
}

/// Render a duration as `1.5s`, `2m3s`, `1h2m3s` or `1d2h3m4s`.
pub fn format_duration(d: Duration) -> String {
    if d < Duration::zero() {
        return "INVALID_DURATION".to_string();
    }

    let total = d.num_seconds();
    let days = total / 86_400;
    let hours = (total / 3_600) % 24;
    let minutes = (total / 60) % 60;
    let seconds = d.num_milliseconds() as f64 / 1000.0
        - (days * 86_400 + hours * 3_600 + minutes * 60) as f64;

    if d < Duration::minutes(1) {
        format!("{:.1}s", seconds)
    } else if d < Duration::hours(1) {
        format!("{}m{}s", minutes, seconds.round() as i64)
    } else if d < Duration::hours(24) {
        format!("{}h{}m{}s", hours, minutes, seconds.round() as i64)
    } else {
        format!("{}d{}h{}m{}s", days, hours, minutes, seconds.round() as i64)
    }
}
