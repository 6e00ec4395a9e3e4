//! The span aggregator.
//!
//! [`Db`] ingests batches of telemetry, integrates every span into a graph of
//! parent, child and causal-link relationships, maintains digest, effect and
//! output indices, and rolls status and activity up through the graph one
//! event at a time.
//!
//! The database owns every [`Span`]; relationships are span IDs resolved
//! against it. It does no locking of its own, so callers sharing one
//! between tasks wrap it in a mutex.
//!
//! # Synchronization
//!
//! Every local change bumps the span's version and marks it dirty.
//! [`Db::updated_snapshots`] drains the dirty set into snapshots for a
//! remote mirror, which applies them with [`Db::import_snapshots`]. Import
//! adds the existing version to the incoming one, so replaying a batch never
//! moves a span backwards.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huginn_call::{Argument, Call, CallResolver, Dag, Literal, Type};
use tracing::{debug, trace, warn};

use crate::activity::SpanInterval;
use crate::attrs::{AttrValue, DAG_DIGEST_ATTR, LOGS_VERBOSE_ATTR, METRICS_SPAN_ID_ATTR, STDIO_EOF_ATTR};
use crate::ids::SpanId;
use crate::ordered_set::SpanSet;
use crate::span::{Span, SpanSnapshot, StatusCode};
use crate::telemetry::{DataPoint, LogRecord, MetricData, Resource, SpanData};

/// Session-scoped span aggregator.
#[derive(Debug, Default)]
pub struct Db {
    /// Span whose children are shown by default; the root unless overridden.
    pub primary_span: SpanId,
    /// Buffered logs of the primary span.
    pub primary_logs: HashMap<SpanId, Vec<LogRecord>>,

    /// Earliest start and latest end seen in the session.
    pub epoch: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,

    spans: HashMap<SpanId, Span>,
    span_order: SpanSet,
    pub root_span: Option<SpanId>,

    pub resources: Vec<Resource>,

    calls: RefCell<HashMap<String, Arc<Call>>>,
    call_payloads: HashMap<String, String>,

    /// call digest -> outputs it produced
    pub(crate) outputs: HashMap<String, BTreeSet<String>>,
    /// output -> call digests that produced it
    pub(crate) output_of: HashMap<String, BTreeSet<String>>,
    /// output -> spans that produced it
    pub(crate) creator_spans: HashMap<String, SpanSet>,
    /// call digest -> start time -> span
    pub(crate) intervals: HashMap<String, BTreeMap<DateTime<Utc>, SpanId>>,

    /// effect ID -> spans that installed it
    pub(crate) cause_spans: HashMap<String, SpanSet>,
    /// effect ID -> spans that fulfilled it
    pub(crate) effect_spans: HashMap<String, SpanSet>,
    pub(crate) completed_effects: HashSet<String>,
    pub(crate) failed_effects: HashSet<String>,

    /// call digest -> metric name -> points
    pub metrics_by_call: HashMap<String, HashMap<String, Vec<DataPoint>>>,
    /// span -> metric name -> points
    pub metrics_by_span: HashMap<SpanId, HashMap<String, Vec<DataPoint>>>,

    updated_spans: SpanSet,
    seen_spans: HashSet<SpanId>,
    /// Spans canceled during integration, propagated with the batch.
    orphans: Vec<SpanId>,
}

/// What a span contributes to the spans above it.
struct Contribution {
    id: SpanId,
    running: bool,
    failed: bool,
    canceled: bool,
    reveal: bool,
    interval: SpanInterval,
}

impl Db {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn span(&self, id: &SpanId) -> Option<&Span> {
        self.spans.get(id)
    }

    /// All spans, parents generally before their children.
    pub fn spans(&self) -> impl Iterator<Item = &Span> + '_ {
        self.span_order.iter().filter_map(|id| self.spans.get(id))
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    /// Spans changed since the last [`Db::updated_snapshots`].
    pub fn dirty_spans(&self) -> &[SpanId] {
        self.updated_spans.as_slice()
    }

    pub(crate) fn span_name(&self, id: &SpanId) -> String {
        match self.spans.get(id) {
            Some(span) if !span.name().is_empty() => span.name().to_string(),
            _ => id.to_string(),
        }
    }

    /// Override the primary span. Nested clients never see the real root,
    /// so they point this at the span they created.
    pub fn set_primary_span(&mut self, id: SpanId) {
        self.primary_span = id;
    }

    /// Register a call directly, e.g. one decoded from an ID elsewhere.
    pub fn add_call(&self, call: Call) {
        self.calls
            .borrow_mut()
            .insert(call.digest.clone(), Arc::new(call));
    }

    /// Look up or allocate a span, keeping it in the ordered listing.
    fn init_span(&mut self, id: SpanId) -> &mut Span {
        self.span_order.add(id);
        self.spans.entry(id).or_insert_with(|| Span::new(id))
    }

    fn update(&mut self, id: SpanId) {
        let Some(span) = self.spans.get_mut(&id) else {
            return;
        };
        // the remote is the source of truth for final spans
        if span.snapshot.r#final {
            return;
        }
        span.snapshot.version += 1;
        self.updated_spans.add(id);
    }

    // ---- ingestion ----------------------------------------------------

    /// Ingest a batch of exported spans.
    ///
    /// Every span is recorded and integrated before any status is
    /// propagated, so the result does not depend on order within the batch.
    pub fn export_spans(&mut self, batch: Vec<SpanData>) {
        let mut ids = Vec::with_capacity(batch.len());
        for data in batch {
            if let Some(id) = self.record_span(data) {
                ids.push(id);
            }
        }
        self.propagate_batch(ids);
    }

    /// Apply snapshots from a remote aggregator.
    pub fn import_snapshots(&mut self, snapshots: Vec<SpanSnapshot>) {
        let mut ids = Vec::with_capacity(snapshots.len());
        for mut snapshot in snapshots {
            let id = snapshot.id;
            if !id.is_valid() {
                warn!("Skipping snapshot with invalid span ID");
                continue;
            }
            let span = self.spans.entry(id).or_insert_with(|| Span::new(id));
            span.received = true;
            snapshot.version += span.snapshot.version;
            span.snapshot = snapshot;
            self.integrate_span(id);
            ids.push(id);
        }
        self.propagate_batch(ids);
    }

    fn propagate_batch(&mut self, ids: Vec<SpanId>) {
        // after the whole batch is recorded, whatever order it arrived in
        if let Some(root_end) = self.root_end() {
            self.cancel_orphans(root_end);
        }
        let orphans = std::mem::take(&mut self.orphans);
        for id in ids.into_iter().chain(orphans) {
            self.propagate_status_to_parents_and_links(id);
        }
    }

    fn record_span(&mut self, data: SpanData) -> Option<SpanId> {
        let id = data.span_id();
        if !id.is_valid() {
            warn!(name = %data.name, "Skipping span with invalid span ID");
            return None;
        }
        if let Some(resource) = &data.resource {
            self.record_resource(resource);
        }

        let span = self.spans.entry(id).or_insert_with(|| Span::new(id));
        span.received = true;
        let snapshot = &mut span.snapshot;
        snapshot.parent_id = data.parent_span_id;
        snapshot.name = data.name;
        snapshot.start_time = data.start_time;
        snapshot.end_time = data.end_time;
        snapshot.status = data.status;
        snapshot.links = data.links;
        for kv in &data.attributes {
            snapshot.process_attribute(&kv.key, &kv.value);
        }

        self.integrate_span(id);
        Some(id)
    }

    fn record_resource(&mut self, resource: &Resource) {
        let canonical = resource.canonical();
        if !self.resources.iter().any(|r| r.canonical() == canonical) {
            self.resources.push(resource.clone());
        }
    }

    /// Wire a freshly recorded span into the graph and indices.
    fn integrate_span(&mut self, id: SpanId) {
        trace!(span = %id, "Integrating span");

        let Some(span) = self.spans.get_mut(&id) else {
            return;
        };
        if !span.snapshot.r#final {
            let own = span.snapshot.interval();
            span.snapshot.activity.add(&own);
        }
        let snap = span.snapshot.clone();
        self.update(id);

        if snap.start_time != DateTime::<Utc>::default()
            && self.epoch.is_none_or(|epoch| snap.start_time < epoch)
        {
            self.epoch = Some(snap.start_time);
        }
        if !snap.is_running() && self.end.is_none_or(|end| snap.end_time > end) {
            self.end = Some(snap.end_time);
        }

        self.wire_parent(id, &snap);
        self.wire_links(id, &snap);

        if !snap.call_digest.is_empty() {
            self.intervals
                .entry(snap.call_digest.clone())
                .or_default()
                .insert(snap.start_time, id);
            if !snap.call_payload.is_empty() {
                self.call_payloads
                    .insert(snap.call_digest.clone(), snap.call_payload.clone());
            }
            self.apply_call(id, &snap);
        }

        if !snap.parent_id.is_valid() {
            if self.root_span.is_none() {
                self.root_span = Some(id);
            }
            if !self.primary_span.is_valid() {
                self.primary_span = id;
            }
        }

        self.index_effects(id, &snap);

        if !snap.call_digest.is_empty() && !snap.output.is_empty() {
            self.outputs
                .entry(snap.call_digest.clone())
                .or_default()
                .insert(snap.output.clone());
            self.output_of
                .entry(snap.output.clone())
                .or_default()
                .insert(snap.call_digest.clone());
            self.creator_spans
                .entry(snap.output.clone())
                .or_default()
                .add(id);
        }

        self.span_order.add(id);
    }

    /// Parentage is ignored for spans with links; the links say where the
    /// work really came from.
    fn wire_parent(&mut self, id: SpanId, snap: &SpanSnapshot) {
        let new_parent = (snap.parent_id.is_valid() && snap.parent_id != id && snap.links.is_empty())
            .then_some(snap.parent_id);
        let old_parent = self.spans.get(&id).and_then(|s| s.parent_span);

        if let Some(old) = old_parent.filter(|old| Some(*old) != new_parent) {
            if let Some(parent) = self.spans.get_mut(&old) {
                if parent.child_spans.remove(&id) {
                    self.update(old);
                }
            }
        }
        if let Some(span) = self.spans.get_mut(&id) {
            span.parent_span = new_parent;
        }
        if let Some(parent_id) = new_parent {
            // new child: the parent's snapshot needs a fresh child count
            if self.init_span(parent_id).child_spans.add(id) {
                self.update(parent_id);
            }
        }
    }

    fn wire_links(&mut self, id: SpanId, snap: &SpanSnapshot) {
        for link in &snap.links {
            let target = link.span_context.span_id;
            if !target.is_valid() || target == id {
                continue;
            }
            let linked = self.init_span(target);
            let added = linked.child_spans.add(id);
            linked.linked_from.add(id);
            if added {
                self.update(target);
            }
            if let Some(span) = self.spans.get_mut(&id) {
                span.links_to.add(target);
            }
        }
    }

    fn apply_call(&mut self, id: SpanId, snap: &SpanSnapshot) {
        let Some(call) = self.call(&snap.call_digest) else {
            return;
        };
        let type_name = call.r#type.as_ref().map(|t| t.name()).unwrap_or_default();
        // loading an ID is only interesting for what it evaluates
        let passthrough = call.field == format!("load{}FromID", type_name) || call.field == "sync";
        let ignore = call.field == "id";
        let base = if call.receiver_digest.is_empty() {
            None
        } else {
            self.call(&call.receiver_digest)
                .map(|receiver| self.simplify(receiver, snap.internal))
        };

        if let Some(span) = self.spans.get_mut(&id) {
            span.snapshot.passthrough |= passthrough;
            span.snapshot.ignore |= ignore;
            if base.is_some() {
                span.base = base;
            }
        }
    }

    fn index_effects(&mut self, id: SpanId, snap: &SpanSnapshot) {
        if !snap.effect_id.is_empty() {
            self.effect_spans
                .entry(snap.effect_id.clone())
                .or_default()
                .add(id);
            if snap.status.code == StatusCode::Error {
                self.failed_effects.insert(snap.effect_id.clone());
            }
            self.cause_spans.entry(snap.effect_id.clone()).or_default();
        }
        for effect in &snap.effect_ids {
            self.effect_spans.entry(effect.clone()).or_default();
            self.cause_spans.entry(effect.clone()).or_default().add(id);
        }
        for effect in &snap.effects_completed {
            self.completed_effects.insert(effect.clone());
        }
        if let Some(span) = self.spans.get_mut(&id) {
            span.causes_via_attrs = (!snap.effect_id.is_empty()).then(|| snap.effect_id.clone());
            span.effects_via_attrs = snap.effect_ids.clone();
        }
    }

    /// End time of the root span, once it has completed.
    fn root_end(&self) -> Option<DateTime<Utc>> {
        let root = self.spans.get(&self.root_span?)?;
        (!root.is_running()).then_some(root.snapshot.end_time)
    }

    /// The root finished while spans were still open; they will never
    /// complete, so mark them canceled at the root's end time.
    fn cancel_orphans(&mut self, root_end: DateTime<Utc>) {
        let running: Vec<SpanId> = self
            .span_order
            .iter()
            .filter(|id| {
                self.spans
                    .get(id)
                    .is_some_and(|s| s.received && !s.snapshot.r#final && s.is_running())
            })
            .copied()
            .collect();
        for id in running {
            let Some(span) = self.spans.get_mut(&id) else {
                continue;
            };
            debug!(span = %id, name = %span.name(), "Canceling orphaned span");
            span.snapshot.canceled = true;
            span.snapshot.end_time = root_end.max(span.snapshot.start_time);
            let own = span.snapshot.interval();
            span.snapshot.activity.add(&own);
            self.update(id);
            self.orphans.push(id);
        }
    }

    // ---- propagation --------------------------------------------------

    /// Roll a span's running, failed and canceled state and its activity up
    /// into the spans above it.
    ///
    /// Every ancestor tracks the span in its running and failed sets. Causal
    /// spans (link targets, transitively, plus the installers of the span's
    /// effect) also track cancellation and absorb the span's activity, as do
    /// their ancestors. Work is proportional to depth, not tree size.
    pub fn propagate_status_to_parents_and_links(&mut self, id: SpanId) {
        let Some(span) = self.spans.get(&id) else {
            return;
        };
        let contribution = Contribution {
            id,
            running: span.is_running_or_effects_running(),
            failed: span.is_failed(),
            canceled: span.is_canceled(self),
            reveal: span.snapshot.reveal,
            interval: span.snapshot.interval(),
        };

        for parent in self.ancestors(id) {
            self.contribute(parent, &contribution, false, false);
        }
        for causal in self.causal_spans(id) {
            self.contribute(causal, &contribution, true, true);
            for parent in self.ancestors(causal) {
                self.contribute(parent, &contribution, false, true);
            }
        }
    }

    fn contribute(&mut self, target: SpanId, c: &Contribution, causal: bool, activity: bool) {
        let Some(span) = self.spans.get_mut(&target) else {
            return;
        };
        let mut changed = if c.running {
            span.running_spans.add(c.id)
        } else {
            span.running_spans.remove(&c.id)
        };
        changed |= if c.failed {
            span.failed_spans.add(c.id)
        } else {
            span.failed_spans.remove(&c.id)
        };
        if c.reveal {
            changed |= span.revealed_spans.add(c.id);
        }
        if causal {
            changed |= if c.canceled {
                span.canceled_spans.add(c.id)
            } else {
                span.canceled_spans.remove(&c.id)
            };
        }
        if activity && !span.snapshot.r#final {
            changed |= span.snapshot.activity.add(&c.interval);
        }
        if changed {
            self.update(target);
        }
    }

    /// Parent chain of a span, nearest first.
    pub fn ancestors(&self, id: SpanId) -> Vec<SpanId> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id]);
        let mut current = self.spans.get(&id).and_then(|s| s.parent_span);
        while let Some(parent) = current {
            if !seen.insert(parent) {
                break;
            }
            out.push(parent);
            current = self.spans.get(&parent).and_then(|s| s.parent_span);
        }
        out
    }

    /// Spans that caused this one: link targets and the spans that
    /// installed its effect, followed transitively.
    pub fn causal_spans(&self, id: SpanId) -> Vec<SpanId> {
        let mut out = Vec::new();
        let mut seen = HashSet::from([id]);
        self.visit_causes(id, &mut seen, &mut out);
        out
    }

    fn visit_causes(&self, id: SpanId, seen: &mut HashSet<SpanId>, out: &mut Vec<SpanId>) {
        let Some(span) = self.spans.get(&id) else {
            return;
        };
        let mut causes: Vec<SpanId> = span.links_to.iter().copied().collect();
        if let Some(cause_set) = span
            .causes_via_attrs
            .as_ref()
            .and_then(|effect| self.cause_spans.get(effect))
        {
            for cause in cause_set {
                // a span cannot be caused by one that started after it
                let started_after = self
                    .spans
                    .get(cause)
                    .is_some_and(|c| span.snapshot.start_time < c.snapshot.start_time);
                if !started_after {
                    causes.push(*cause);
                }
            }
        }
        for cause in causes {
            if seen.insert(cause) {
                out.push(cause);
                self.visit_causes(cause, seen, out);
            }
        }
    }

    /// Spans that fulfil this span's effects: linked spans if any, else the
    /// spans carrying its installed effect IDs.
    pub fn effect_spans_of(&self, id: SpanId) -> Vec<SpanId> {
        let Some(span) = self.spans.get(&id) else {
            return Vec::new();
        };
        if !span.linked_from.is_empty() {
            return span.linked_from.iter().copied().collect();
        }
        span.effects_via_attrs
            .iter()
            .filter_map(|effect| self.effect_spans.get(effect))
            .flat_map(|set| set.iter().copied())
            .collect()
    }

    // ---- digests and calls --------------------------------------------

    /// Pick the span that best represents a call digest.
    ///
    /// A running span wins outright. Otherwise a non-cached span beats a
    /// cached one, and among equals the earliest start wins.
    pub fn most_interesting_span(&self, digest: &str) -> Option<SpanId> {
        let by_start = self.intervals.get(digest)?;
        let mut earliest: Option<(SpanId, bool)> = None;
        for id in by_start.values() {
            let Some(span) = self.spans.get(id) else {
                continue;
            };
            if span.is_running_or_effects_running() {
                return Some(*id);
            }
            let cached = span.is_cached(self);
            let replace = match earliest {
                None => true,
                // cached never overrides non-cached
                Some((_, earliest_cached)) => earliest_cached && !cached,
            };
            if replace {
                earliest = Some((*id, cached));
            }
        }
        earliest.map(|(id, _)| id)
    }

    /// Most interesting span for the simplified form of `call`.
    pub fn high_level_span(&self, call: &Call) -> Option<SpanId> {
        let simplified = self.simplify(Arc::new(call.clone()), false);
        self.most_interesting_span(&simplified.digest)
    }

    /// Resolve a call by digest.
    ///
    /// Strategies, in order:
    /// 1. a call already decoded or registered;
    /// 2. decoding the payload a span carried for the digest;
    /// 3. the call of a span that produced the digest as its output, asking
    ///    creators in the order they were seen and taking the first answer.
    pub fn call(&self, digest: &str) -> Option<Arc<Call>> {
        let mut visiting = HashSet::new();
        self.resolve_call_via(digest, &mut visiting)
    }

    fn resolve_call_via(&self, digest: &str, visiting: &mut HashSet<String>) -> Option<Arc<Call>> {
        if digest.is_empty() {
            return None;
        }
        if let Some(call) = self.known_call(digest) {
            return Some(call);
        }
        if !visiting.insert(digest.to_string()) {
            return None;
        }
        self.creator_spans.get(digest)?.iter().find_map(|creator| {
            let creator_digest = &self.spans.get(creator)?.snapshot.call_digest;
            if creator_digest.is_empty() || creator_digest == digest {
                return None;
            }
            self.resolve_call_via(creator_digest, visiting)
        })
    }

    /// Strategies 1 and 2 of [`Db::call`].
    fn known_call(&self, digest: &str) -> Option<Arc<Call>> {
        let cached = self.calls.borrow().get(digest).cloned();
        if cached.is_some() {
            return cached;
        }
        let payload = self.call_payloads.get(digest)?;
        match Call::decode(payload) {
            Ok(call) => {
                let call = Arc::new(call);
                self.calls
                    .borrow_mut()
                    .insert(digest.to_string(), Arc::clone(&call));
                Some(call)
            }
            Err(e) => {
                warn!(digest, error = %e, "Failed to decode call payload");
                None
            }
        }
    }

    /// Like [`Db::call`], but substitutes a placeholder selecting `no` with
    /// the digest as an argument when nothing is known.
    pub fn must_call(&self, digest: &str) -> Arc<Call> {
        self.call(digest).unwrap_or_else(|| {
            debug!(digest, "Call not yet known");
            Arc::new(Call {
                field: "no".to_string(),
                r#type: Some(Type::named("Missing")),
                args: vec![Argument::new("digest", Literal::String(digest.to_string()))],
                digest: digest.to_string(),
                ..Call::default()
            })
        })
    }

    /// Rough display size of a call: one per selection and argument plus the
    /// size of every argument, following receivers.
    pub fn id_size(&self, call: &Call) -> usize {
        enum Step {
            Call(Arc<Call>),
            Lit(Literal),
            Leave(String),
        }

        // worklist rather than recursion: receiver chains can be very long
        let mut size = 0;
        let mut path = HashSet::new();
        let mut work = vec![Step::Call(Arc::new(call.clone()))];
        while let Some(step) = work.pop() {
            match step {
                Step::Call(call) => {
                    if !call.digest.is_empty() {
                        if !path.insert(call.digest.clone()) {
                            size += 1;
                            continue;
                        }
                        work.push(Step::Leave(call.digest.clone()));
                    }
                    size += 1 + call.args.len();
                    work.extend(call.args.iter().map(|arg| Step::Lit(arg.value.clone())));
                    if let Some(receiver) = self.known_call(&call.receiver_digest) {
                        work.push(Step::Call(receiver));
                    }
                }
                Step::Lit(Literal::CallDigest(digest)) => work.push(Step::Call(self.must_call(&digest))),
                Step::Lit(Literal::List(values)) => work.extend(values.into_iter().map(Step::Lit)),
                Step::Lit(Literal::Object(fields)) => {
                    work.extend(fields.into_iter().map(|f| Step::Lit(f.value)))
                }
                Step::Lit(_) => size += 1,
                Step::Leave(digest) => {
                    path.remove(&digest);
                }
            }
        }
        size
    }

    /// Rewrite a call into the smallest known call that produced its result,
    /// repeating until nothing smaller is known.
    ///
    /// Creators equal to the call, or referencing it in their arguments, are
    /// skipped. With `force`, the first step takes the smallest creator even
    /// if it is larger than the call itself.
    pub fn simplify(&self, call: Arc<Call>, force: bool) -> Arc<Call> {
        let mut current = call;
        let mut visited = HashSet::new();
        let mut first = true;
        loop {
            visited.insert(current.digest.clone());
            let limit = if first && force {
                None
            } else {
                Some(self.id_size(&current))
            };
            first = false;

            let Some(creators) = self.output_of.get(&current.digest) else {
                return current;
            };
            let mut best: Option<(usize, Arc<Call>)> = None;
            for creator_digest in creators {
                if visited.contains(creator_digest) {
                    continue;
                }
                let Some(creator) = self.known_call(creator_digest) else {
                    continue;
                };
                if creator.inputs().iter().any(|d| *d == current.digest) {
                    continue;
                }
                let size = self.id_size(&creator);
                let beats_limit = limit.is_none_or(|limit| size < limit);
                let beats_best = best.as_ref().is_none_or(|(best, _)| size < *best);
                if beats_limit && beats_best {
                    best = Some((size, creator));
                }
            }
            match best {
                Some((_, creator)) => current = creator,
                None => return current,
            }
        }
    }

    /// The DAG of a span's call, for re-encoding as an opaque ID.
    pub fn span_call_dag(&self, id: SpanId) -> Option<Dag> {
        let span = self.spans.get(&id)?;
        let call = self.call(&span.snapshot.call_digest)?;
        Some(Dag::extract(&call.digest, self))
    }

    // ---- snapshots ----------------------------------------------------

    /// Export a span's state with derived flags filled in. The copy is
    /// marked final.
    pub fn snapshot(&self, id: &SpanId) -> Option<SpanSnapshot> {
        let span = self.spans.get(id)?;
        let mut snap = span.snapshot.clone();
        let mut seen = HashSet::from([*id]);
        snap.child_count = self.count_children(&span.child_spans, false, &mut seen);
        (snap.failed_, snap.failed_reason_) = span.failed_reason(self);
        (snap.cached_, snap.cached_reason_) = span.cached_reason(self);
        (snap.pending_, snap.pending_reason_) = span.pending_reason(self);
        (snap.canceled_, snap.canceled_reason_) = span.canceled_reason(self);
        snap.r#final = true;
        Some(snap)
    }

    /// Children, looking through passthrough spans unless debugging.
    pub(crate) fn count_children(&self, set: &SpanSet, debug: bool, seen: &mut HashSet<SpanId>) -> usize {
        let mut count = 0;
        for id in set {
            if !seen.insert(*id) {
                continue;
            }
            match self.spans.get(id) {
                Some(child) if child.snapshot.passthrough && !debug => {
                    count += self.count_children(&child.child_spans, debug, seen);
                }
                _ => count += 1,
            }
        }
        count
    }

    /// Whether `pred` holds for the span, or for its nearest passthrough
    /// ancestors.
    pub fn matches(&self, id: SpanId, pred: impl Fn(&Span) -> bool) -> bool {
        let mut seen = HashSet::new();
        let mut current = id;
        loop {
            let Some(span) = self.spans.get(&current) else {
                return false;
            };
            if pred(span) {
                return true;
            }
            let Some(parent) = span.parent_span else {
                return false;
            };
            let passthrough = self
                .spans
                .get(&parent)
                .is_some_and(|p| p.snapshot.passthrough);
            if !passthrough || !seen.insert(parent) {
                return false;
            }
            current = parent;
        }
    }

    fn surfaced(&self, span: &Span, filter: Option<&HashSet<SpanId>>) -> bool {
        if filter.is_none_or(|filter| filter.contains(&span.snapshot.parent_id)) {
            return true;
        }
        // failures are always sent so they can be summarized
        if span.is_failed_or_caused_failure(self) || span.snapshot.reveal {
            return true;
        }
        span.snapshot.passthrough
            && span.child_spans.iter().any(|child| {
                self.spans
                    .get(child)
                    .is_some_and(|c| c.is_failed_or_caused_failure(self))
            })
    }

    /// Drain the dirty set into snapshots.
    ///
    /// Includes dirty spans whose parent is in `filter` (all dirty spans
    /// when `filter` is `None`), dirty spans that failed, are revealed or
    /// are passthrough with a failed child, and any not yet sent span in
    /// `filter` along with its unsent ancestors.
    pub fn updated_snapshots(&mut self, filter: Option<&HashSet<SpanId>>) -> Vec<SpanSnapshot> {
        let mut ids = Vec::new();
        let mut included = HashSet::new();
        for id in self.updated_spans.iter() {
            if self.matches(*id, |span| self.surfaced(span, filter)) && included.insert(*id) {
                ids.push(*id);
            }
        }
        if let Some(filter) = filter {
            let mut subscribed: Vec<SpanId> = filter.iter().copied().collect();
            subscribed.sort();
            for id in subscribed {
                if !self.spans.contains_key(&id) {
                    continue;
                }
                for candidate in std::iter::once(id).chain(self.ancestors(id)) {
                    if !self.seen_spans.contains(&candidate) && included.insert(candidate) {
                        ids.push(candidate);
                    }
                }
            }
        }

        let snapshots = ids.iter().filter_map(|id| self.snapshot(id)).collect();
        self.seen_spans.extend(ids);
        self.updated_spans.clear();
        snapshots
    }

    /// A span, its direct children and its unsent ancestors.
    pub fn span_snapshots(&mut self, id: SpanId) -> Vec<SpanSnapshot> {
        let mut ids: Vec<SpanId> = self
            .span_order
            .iter()
            .copied()
            .filter(|candidate| {
                self.matches(*candidate, |span| {
                    span.snapshot.parent_id == id || span.id() == id
                })
            })
            .collect();
        for parent in self.ancestors(id) {
            if !self.seen_spans.contains(&parent) && !ids.contains(&parent) {
                ids.push(parent);
            }
        }
        let snapshots = ids.iter().filter_map(|id| self.snapshot(id)).collect();
        self.seen_spans.extend(ids);
        snapshots
    }

    /// Every span not yet sent.
    pub fn remaining_snapshots(&self) -> Vec<SpanSnapshot> {
        self.span_order
            .iter()
            .filter(|id| !self.seen_spans.contains(*id))
            .filter_map(|id| self.snapshot(id))
            .collect()
    }

    // ---- logs, metrics, resources -------------------------------------

    /// Ingest log records.
    ///
    /// Empty bodies and end-of-stream markers are skipped. Logs of the
    /// primary span are buffered for replay; any other non-verbose log
    /// marks its span as having logs.
    pub fn export_logs(&mut self, records: Vec<LogRecord>) {
        for log in records {
            if log.body.is_empty() || log.flag(STDIO_EOF_ATTR) {
                continue;
            }
            let id = log.span_id;
            if !id.is_valid() {
                continue;
            }
            let verbose = log.flag(LOGS_VERBOSE_ATTR);
            if id == self.primary_span {
                self.primary_logs.entry(id).or_default().push(log);
            }
            if verbose {
                continue;
            }
            let span = self.init_span(id);
            if !span.snapshot.has_logs {
                span.snapshot.has_logs = true;
                self.update(id);
            }
        }
    }

    /// Ingest gauge points keyed by call digest or span ID. Points carrying
    /// neither are dropped.
    pub fn export_metrics(&mut self, metrics: Vec<MetricData>) {
        for metric in metrics {
            for point in metric.points {
                if let Some(AttrValue::String(digest)) = point.attribute(DAG_DIGEST_ATTR) {
                    let digest = digest.clone();
                    self.metrics_by_call
                        .entry(digest)
                        .or_default()
                        .entry(metric.name.clone())
                        .or_default()
                        .push(point);
                    continue;
                }
                let span_id = match point.attribute(METRICS_SPAN_ID_ATTR) {
                    Some(AttrValue::String(text)) => text.parse::<SpanId>().ok(),
                    _ => None,
                };
                match span_id {
                    Some(id) => self
                        .metrics_by_span
                        .entry(id)
                        .or_default()
                        .entry(metric.name.clone())
                        .or_default()
                        .push(point),
                    None => debug!(metric = %metric.name, "Dropping metric point without digest or span"),
                }
            }
        }
    }

    /// First resource carrying `key` = `value`.
    pub fn find_resource(&self, key: &str, value: &AttrValue) -> Option<&Resource> {
        self.resources
            .iter()
            .find(|r| r.attributes.iter().any(|kv| kv.key == key && kv.value == *value))
    }
}

impl CallResolver for Db {
    fn resolve_call(&self, digest: &str) -> Option<Call> {
        self.known_call(digest).map(|call| (*call).clone())
    }
}
