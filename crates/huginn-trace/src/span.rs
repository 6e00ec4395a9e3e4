//! Spans and their snapshots.
//!
//! A [`SpanSnapshot`] is the flat, versioned record that travels between an
//! aggregator and its mirrors. A [`Span`] wraps one snapshot together with
//! relationships derived while integrating it into a [`Db`]. Relationships
//! are stored as span IDs and resolved through the owning database.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use huginn_call::Call;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::activity::{Activity, SpanInterval};
use crate::attrs::{AttrKey, AttrValue, AttributeError};
use crate::db::Db;
use crate::ids::{SpanId, SpanLink};
use crate::ordered_set::SpanSet;

/// Status code of a finished span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    #[default]
    Unset,
    Ok,
    Error,
}

/// Span status as reported by the producer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanStatus {
    #[serde(default)]
    pub code: StatusCode,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub description: String,
}

impl SpanStatus {
    pub fn ok() -> Self {
        Self {
            code: StatusCode::Ok,
            description: String::new(),
        }
    }

    pub fn error(description: impl Into<String>) -> Self {
        Self {
            code: StatusCode::Error,
            description: description.into(),
        }
    }

    fn is_unset(&self) -> bool {
        self.code == StatusCode::Unset && self.description.is_empty()
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

fn is_zero(value: &usize) -> bool {
    *value == 0
}

/// The serializable state of one span.
///
/// An `end_time` before `start_time` means the span is still running.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpanSnapshot {
    /// Bumped on every local change; never reset.
    pub version: u64,

    /// Set on snapshots taken for export. Derived flags in a final snapshot
    /// are trusted over anything computed locally.
    #[serde(skip_serializing_if = "is_false")]
    pub r#final: bool,

    pub id: SpanId,
    pub name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,

    #[serde(skip_serializing_if = "Activity::is_empty")]
    pub activity: Activity,

    #[serde(skip_serializing_if = "is_invalid")]
    pub parent_id: SpanId,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<SpanLink>,

    #[serde(skip_serializing_if = "SpanStatus::is_unset")]
    pub status: SpanStatus,

    // derived from the span and its effects
    #[serde(rename = "failed_", skip_serializing_if = "is_false")]
    pub failed_: bool,
    #[serde(rename = "failed_reason_", skip_serializing_if = "Vec::is_empty")]
    pub failed_reason_: Vec<String>,
    #[serde(rename = "cached_", skip_serializing_if = "is_false")]
    pub cached_: bool,
    #[serde(rename = "cached_reason_", skip_serializing_if = "Vec::is_empty")]
    pub cached_reason_: Vec<String>,
    #[serde(rename = "pending_", skip_serializing_if = "is_false")]
    pub pending_: bool,
    #[serde(rename = "pending_reason_", skip_serializing_if = "Vec::is_empty")]
    pub pending_reason_: Vec<String>,
    #[serde(rename = "canceled_", skip_serializing_if = "is_false")]
    pub canceled_: bool,
    #[serde(rename = "canceled_reason_", skip_serializing_if = "Vec::is_empty")]
    pub canceled_reason_: Vec<String>,

    // reported by the span
    #[serde(skip_serializing_if = "is_false")]
    pub canceled: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub cached: bool,

    // presentation hints, reported or applied
    #[serde(skip_serializing_if = "is_false")]
    pub internal: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub encapsulate: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub encapsulated: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub mask: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub passthrough: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub ignore: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub reveal: bool,
    #[serde(skip_serializing_if = "is_false")]
    pub roll_up: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub content_type: String,

    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<String>,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub output: String,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub effect_id: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub effect_ids: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub effects_completed: Vec<String>,

    #[serde(skip_serializing_if = "String::is_empty")]
    pub call_digest: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub call_payload: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub call_scope: String,

    #[serde(skip_serializing_if = "is_zero")]
    pub child_count: usize,
    #[serde(skip_serializing_if = "is_false")]
    pub has_logs: bool,
}

fn is_invalid(id: &SpanId) -> bool {
    !id.is_valid()
}

impl SpanSnapshot {
    pub fn is_running(&self) -> bool {
        self.end_time < self.start_time
    }

    /// This span's own timing.
    pub fn interval(&self) -> SpanInterval {
        SpanInterval {
            id: self.id,
            start: self.start_time,
            end: self.end_time,
        }
    }

    /// Apply one telemetry attribute.
    ///
    /// Unknown names are ignored. A value of the wrong type is logged and
    /// skipped without affecting other attributes.
    pub fn process_attribute(&mut self, name: &str, value: &AttrValue) {
        let Some(key) = AttrKey::from_name(name) else {
            debug!(attribute = name, "Ignoring unknown attribute");
            return;
        };
        if let Err(e) = self.apply_attribute(key, value) {
            warn!(attribute = name, span = %self.id, error = %e, "Malformed attribute value");
        }
    }

    fn apply_attribute(&mut self, key: AttrKey, value: &AttrValue) -> Result<(), AttributeError> {
        match key {
            AttrKey::DagDigest => self.call_digest = value.as_str()?.to_string(),
            AttrKey::DagCall => self.call_payload = value.as_str()?.to_string(),
            AttrKey::DagCallScope => self.call_scope = value.as_str()?.to_string(),
            AttrKey::DagInputs => self.inputs = value.as_string_array()?.to_vec(),
            AttrKey::DagOutput => self.output = value.as_str()?.to_string(),
            AttrKey::Cached => self.cached = value.as_bool()?,
            AttrKey::Canceled => self.canceled = value.as_bool()?,
            AttrKey::UiInternal => self.internal = value.as_bool()?,
            AttrKey::UiEncapsulate => self.encapsulate = value.as_bool()?,
            AttrKey::UiEncapsulated => self.encapsulated = value.as_bool()?,
            AttrKey::UiReveal => self.reveal = value.as_bool()?,
            AttrKey::UiPassthrough => self.passthrough = value.as_bool()?,
            AttrKey::UiMask => self.mask = value.as_bool()?,
            AttrKey::UiRollUp => self.roll_up = value.as_bool()?,
            AttrKey::UiMessage => self.message = value.as_str()?.to_string(),
            AttrKey::ContentType => self.content_type = value.as_str()?.to_string(),
            AttrKey::EffectId => self.effect_id = value.as_str()?.to_string(),
            AttrKey::EffectIds => self.effect_ids = value.as_string_array()?.to_vec(),
            AttrKey::EffectsCompleted => {
                self.effects_completed = value.as_string_array()?.to_vec()
            }
            // hidden unless the parent fails; happy paths may expect failures
            AttrKey::RpcService => self.encapsulated = true,
        }
        Ok(())
    }
}

/// Progress counts over the descendants of a roll-up span.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollUpState {
    pub pending_count: usize,
    pub running_count: usize,
    pub cached_count: usize,
    pub success_count: usize,
    pub failed_count: usize,
    pub canceled_count: usize,
}

/// A live span in a [`Db`].
#[derive(Debug, Clone, Default)]
pub struct Span {
    pub snapshot: SpanSnapshot,

    pub parent_span: Option<SpanId>,
    pub child_spans: SpanSet,
    pub running_spans: SpanSet,
    pub failed_spans: SpanSet,
    pub canceled_spans: SpanSet,
    pub revealed_spans: SpanSet,

    /// Spans this one links to, i.e. its causes.
    pub links_to: SpanSet,
    /// Spans linking to this one, i.e. its effects.
    pub linked_from: SpanSet,

    /// Effect ID this span fulfils; its causes are the spans that installed it.
    pub(crate) causes_via_attrs: Option<String>,
    /// Effect IDs this span installed.
    pub(crate) effects_via_attrs: Vec<String>,

    /// Whether the span was exported, rather than allocated because
    /// something referenced it.
    pub received: bool,

    /// Simplified call of the receiver.
    pub base: Option<Arc<Call>>,
}

impl Span {
    pub(crate) fn new(id: SpanId) -> Self {
        Self {
            snapshot: SpanSnapshot {
                id,
                ..SpanSnapshot::default()
            },
            ..Self::default()
        }
    }

    pub fn id(&self) -> SpanId {
        self.snapshot.id
    }

    pub fn name(&self) -> &str {
        &self.snapshot.name
    }

    pub fn is_running(&self) -> bool {
        self.snapshot.is_running()
    }

    pub fn is_ok(&self) -> bool {
        self.snapshot.status.code == StatusCode::Ok
    }

    pub fn is_failed(&self) -> bool {
        self.snapshot.status.code == StatusCode::Error
    }

    pub fn is_unset(&self) -> bool {
        self.snapshot.status.code == StatusCode::Unset
    }

    pub fn is_internal(&self) -> bool {
        self.snapshot.internal
    }

    pub fn is_running_or_effects_running(&self) -> bool {
        self.is_running() || self.snapshot.activity.is_running()
    }

    pub fn end_time_or_fallback(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.snapshot.activity.end_time_or_fallback(now)
    }

    pub fn is_failed_or_caused_failure(&self, db: &Db) -> bool {
        if self.snapshot.r#final {
            return self.snapshot.failed_;
        }
        self.is_failed()
            || !self.failed_spans.is_empty()
            || self
                .snapshot
                .effect_ids
                .iter()
                .any(|effect| db.failed_effects.contains(effect))
    }

    pub fn failed_reason(&self, db: &Db) -> (bool, Vec<String>) {
        if self.snapshot.r#final {
            return (self.snapshot.failed_, self.snapshot.failed_reason_.clone());
        }
        let mut reasons = Vec::new();
        if self.is_failed() {
            reasons.push("span itself errored".to_string());
        }
        for failed in &self.failed_spans {
            reasons.push(format!("span has failed descendant: {}", db.span_name(failed)));
        }
        for effect in &self.snapshot.effect_ids {
            if db.failed_effects.contains(effect) {
                reasons.push(format!("span installed failed effect: {}", effect));
            }
        }
        (!reasons.is_empty(), reasons)
    }

    pub fn is_canceled(&self, db: &Db) -> bool {
        self.canceled_reason(db).0
    }

    pub fn canceled_reason(&self, db: &Db) -> (bool, Vec<String>) {
        if self.snapshot.r#final {
            return (self.snapshot.canceled_, self.snapshot.canceled_reason_.clone());
        }
        let mut reasons = Vec::new();
        if self.snapshot.canceled {
            reasons.push("span says it is canceled".to_string());
        }
        for canceled in &self.canceled_spans {
            reasons.push(format!("span has canceled link: {}", db.span_name(canceled)));
        }
        (!reasons.is_empty(), reasons)
    }

    pub fn is_pending(&self, db: &Db) -> bool {
        self.pending_reason(db).0
    }

    /// Pending means not running, with installed effects none of which have
    /// started or completed.
    pub fn pending_reason(&self, db: &Db) -> (bool, Vec<String>) {
        if self.snapshot.r#final {
            return (self.snapshot.pending_, self.snapshot.pending_reason_.clone());
        }
        if self.is_running_or_effects_running() {
            let mut reasons = Vec::new();
            if self.is_running() {
                reasons.push("span is running".to_string());
            }
            for running in &self.running_spans {
                reasons.push(format!("span has running link: {}", db.span_name(running)));
            }
            return (false, reasons);
        }
        if self.snapshot.effect_ids.is_empty() {
            return (false, vec!["span has completed".to_string()]);
        }
        let mut reasons = Vec::new();
        for effect in &self.snapshot.effect_ids {
            if db.effect_spans.get(effect).is_some_and(|set| !set.is_empty()) {
                return (false, vec![format!("{} has started", effect)]);
            }
            if db.completed_effects.contains(effect) {
                return (false, vec![format!("{} has completed", effect)]);
            }
            reasons.push(format!("{} has not started", effect));
        }
        (true, reasons)
    }

    pub fn is_cached(&self, db: &Db) -> bool {
        self.cached_reason(db).0
    }

    /// Cached means marked cached, or every installed effect is itself
    /// known to be cached.
    pub fn cached_reason(&self, db: &Db) -> (bool, Vec<String>) {
        let mut visiting = HashSet::new();
        self.cached_reason_inner(db, &mut visiting)
    }

    fn cached_reason_inner(&self, db: &Db, visiting: &mut HashSet<SpanId>) -> (bool, Vec<String>) {
        if self.snapshot.r#final {
            return (self.snapshot.cached_, self.snapshot.cached_reason_.clone());
        }
        if self.snapshot.cached {
            return (true, vec!["span says it is cached".to_string()]);
        }
        if !self.child_spans.is_empty() {
            return (false, vec!["span has children".to_string()]);
        }
        if self.snapshot.has_logs {
            return (false, vec!["span has logs".to_string()]);
        }
        if !visiting.insert(self.id()) {
            return (false, vec!["span effect cycle".to_string()]);
        }
        let mut cached_count = 0;
        let mut uncached_count = 0;
        let mut reasons = Vec::new();
        let mut track = |effect: &str, cached: bool| {
            if cached {
                cached_count += 1;
                reasons.push(format!("{} is cached", effect));
            } else {
                uncached_count += 1;
                reasons.push(format!("{} is not cached", effect));
            }
        };
        for effect in &self.snapshot.effect_ids {
            match db.effect_spans.get(effect).filter(|set| !set.is_empty()) {
                Some(set) => {
                    for id in set {
                        let cached = db
                            .span(id)
                            .is_some_and(|s| s.cached_reason_inner(db, visiting).0);
                        track(effect, cached);
                    }
                }
                // completed without a span: a deep cache hit, or another
                // client did the work
                None => track(effect, db.completed_effects.contains(effect)),
            }
        }
        (cached_count > 0 && uncached_count == 0, reasons)
    }
}
