//! Span attribute vocabulary.
//!
//! Telemetry producers annotate spans with a fixed set of named attributes.
//! [`AttrKey::from_name`] maps a name onto the closed [`AttrKey`] set through
//! a static table; anything not in the table is ignored by the aggregator.

use serde::{Deserialize, Serialize};

/// Digest of the call a span evaluates.
pub const DAG_DIGEST_ATTR: &str = "dagger.io/dag.digest";
/// Encoded call payload.
pub const DAG_CALL_ATTR: &str = "dagger.io/dag.call";
pub const DAG_CALL_SCOPE_ATTR: &str = "dagger.io/dag.call.scope";
pub const DAG_INPUTS_ATTR: &str = "dagger.io/dag.inputs";
pub const DAG_OUTPUT_ATTR: &str = "dagger.io/dag.output";
pub const CACHED_ATTR: &str = "dagger.io/dag.cached";
pub const CANCELED_ATTR: &str = "dagger.io/dag.canceled";
pub const UI_INTERNAL_ATTR: &str = "dagger.io/ui.internal";
pub const UI_ENCAPSULATE_ATTR: &str = "dagger.io/ui.encapsulate";
pub const UI_ENCAPSULATED_ATTR: &str = "dagger.io/ui.encapsulated";
pub const UI_REVEAL_ATTR: &str = "dagger.io/ui.reveal";
pub const UI_PASSTHROUGH_ATTR: &str = "dagger.io/ui.passthrough";
pub const UI_MASK_ATTR: &str = "dagger.io/ui.mask";
pub const UI_ROLLUP_ATTR: &str = "dagger.io/ui.rollup";
pub const UI_MESSAGE_ATTR: &str = "dagger.io/ui.message";
pub const CONTENT_TYPE_ATTR: &str = "dagger.io/content.type";
pub const EFFECT_ID_ATTR: &str = "dagger.io/effect.id";
pub const EFFECT_IDS_ATTR: &str = "dagger.io/effect.ids";
pub const EFFECTS_COMPLETED_ATTR: &str = "dagger.io/effects.completed";
pub const RPC_SERVICE_ATTR: &str = "rpc.service";

/// Log record attribute marking verbose output.
pub const LOGS_VERBOSE_ATTR: &str = "dagger.io/logs.verbose";
/// Log record attribute marking the end of a stream.
pub const STDIO_EOF_ATTR: &str = "dagger.io/stdio.eof";
/// Metric point attribute naming the span it was measured for.
pub const METRICS_SPAN_ID_ATTR: &str = "dagger.io/metrics.span";

/// A telemetry attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "value")]
pub enum AttrValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    BoolArray(Vec<bool>),
    IntArray(Vec<i64>),
    FloatArray(Vec<f64>),
    StringArray(Vec<String>),
}

impl AttrValue {
    fn type_name(&self) -> &'static str {
        match self {
            AttrValue::Bool(_) => "bool",
            AttrValue::Int(_) => "int",
            AttrValue::Float(_) => "float",
            AttrValue::String(_) => "string",
            AttrValue::BoolArray(_) => "bool[]",
            AttrValue::IntArray(_) => "int[]",
            AttrValue::FloatArray(_) => "float[]",
            AttrValue::StringArray(_) => "string[]",
        }
    }

    pub fn as_bool(&self) -> Result<bool, AttributeError> {
        match self {
            AttrValue::Bool(v) => Ok(*v),
            other => Err(AttributeError::mismatch("bool", other)),
        }
    }

    pub fn as_str(&self) -> Result<&str, AttributeError> {
        match self {
            AttrValue::String(v) => Ok(v),
            other => Err(AttributeError::mismatch("string", other)),
        }
    }

    pub fn as_string_array(&self) -> Result<&[String], AttributeError> {
        match self {
            AttrValue::StringArray(v) => Ok(v),
            other => Err(AttributeError::mismatch("string[]", other)),
        }
    }

    /// Loose string rendering, used for resource matching.
    pub fn to_text(&self) -> String {
        match self {
            AttrValue::Bool(v) => v.to_string(),
            AttrValue::Int(v) => v.to_string(),
            AttrValue::Float(v) => v.to_string(),
            AttrValue::String(v) => v.clone(),
            AttrValue::BoolArray(v) => format!("{:?}", v),
            AttrValue::IntArray(v) => format!("{:?}", v),
            AttrValue::FloatArray(v) => format!("{:?}", v),
            AttrValue::StringArray(v) => format!("{:?}", v),
        }
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::String(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::String(v)
    }
}

impl From<Vec<String>> for AttrValue {
    fn from(v: Vec<String>) -> Self {
        AttrValue::StringArray(v)
    }
}

/// A named attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyValue {
    pub key: String,
    pub value: AttrValue,
}

impl KeyValue {
    pub fn new(key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// An attribute value of the wrong type.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("Attribute type error: expected {expected}, got {got}")]
pub struct AttributeError {
    pub expected: &'static str,
    pub got: &'static str,
}

impl AttributeError {
    fn mismatch(expected: &'static str, got: &AttrValue) -> Self {
        Self {
            expected,
            got: got.type_name(),
        }
    }
}

/// Attributes the aggregator understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttrKey {
    DagDigest,
    DagCall,
    DagCallScope,
    DagInputs,
    DagOutput,
    Cached,
    Canceled,
    UiInternal,
    UiEncapsulate,
    UiEncapsulated,
    UiReveal,
    UiPassthrough,
    UiMask,
    UiRollUp,
    UiMessage,
    ContentType,
    EffectId,
    EffectIds,
    EffectsCompleted,
    RpcService,
}

const ATTRIBUTE_KEYS: &[(&str, AttrKey)] = &[
    (DAG_DIGEST_ATTR, AttrKey::DagDigest),
    (DAG_CALL_ATTR, AttrKey::DagCall),
    (DAG_CALL_SCOPE_ATTR, AttrKey::DagCallScope),
    (DAG_INPUTS_ATTR, AttrKey::DagInputs),
    (DAG_OUTPUT_ATTR, AttrKey::DagOutput),
    (CACHED_ATTR, AttrKey::Cached),
    (CANCELED_ATTR, AttrKey::Canceled),
    (UI_INTERNAL_ATTR, AttrKey::UiInternal),
    (UI_ENCAPSULATE_ATTR, AttrKey::UiEncapsulate),
    (UI_ENCAPSULATED_ATTR, AttrKey::UiEncapsulated),
    (UI_REVEAL_ATTR, AttrKey::UiReveal),
    (UI_PASSTHROUGH_ATTR, AttrKey::UiPassthrough),
    (UI_MASK_ATTR, AttrKey::UiMask),
    (UI_ROLLUP_ATTR, AttrKey::UiRollUp),
    (UI_MESSAGE_ATTR, AttrKey::UiMessage),
    (CONTENT_TYPE_ATTR, AttrKey::ContentType),
    (EFFECT_ID_ATTR, AttrKey::EffectId),
    (EFFECT_IDS_ATTR, AttrKey::EffectIds),
    (EFFECTS_COMPLETED_ATTR, AttrKey::EffectsCompleted),
    (RPC_SERVICE_ATTR, AttrKey::RpcService),
];

impl AttrKey {
    /// Look up a known attribute by name.
    pub fn from_name(name: &str) -> Option<Self> {
        ATTRIBUTE_KEYS
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, key)| *key)
    }

    /// The wire name of the attribute.
    pub fn name(self) -> &'static str {
        ATTRIBUTE_KEYS
            .iter()
            .find(|(_, key)| *key == self)
            .map(|(name, _)| *name)
            .unwrap_or_default()
    }
}
