//! Span and trace identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Error parsing an identifier from text.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum IdError {
    #[error("Invalid length: expected {expected} hex characters, got {got}")]
    InvalidLength { expected: usize, got: usize },

    #[error("Invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

macro_rules! define_id {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// The all-zero identifier, meaning "absent".
            pub const INVALID: Self = Self([0; $len]);

            /// Whether the identifier is non-zero.
            pub fn is_valid(&self) -> bool {
                *self != Self::INVALID
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self)
            }
        }

        impl FromStr for $name {
            type Err = IdError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                if s.len() != $len * 2 {
                    return Err(IdError::InvalidLength {
                        expected: $len * 2,
                        got: s.len(),
                    });
                }
                let mut bytes = [0u8; $len];
                hex::decode_to_slice(s, &mut bytes)?;
                Ok(Self(bytes))
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.to_string())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                // an empty string is the conventional encoding of "absent"
                if s.is_empty() {
                    return Ok(Self::INVALID);
                }
                s.parse().map_err(serde::de::Error::custom)
            }
        }
    };
}

define_id!(
    /// An 8-byte span identifier.
    SpanId,
    8
);

define_id!(
    /// A 16-byte trace identifier.
    TraceId,
    16
);

/// Identifies a span within a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SpanContext {
    pub trace_id: TraceId,
    pub span_id: SpanId,
}

impl SpanContext {
    pub fn new(trace_id: TraceId, span_id: SpanId) -> Self {
        Self { trace_id, span_id }
    }
}

/// A causal link from one span to another.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanLink {
    pub span_context: SpanContext,
    /// Why the link exists, e.g. "error_origin".
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub purpose: String,
}

impl SpanLink {
    pub fn new(span_context: SpanContext) -> Self {
        Self {
            span_context,
            purpose: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_span_id_text_round_trip() {
        let id = SpanId([0xde, 0xad, 0xbe, 0xef, 0, 1, 2, 3]);
        assert_eq!(id.to_string(), "deadbeef00010203");
        assert_eq!("deadbeef00010203".parse::<SpanId>().unwrap(), id);
    }

    #[test]
    fn test_invalid_is_zero() {
        assert!(!SpanId::default().is_valid());
        assert!(!TraceId::INVALID.is_valid());
        assert!(SpanId([0, 0, 0, 0, 0, 0, 0, 1]).is_valid());
    }

    #[test]
    fn test_rejects_malformed_text() {
        assert_eq!(
            "abc".parse::<SpanId>(),
            Err(IdError::InvalidLength {
                expected: 16,
                got: 3
            })
        );
        assert_eq!(
            "zz00000000000000".parse::<SpanId>(),
            Err(IdError::InvalidHex(hex::FromHexError::InvalidHexCharacter {
                c: 'z',
                index: 0
            }))
        );
        assert!("00".repeat(8).parse::<TraceId>().is_err());
    }

    #[test]
    fn test_serde_as_string() {
        let id = TraceId([7; 16]);
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, format!("\"{}\"", "07".repeat(16)));
        assert_eq!(serde_json::from_str::<TraceId>(&json).unwrap(), id);
        assert_eq!(serde_json::from_str::<SpanId>("\"\"").unwrap(), SpanId::INVALID);
    }
}
