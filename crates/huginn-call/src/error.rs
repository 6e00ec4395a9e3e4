//! Error types for call encoding and decoding.

use thiserror::Error;

/// Result type alias for call operations.
pub type Result<T> = std::result::Result<T, CallError>;

/// Errors that can occur while decoding or validating encoded calls.
#[derive(Debug, Error)]
pub enum CallError {
    /// The textual wrapper was not valid base64.
    #[error("Base64 decode error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The binary payload ended in the middle of a value.
    #[error("Truncated input at byte {0}")]
    Truncated(usize),

    /// A varint ran past ten bytes.
    #[error("Varint overflow at byte {0}")]
    VarintOverflow(usize),

    /// A field key carried a wire type we do not understand.
    #[error("Invalid wire type {0}")]
    InvalidWireType(u8),

    /// A known field was encoded with the wrong wire type.
    #[error("Unexpected wire type {wire_type} for field {field} of {message}")]
    UnexpectedWireType {
        message: &'static str,
        field: u32,
        wire_type: u8,
    },

    /// Field number zero is reserved.
    #[error("Invalid field number 0 at byte {0}")]
    InvalidFieldNumber(usize),

    /// A string field was not valid UTF-8.
    #[error("Invalid UTF-8 in field {field} of {message}")]
    InvalidUtf8 { message: &'static str, field: u32 },

    /// A DAG referenced a call it does not contain.
    #[error("Call digest {0:?} not found")]
    MissingCall(String),

    /// A DAG entry's key disagrees with the digest stored in the call.
    #[error("Call digest mismatch {expected:?} != {actual:?}")]
    DigestMismatch { expected: String, actual: String },

    /// Messages were nested deeper than the decoder allows.
    #[error("Message nesting exceeds {0} levels")]
    TooDeep(u32),

    /// A call was decoded without any field name.
    #[error("Call has no field name")]
    MissingField,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CallError::MissingCall("sha256:abc".to_string());
        assert_eq!(err.to_string(), "Call digest \"sha256:abc\" not found");

        let err = CallError::UnexpectedWireType {
            message: "Call",
            field: 3,
            wire_type: 0,
        };
        assert_eq!(
            err.to_string(),
            "Unexpected wire type 0 for field 3 of Call"
        );
    }
}
