//! Protobuf wire-format primitives.
//!
//! Only the subset needed for call encoding: varints, fixed64 and
//! length-delimited fields. The encoder skips proto3 default values for plain
//! fields and always writes oneof members, so two structurally equal messages
//! produce identical bytes.

use crate::error::{CallError, Result};

/// Deepest message nesting the decoder accepts.
pub(crate) const MAX_DEPTH: u32 = 100;

/// Wire types understood by the decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WireType {
    Varint,
    Fixed64,
    LengthDelimited,
    Fixed32,
}

impl WireType {
    fn from_bits(bits: u64) -> Result<Self> {
        match bits {
            0 => Ok(WireType::Varint),
            1 => Ok(WireType::Fixed64),
            2 => Ok(WireType::LengthDelimited),
            5 => Ok(WireType::Fixed32),
            other => Err(CallError::InvalidWireType(other as u8)),
        }
    }

    fn bits(self) -> u64 {
        match self {
            WireType::Varint => 0,
            WireType::Fixed64 => 1,
            WireType::LengthDelimited => 2,
            WireType::Fixed32 => 5,
        }
    }
}

/// Appends protobuf fields to a byte buffer.
#[derive(Debug, Default)]
pub(crate) struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn varint(&mut self, mut value: u64) {
        while value >= 0x80 {
            self.buf.push((value as u8) | 0x80);
            value >>= 7;
        }
        self.buf.push(value as u8);
    }

    fn tag(&mut self, field: u32, wire: WireType) {
        self.varint((u64::from(field) << 3) | wire.bits());
    }

    fn bytes_field(&mut self, field: u32, bytes: &[u8]) {
        self.tag(field, WireType::LengthDelimited);
        self.varint(bytes.len() as u64);
        self.buf.extend_from_slice(bytes);
    }

    /// Write a string field, omitting it when empty.
    pub(crate) fn string(&mut self, field: u32, value: &str) {
        if !value.is_empty() {
            self.bytes_field(field, value.as_bytes());
        }
    }

    /// Write a string field even when empty (oneof members).
    pub(crate) fn string_always(&mut self, field: u32, value: &str) {
        self.bytes_field(field, value.as_bytes());
    }

    /// Write a bool field, omitting it when false.
    pub(crate) fn bool(&mut self, field: u32, value: bool) {
        if value {
            self.bool_always(field, value);
        }
    }

    pub(crate) fn bool_always(&mut self, field: u32, value: bool) {
        self.tag(field, WireType::Varint);
        self.varint(u64::from(value));
    }

    /// Write an int64 field, omitting it when zero.
    pub(crate) fn int64(&mut self, field: u32, value: i64) {
        if value != 0 {
            self.int64_always(field, value);
        }
    }

    pub(crate) fn int64_always(&mut self, field: u32, value: i64) {
        self.tag(field, WireType::Varint);
        self.varint(value as u64);
    }

    pub(crate) fn double_always(&mut self, field: u32, value: f64) {
        self.tag(field, WireType::Fixed64);
        self.buf.extend_from_slice(&value.to_bits().to_le_bytes());
    }

    /// Write a nested message. Present messages are always emitted, even
    /// when their encoding is empty.
    pub(crate) fn message(&mut self, field: u32, write: impl FnOnce(&mut Encoder)) {
        let mut inner = Encoder::new();
        write(&mut inner);
        self.bytes_field(field, &inner.buf);
    }
}

/// Reads protobuf fields from a byte slice.
#[derive(Debug)]
pub(crate) struct Decoder<'a> {
    buf: &'a [u8],
    pos: usize,
    message: &'static str,
    depth: u32,
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(buf: &'a [u8], message: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            message,
            depth: 0,
        }
    }

    /// Read the next field key, or `None` at the end of the message.
    pub(crate) fn next_field(&mut self) -> Result<Option<(u32, WireType)>> {
        if self.pos >= self.buf.len() {
            return Ok(None);
        }
        let start = self.pos;
        let key = self.varint()?;
        let field = (key >> 3) as u32;
        if field == 0 {
            return Err(CallError::InvalidFieldNumber(start));
        }
        Ok(Some((field, WireType::from_bits(key & 0x7)?)))
    }

    /// Fail unless the field was encoded with the expected wire type.
    pub(crate) fn expect(&self, field: u32, actual: WireType, expected: WireType) -> Result<()> {
        if actual != expected {
            return Err(CallError::UnexpectedWireType {
                message: self.message,
                field,
                wire_type: actual.bits() as u8,
            });
        }
        Ok(())
    }

    fn varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        for shift in (0..70).step_by(7) {
            let Some(&byte) = self.buf.get(self.pos) else {
                return Err(CallError::Truncated(self.pos));
            };
            self.pos += 1;
            if shift == 63 && byte > 1 {
                return Err(CallError::VarintOverflow(self.pos - 1));
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(CallError::VarintOverflow(self.pos))
    }

    pub(crate) fn bool(&mut self) -> Result<bool> {
        Ok(self.varint()? != 0)
    }

    pub(crate) fn int64(&mut self) -> Result<i64> {
        Ok(self.varint()? as i64)
    }

    pub(crate) fn double(&mut self) -> Result<f64> {
        let end = self.pos + 8;
        let Some(bytes) = self.buf.get(self.pos..end) else {
            return Err(CallError::Truncated(self.buf.len()));
        };
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        self.pos = end;
        Ok(f64::from_bits(u64::from_le_bytes(raw)))
    }

    fn bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.varint()? as usize;
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(CallError::Truncated(self.buf.len()))?;
        let bytes = &self.buf[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    pub(crate) fn string(&mut self, field: u32) -> Result<String> {
        let message = self.message;
        let bytes = self.bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| CallError::InvalidUtf8 { message, field })
    }

    /// Read a nested message as a sub-decoder, one level deeper.
    pub(crate) fn message(&mut self, message: &'static str) -> Result<Decoder<'a>> {
        let depth = self.depth + 1;
        if depth > MAX_DEPTH {
            return Err(CallError::TooDeep(MAX_DEPTH));
        }
        Ok(Decoder {
            depth,
            ..Decoder::new(self.bytes()?, message)
        })
    }

    /// Skip over a field we do not recognize.
    pub(crate) fn skip(&mut self, wire: WireType) -> Result<()> {
        match wire {
            WireType::Varint => {
                self.varint()?;
            }
            WireType::Fixed64 | WireType::Fixed32 => {
                let width = if wire == WireType::Fixed64 { 8 } else { 4 };
                if self.pos + width > self.buf.len() {
                    return Err(CallError::Truncated(self.buf.len()));
                }
                self.pos += width;
            }
            WireType::LengthDelimited => {
                self.bytes()?;
            }
        }
        Ok(())
    }
}

/// Wrap `innermost` in `levels` length-delimited fields, cycling through
/// `tags` from the inside out. Built without recursion so tests can produce
/// nesting far deeper than the decoder accepts.
#[cfg(test)]
pub(crate) fn nest_messages(innermost: &[u8], tags: &[u8], levels: usize) -> Vec<u8> {
    let mut headers = Vec::with_capacity(levels);
    let mut len = innermost.len();
    for level in 0..levels {
        let mut header = Encoder::new();
        header.buf.push(tags[level % tags.len()]);
        header.varint(len as u64);
        len += header.buf.len();
        headers.push(header.buf);
    }
    let mut out = Vec::with_capacity(len);
    for header in headers.iter().rev() {
        out.extend_from_slice(header);
    }
    out.extend_from_slice(innermost);
    out
}
