//! Literal argument values.
//!
//! A literal is either a plain GraphQL-style value or a reference to another
//! call by digest. The `CallDigest` variant is what turns a set of calls into
//! a graph rather than a tree.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::wire::{Decoder, Encoder, WireType};

/// A named argument passed to a call, or a field of an object literal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    /// Argument name.
    pub name: String,
    /// Argument value.
    pub value: Literal,
}

impl Argument {
    /// Create a new argument.
    pub fn new(name: impl Into<String>, value: Literal) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }

    pub(crate) fn write(&self, enc: &mut Encoder) {
        enc.string(1, &self.name);
        enc.message(2, |enc| self.value.write(enc));
    }

    pub(crate) fn read(mut dec: Decoder<'_>) -> Result<Self> {
        let mut name = String::new();
        let mut value = Literal::Null;
        while let Some((field, wire)) = dec.next_field()? {
            match field {
                1 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    name = dec.string(field)?;
                }
                2 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    value = Literal::read(dec.message("Literal")?)?;
                }
                _ => dec.skip(wire)?,
            }
        }
        Ok(Self { name, value })
    }
}

/// A literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Enum(String),
    List(Vec<Literal>),
    Object(Vec<Argument>),
    /// Reference to the result of another call.
    CallDigest(String),
}

impl Literal {
    /// Returns the referenced call digest, if this is a call reference.
    pub fn as_call_digest(&self) -> Option<&str> {
        match self {
            Literal::CallDigest(digest) => Some(digest),
            _ => None,
        }
    }

    /// Visit every call digest referenced by this literal, including those
    /// nested inside lists and objects.
    pub fn for_each_digest(&self, f: &mut impl FnMut(&str)) {
        match self {
            Literal::CallDigest(digest) => f(digest),
            Literal::List(values) => {
                for value in values {
                    value.for_each_digest(f);
                }
            }
            Literal::Object(fields) => {
                for field in fields {
                    field.value.for_each_digest(f);
                }
            }
            _ => {}
        }
    }

    /// Render the literal for display.
    pub fn display(&self) -> String {
        match self {
            Literal::Null => "null".to_string(),
            Literal::Bool(v) => v.to_string(),
            Literal::Int(v) => v.to_string(),
            Literal::Float(v) => v.to_string(),
            Literal::String(v) => format!("{:?}", v),
            Literal::Enum(v) => v.clone(),
            Literal::List(values) => {
                let items: Vec<String> = values.iter().map(Literal::display).collect();
                format!("[{}]", items.join(","))
            }
            Literal::Object(fields) => {
                let items: Vec<String> = fields
                    .iter()
                    .map(|f| format!("{}: {}", f.name, f.value.display()))
                    .collect();
                format!("{{{}}}", items.join(", "))
            }
            Literal::CallDigest(digest) => format!("{{{}}}", digest),
        }
    }

    pub(crate) fn write(&self, enc: &mut Encoder) {
        match self {
            Literal::CallDigest(digest) => enc.string_always(1, digest),
            Literal::Null => enc.bool_always(2, true),
            Literal::Bool(v) => enc.bool_always(3, *v),
            Literal::Enum(v) => enc.string_always(4, v),
            Literal::Int(v) => enc.int64_always(5, *v),
            Literal::Float(v) => enc.double_always(6, *v),
            Literal::String(v) => enc.string_always(7, v),
            Literal::List(values) => enc.message(8, |enc| {
                for value in values {
                    enc.message(1, |enc| value.write(enc));
                }
            }),
            Literal::Object(fields) => enc.message(9, |enc| {
                for field in fields {
                    enc.message(1, |enc| field.write(enc));
                }
            }),
        }
    }

    pub(crate) fn read(mut dec: Decoder<'_>) -> Result<Self> {
        // oneof: the last member on the wire wins
        let mut value = Literal::Null;
        while let Some((field, wire)) = dec.next_field()? {
            value = match field {
                1 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    Literal::CallDigest(dec.string(field)?)
                }
                2 => {
                    dec.expect(field, wire, WireType::Varint)?;
                    dec.bool()?;
                    Literal::Null
                }
                3 => {
                    dec.expect(field, wire, WireType::Varint)?;
                    Literal::Bool(dec.bool()?)
                }
                4 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    Literal::Enum(dec.string(field)?)
                }
                5 => {
                    dec.expect(field, wire, WireType::Varint)?;
                    Literal::Int(dec.int64()?)
                }
                6 => {
                    dec.expect(field, wire, WireType::Fixed64)?;
                    Literal::Float(dec.double()?)
                }
                7 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    Literal::String(dec.string(field)?)
                }
                8 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    let mut list = dec.message("List")?;
                    let mut values = Vec::new();
                    while let Some((field, wire)) = list.next_field()? {
                        if field == 1 {
                            list.expect(field, wire, WireType::LengthDelimited)?;
                            values.push(Literal::read(list.message("Literal")?)?);
                        } else {
                            list.skip(wire)?;
                        }
                    }
                    Literal::List(values)
                }
                9 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    let mut object = dec.message("Object")?;
                    let mut fields = Vec::new();
                    while let Some((field, wire)) = object.next_field()? {
                        if field == 1 {
                            object.expect(field, wire, WireType::LengthDelimited)?;
                            fields.push(Argument::read(object.message("Argument")?)?);
                        } else {
                            object.skip(wire)?;
                        }
                    }
                    Literal::Object(fields)
                }
                _ => {
                    dec.skip(wire)?;
                    continue;
                }
            };
        }
        Ok(value)
    }
}

impl From<bool> for Literal {
    fn from(v: bool) -> Self {
        Literal::Bool(v)
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::String(v.to_string())
    }
}

impl From<String> for Literal {
    fn from(v: String) -> Self {
        Literal::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip(lit: &Literal) -> Literal {
        let mut enc = Encoder::new();
        lit.write(&mut enc);
        let bytes = enc.into_bytes();
        Literal::read(Decoder::new(&bytes, "Literal")).unwrap()
    }

    #[test]
    fn test_nested_literal_round_trip() {
        let lit = Literal::Object(vec![
            Argument::new("name", Literal::from("alpine")),
            Argument::new(
                "tags",
                Literal::List(vec![Literal::Enum("LATEST".into()), Literal::Null]),
            ),
            Argument::new("source", Literal::CallDigest("sha256:feed".into())),
        ]);
        assert_eq!(round_trip(&lit), lit);
    }

    #[test]
    fn test_read_rejects_deeply_nested_list() {
        use crate::error::CallError;
        use crate::wire::nest_messages;

        // Literal{list: List{values: [Literal{...}]}} around an int
        let bytes = nest_messages(&[0x28, 0x01], &[0x0a, 0x42], 100_000);
        let err = Literal::read(Decoder::new(&bytes, "Literal")).unwrap_err();
        assert!(matches!(err, CallError::TooDeep(_)));
    }

    #[test]
    fn test_zero_values_survive_oneof() {
        // oneof members are written even when they hold default values
        assert_eq!(round_trip(&Literal::Int(0)), Literal::Int(0));
        assert_eq!(round_trip(&Literal::Bool(false)), Literal::Bool(false));
        assert_eq!(
            round_trip(&Literal::String(String::new())),
            Literal::String(String::new())
        );
    }

    #[test]
    fn test_for_each_digest_finds_nested() {
        let lit = Literal::List(vec![
            Literal::CallDigest("a".into()),
            Literal::Object(vec![Argument::new(
                "inner",
                Literal::List(vec![Literal::CallDigest("b".into())]),
            )]),
            Literal::Int(3),
        ]);
        let mut found = Vec::new();
        lit.for_each_digest(&mut |d| found.push(d.to_string()));
        assert_eq!(found, vec!["a", "b"]);
    }

    #[test]
    fn test_display() {
        let lit = Literal::Object(vec![
            Argument::new("a", Literal::Int(1)),
            Argument::new("b", Literal::List(vec![Literal::from("x"), Literal::Bool(true)])),
        ]);
        assert_eq!(lit.display(), "{a: 1, b: [\"x\",true]}");
    }

    #[test]
    fn test_serde_shape() {
        let json = serde_json::to_string(&Literal::Int(5)).unwrap();
        assert_eq!(json, r#"{"kind":"int","value":5}"#);
    }
}
