//! Content-addressed calls.
//!
//! A [`Call`] is one field selection: a receiver (referenced by digest), a
//! field name, ordered arguments, the return type and an optional module. Its
//! digest is the SHA-256 of the canonical encoding with the digest field left
//! out, so structurally equal calls always share a digest.

use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{CallError, Result};
use crate::literal::{Argument, Literal};
use crate::wire::{Decoder, Encoder, WireType};

/// Prefix of every digest produced by [`Call::compute_digest`].
pub const DIGEST_PREFIX: &str = "sha256:";

/// A GraphQL-style return type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Type {
    /// Named type, empty for list types.
    pub named_type: String,
    /// Element type for list types.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elem: Option<Box<Type>>,
    /// Whether the type is non-null.
    #[serde(default)]
    pub non_null: bool,
}

impl Type {
    /// A nullable named type.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            named_type: name.into(),
            elem: None,
            non_null: false,
        }
    }

    /// A nullable list of `elem`.
    pub fn list_of(elem: Type) -> Self {
        Self {
            named_type: String::new(),
            elem: Some(Box::new(elem)),
            non_null: false,
        }
    }

    /// Mark the type non-null.
    pub fn non_null(mut self) -> Self {
        self.non_null = true;
        self
    }

    /// The innermost named type, looking through lists.
    pub fn name(&self) -> &str {
        match &self.elem {
            Some(elem) => elem.name(),
            None => &self.named_type,
        }
    }

    fn write(&self, enc: &mut Encoder) {
        enc.string(1, &self.named_type);
        if let Some(elem) = &self.elem {
            enc.message(2, |enc| elem.write(enc));
        }
        enc.bool(3, self.non_null);
    }

    fn read(mut dec: Decoder<'_>) -> Result<Self> {
        let mut ty = Type::default();
        while let Some((field, wire)) = dec.next_field()? {
            match field {
                1 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    ty.named_type = dec.string(field)?;
                }
                2 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    ty.elem = Some(Box::new(Type::read(dec.message("Type")?)?));
                }
                3 => {
                    dec.expect(field, wire, WireType::Varint)?;
                    ty.non_null = dec.bool()?;
                }
                _ => dec.skip(wire)?,
            }
        }
        Ok(ty)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.elem {
            Some(elem) => write!(f, "[{}]", elem)?,
            None => write!(f, "{}", self.named_type)?,
        }
        if self.non_null {
            write!(f, "!")?;
        }
        Ok(())
    }
}

/// The module a call was served by.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Module {
    /// Digest of the call that loaded the module.
    pub call_digest: String,
    pub name: String,
    #[serde(rename = "ref")]
    pub r#ref: String,
}

impl Module {
    fn write(&self, enc: &mut Encoder) {
        enc.string(1, &self.call_digest);
        enc.string(2, &self.name);
        enc.string(3, &self.r#ref);
    }

    fn read(mut dec: Decoder<'_>) -> Result<Self> {
        let mut module = Module::default();
        while let Some((field, wire)) = dec.next_field()? {
            match field {
                1..=3 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    let value = dec.string(field)?;
                    match field {
                        1 => module.call_digest = value,
                        2 => module.name = value,
                        _ => module.r#ref = value,
                    }
                }
                _ => dec.skip(wire)?,
            }
        }
        Ok(module)
    }
}

/// One content-addressed field evaluation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Call {
    /// Digest of the call this field was selected from; empty for the root.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub receiver_digest: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r#type: Option<Type>,
    pub field: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<Argument>,
    #[serde(default)]
    pub tainted: bool,
    #[serde(default)]
    pub meta: bool,
    /// 1-based index selected from a list result, or 0.
    #[serde(default)]
    pub nth: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module: Option<Module>,
    #[serde(default)]
    pub digest: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub view: String,
}

impl Call {
    /// Start building a call selecting `field`.
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            ..Self::default()
        }
    }

    pub fn with_receiver(mut self, digest: impl Into<String>) -> Self {
        self.receiver_digest = digest.into();
        self
    }

    pub fn with_type(mut self, ty: Type) -> Self {
        self.r#type = Some(ty);
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: Literal) -> Self {
        self.args.push(Argument::new(name, value));
        self
    }

    pub fn with_nth(mut self, nth: i64) -> Self {
        self.nth = nth;
        self
    }

    pub fn with_module(mut self, module: Module) -> Self {
        self.module = Some(module);
        self
    }

    pub fn with_view(mut self, view: impl Into<String>) -> Self {
        self.view = view.into();
        self
    }

    /// Compute and store the digest.
    pub fn sealed(mut self) -> Self {
        self.digest = self.compute_digest();
        self
    }

    /// Canonical bytes of the call with its own digest excluded.
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.write(&mut enc, false);
        enc.into_bytes()
    }

    /// Hash the canonical encoding.
    pub fn compute_digest(&self) -> String {
        let hash = Sha256::digest(self.canonical_bytes());
        format!("{}{:x}", DIGEST_PREFIX, hash)
    }

    /// Whether the stored digest matches the content.
    pub fn verify_digest(&self) -> bool {
        self.digest == self.compute_digest()
    }

    /// Binary encoding including the digest.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.write(&mut enc, true);
        enc.into_bytes()
    }

    /// Decode the binary encoding.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Self::read(Decoder::new(bytes, "Call"))
    }

    /// Encode as an opaque textual token.
    pub fn encode(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Decode a token produced by [`Call::encode`].
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = STANDARD.decode(token.trim())?;
        let call = Self::from_bytes(&bytes)?;
        if call.field.is_empty() {
            return Err(CallError::MissingField);
        }
        Ok(call)
    }

    /// Render `field(arg: value, ...)#nth`.
    pub fn display_self(&self) -> String {
        let mut out = self.field.clone();
        if !self.args.is_empty() {
            let args: Vec<String> = self
                .args
                .iter()
                .map(|arg| format!("{}: {}", arg.name, arg.value.display()))
                .collect();
            out.push('(');
            out.push_str(&args.join(", "));
            out.push(')');
        }
        if self.nth != 0 {
            out.push_str(&format!("#{}", self.nth));
        }
        out
    }

    /// Digests referenced by arguments, deduplicated, in argument order.
    pub fn inputs(&self) -> Vec<String> {
        let mut inputs: Vec<String> = Vec::new();
        for arg in &self.args {
            arg.value.for_each_digest(&mut |digest| {
                if !inputs.iter().any(|seen| seen == digest) {
                    inputs.push(digest.to_string());
                }
            });
        }
        inputs
    }

    /// Every call this one depends on: receiver, argument references and
    /// the module's loading call.
    pub fn referenced_digests(&self) -> Vec<String> {
        let mut refs = Vec::new();
        if !self.receiver_digest.is_empty() {
            refs.push(self.receiver_digest.clone());
        }
        for arg in &self.args {
            arg.value.for_each_digest(&mut |digest| refs.push(digest.to_string()));
        }
        if let Some(module) = &self.module {
            if !module.call_digest.is_empty() {
                refs.push(module.call_digest.clone());
            }
        }
        refs
    }

    pub(crate) fn write(&self, enc: &mut Encoder, include_digest: bool) {
        enc.string(1, &self.receiver_digest);
        if let Some(ty) = &self.r#type {
            enc.message(2, |enc| ty.write(enc));
        }
        enc.string(3, &self.field);
        for arg in &self.args {
            enc.message(4, |enc| arg.write(enc));
        }
        enc.bool(5, self.tainted);
        enc.bool(6, self.meta);
        enc.int64(7, self.nth);
        if let Some(module) = &self.module {
            enc.message(8, |enc| module.write(enc));
        }
        if include_digest {
            enc.string(9, &self.digest);
        }
        enc.string(10, &self.view);
    }

    pub(crate) fn read(mut dec: Decoder<'_>) -> Result<Self> {
        let mut call = Call::default();
        while let Some((field, wire)) = dec.next_field()? {
            match field {
                1 | 3 | 9 | 10 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    let value = dec.string(field)?;
                    match field {
                        1 => call.receiver_digest = value,
                        3 => call.field = value,
                        9 => call.digest = value,
                        _ => call.view = value,
                    }
                }
                2 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    call.r#type = Some(Type::read(dec.message("Type")?)?);
                }
                4 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    call.args.push(Argument::read(dec.message("Argument")?)?);
                }
                5 => {
                    dec.expect(field, wire, WireType::Varint)?;
                    call.tainted = dec.bool()?;
                }
                6 => {
                    dec.expect(field, wire, WireType::Varint)?;
                    call.meta = dec.bool()?;
                }
                7 => {
                    dec.expect(field, wire, WireType::Varint)?;
                    call.nth = dec.int64()?;
                }
                8 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    call.module = Some(Module::read(dec.message("Module")?)?);
                }
                _ => dec.skip(wire)?,
            }
        }
        Ok(call)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container_from() -> Call {
        Call::new("from")
            .with_receiver("sha256:container")
            .with_type(Type::named("Container").non_null())
            .with_arg("address", Literal::from("alpine"))
            .sealed()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let call = Call::new("withExec")
            .with_receiver("sha256:abc")
            .with_type(Type::named("Container").non_null())
            .with_arg(
                "args",
                Literal::List(vec![Literal::from("echo"), Literal::from("hi")]),
            )
            .with_arg(
                "opts",
                Literal::Object(vec![Argument::new(
                    "dir",
                    Literal::CallDigest("sha256:dir".into()),
                )]),
            )
            .with_nth(2)
            .with_module(Module {
                call_digest: "sha256:mod".into(),
                name: "ci".into(),
                r#ref: "github.com/acme/ci".into(),
            })
            .with_view("v0.12")
            .sealed();

        let decoded = Call::decode(&call.encode()).unwrap();
        assert_eq!(decoded, call);
        assert!(decoded.verify_digest());
    }

    #[test]
    fn test_digest_is_deterministic() {
        let a = container_from();
        let b = container_from();
        assert_eq!(a.digest, b.digest);
        assert!(a.digest.starts_with(DIGEST_PREFIX));
        assert_eq!(a.digest.len(), DIGEST_PREFIX.len() + 64);
    }

    #[test]
    fn test_digest_excludes_itself() {
        let mut call = container_from();
        let expected = call.digest.clone();
        call.digest = "sha256:bogus".into();
        assert_eq!(call.compute_digest(), expected);
    }

    #[test]
    fn test_argument_order_is_significant() {
        let a = Call::new("f")
            .with_arg("x", Literal::Int(1))
            .with_arg("y", Literal::Int(2))
            .sealed();
        let b = Call::new("f")
            .with_arg("y", Literal::Int(2))
            .with_arg("x", Literal::Int(1))
            .sealed();
        assert_ne!(a.digest, b.digest);
    }

    #[test]
    fn test_decode_rejects_malformed() {
        assert!(matches!(
            Call::decode("not base64!!"),
            Err(CallError::Base64(_))
        ));
        // valid base64 of a truncated length-delimited field
        let token = STANDARD.encode([0x1a, 0x09, b'x']);
        assert!(matches!(Call::decode(&token), Err(CallError::Truncated(_))));
        // empty message has no field name
        assert!(matches!(Call::decode(""), Err(CallError::MissingField)));
    }

    #[test]
    fn test_decode_rejects_deeply_nested_type() {
        use crate::wire::nest_messages;

        // Type.elem (field 2) nested far past the decoder limit
        let ty = nest_messages(&[0x0a, 0x01, b'T'], &[0x12], 200_000);
        let mut bytes = vec![0x1a, 0x01, b'f'];
        bytes.extend(nest_messages(&ty, &[0x12], 1));
        assert!(matches!(Call::from_bytes(&bytes), Err(CallError::TooDeep(_))));

        let ty = nest_messages(&[0x0a, 0x01, b'T'], &[0x12], 20);
        let mut bytes = vec![0x1a, 0x01, b'f'];
        bytes.extend(nest_messages(&ty, &[0x12], 1));
        let call = Call::from_bytes(&bytes).unwrap();
        assert_eq!(call.r#type.unwrap().name(), "T");
    }

    #[test]
    fn test_type_display() {
        let ty = Type::list_of(Type::named("File").non_null()).non_null();
        assert_eq!(ty.to_string(), "[File!]!");
        assert_eq!(ty.name(), "File");
    }

    #[test]
    fn test_display_self() {
        let call = Call::new("withExec")
            .with_arg("args", Literal::List(vec![Literal::from("ls")]))
            .with_arg("expect", Literal::Enum("SUCCESS".into()))
            .with_nth(3);
        assert_eq!(
            call.display_self(),
            "withExec(args: [\"ls\"], expect: SUCCESS)#3"
        );
        assert_eq!(Call::new("sync").display_self(), "sync");
    }

    #[test]
    fn test_inputs_are_deduplicated() {
        let call = Call::new("merge")
            .with_receiver("sha256:recv")
            .with_arg("a", Literal::CallDigest("sha256:x".into()))
            .with_arg(
                "b",
                Literal::List(vec![
                    Literal::CallDigest("sha256:y".into()),
                    Literal::CallDigest("sha256:x".into()),
                ]),
            );
        assert_eq!(call.inputs(), vec!["sha256:x", "sha256:y"]);
        assert_eq!(
            call.referenced_digests(),
            vec!["sha256:recv", "sha256:x", "sha256:y", "sha256:x"]
        );
    }
}
