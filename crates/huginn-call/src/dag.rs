//! Call DAGs.
//!
//! A [`Dag`] is a root digest plus every call reachable from it, keyed by
//! digest so shared sub-calls are stored once.

use std::collections::{BTreeMap, HashMap};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::call::Call;
use crate::error::{CallError, Result};
use crate::wire::{Decoder, Encoder, WireType};

/// Looks up calls by digest.
pub trait CallResolver {
    /// Return the call for `digest`, if known.
    fn resolve_call(&self, digest: &str) -> Option<Call>;
}

impl CallResolver for HashMap<String, Call> {
    fn resolve_call(&self, digest: &str) -> Option<Call> {
        self.get(digest).cloned()
    }
}

impl CallResolver for BTreeMap<String, Call> {
    fn resolve_call(&self, digest: &str) -> Option<Call> {
        self.get(digest).cloned()
    }
}

/// A root call and the closure of calls it references.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dag {
    pub root_digest: String,
    pub calls_by_digest: BTreeMap<String, Call>,
}

impl Dag {
    /// Collect every call reachable from `root` through receivers, argument
    /// references (including those nested in lists and objects) and module
    /// digests. Digests the resolver does not know are left out.
    pub fn extract(root: &str, resolver: &impl CallResolver) -> Self {
        let mut dag = Dag {
            root_digest: root.to_string(),
            calls_by_digest: BTreeMap::new(),
        };
        dag.collect(root, resolver);
        dag
    }

    fn collect(&mut self, root: &str, resolver: &impl CallResolver) {
        // explicit worklist: receiver chains can be arbitrarily long
        let mut pending = vec![root.to_string()];
        while let Some(digest) = pending.pop() {
            if digest.is_empty() || self.calls_by_digest.contains_key(&digest) {
                continue;
            }
            let Some(call) = resolver.resolve_call(&digest) else {
                continue;
            };
            pending.extend(call.referenced_digests());
            self.calls_by_digest.insert(digest, call);
        }
    }

    /// The root call, if present.
    pub fn root(&self) -> Option<&Call> {
        self.calls_by_digest.get(&self.root_digest)
    }

    /// Binary encoding. Map entries are written in digest order.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.string(1, &self.root_digest);
        for (digest, call) in &self.calls_by_digest {
            enc.message(2, |enc| {
                enc.string(1, digest);
                enc.message(2, |enc| call.write(enc, true));
            });
        }
        enc.into_bytes()
    }

    /// Encode as an opaque textual token.
    pub fn encode(&self) -> String {
        STANDARD.encode(self.to_bytes())
    }

    /// Decode and validate a token produced by [`Dag::encode`].
    ///
    /// Fails if the root is absent, if any entry's key disagrees with its
    /// call's digest, or if any call references a digest the DAG lacks.
    pub fn decode(token: &str) -> Result<Self> {
        let bytes = STANDARD.decode(token.trim())?;
        let dag = Self::from_bytes(&bytes)?;
        dag.validate()?;
        Ok(dag)
    }

    /// Decode the binary encoding without validating references.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(bytes, "DAG");
        let mut dag = Dag::default();
        while let Some((field, wire)) = dec.next_field()? {
            match field {
                1 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    dag.root_digest = dec.string(field)?;
                }
                2 => {
                    dec.expect(field, wire, WireType::LengthDelimited)?;
                    let mut entry = dec.message("DAG.CallsByDigestEntry")?;
                    let mut key = String::new();
                    let mut call = Call::default();
                    while let Some((field, wire)) = entry.next_field()? {
                        match field {
                            1 => {
                                entry.expect(field, wire, WireType::LengthDelimited)?;
                                key = entry.string(field)?;
                            }
                            2 => {
                                entry.expect(field, wire, WireType::LengthDelimited)?;
                                call = Call::read(entry.message("Call")?)?;
                            }
                            _ => entry.skip(wire)?,
                        }
                    }
                    dag.calls_by_digest.insert(key, call);
                }
                _ => dec.skip(wire)?,
            }
        }
        Ok(dag)
    }

    fn validate(&self) -> Result<()> {
        if !self.calls_by_digest.contains_key(&self.root_digest) {
            return Err(CallError::MissingCall(self.root_digest.clone()));
        }
        for (digest, call) in &self.calls_by_digest {
            if *digest != call.digest {
                return Err(CallError::DigestMismatch {
                    expected: digest.clone(),
                    actual: call.digest.clone(),
                });
            }
            for dep in call.referenced_digests() {
                if !self.calls_by_digest.contains_key(&dep) {
                    return Err(CallError::MissingCall(dep));
                }
            }
        }
        Ok(())
    }
}

impl CallResolver for Dag {
    fn resolve_call(&self, digest: &str) -> Option<Call> {
        self.calls_by_digest.get(digest).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::literal::{Argument, Literal};

    /// container -> from -> withDirectory(dir: directory) where the
    /// directory is also selected from container, forming a diamond.
    fn diamond() -> (String, HashMap<String, Call>) {
        let container = Call::new("container").sealed();
        let from = Call::new("from")
            .with_receiver(&container.digest)
            .with_arg("address", Literal::from("alpine"))
            .sealed();
        let dir = Call::new("directory")
            .with_receiver(&container.digest)
            .sealed();
        let with_dir = Call::new("withDirectory")
            .with_receiver(&from.digest)
            .with_arg(
                "opts",
                Literal::Object(vec![Argument::new(
                    "source",
                    Literal::List(vec![Literal::CallDigest(dir.digest.clone())]),
                )]),
            )
            .sealed();
        let root = with_dir.digest.clone();
        let calls = [container, from, dir, with_dir]
            .into_iter()
            .map(|c| (c.digest.clone(), c))
            .collect();
        (root, calls)
    }

    #[test]
    fn test_extract_follows_nested_references() {
        let (root, calls) = diamond();
        let dag = Dag::extract(&root, &calls);
        assert_eq!(dag.calls_by_digest.len(), 4);
        assert_eq!(dag.root().map(|c| c.field.as_str()), Some("withDirectory"));
    }

    #[test]
    fn test_extract_skips_unknown_digests() {
        let call = Call::new("load")
            .with_arg("id", Literal::CallDigest("sha256:unknown".into()))
            .sealed();
        let mut calls = HashMap::new();
        calls.insert(call.digest.clone(), call.clone());
        let dag = Dag::extract(&call.digest, &calls);
        assert_eq!(dag.calls_by_digest.len(), 1);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let (root, calls) = diamond();
        let dag = Dag::extract(&root, &calls);
        let decoded = Dag::decode(&dag.encode()).unwrap();
        assert_eq!(decoded, dag);
    }

    #[test]
    fn test_encoding_is_deterministic() {
        let (root, calls) = diamond();
        let a = Dag::extract(&root, &calls).encode();
        let b = Dag::extract(&root, &calls).encode();
        assert_eq!(a, b);
    }

    #[test]
    fn test_decode_rejects_missing_reference() {
        let (root, calls) = diamond();
        let mut dag = Dag::extract(&root, &calls);
        let container = calls
            .values()
            .find(|c| c.field == "container")
            .map(|c| c.digest.clone())
            .unwrap();
        dag.calls_by_digest.remove(&container);
        assert!(matches!(
            Dag::decode(&dag.encode()),
            Err(CallError::MissingCall(d)) if d == container
        ));
    }

    #[test]
    fn test_decode_rejects_digest_mismatch() {
        let call = Call::new("container").sealed();
        let mut dag = Dag {
            root_digest: "sha256:other".into(),
            calls_by_digest: BTreeMap::new(),
        };
        dag.calls_by_digest.insert("sha256:other".into(), call);
        assert!(matches!(
            Dag::decode(&dag.encode()),
            Err(CallError::DigestMismatch { .. })
        ));
    }

    #[test]
    fn test_extract_long_receiver_chain() {
        let mut calls = HashMap::new();
        let mut tip = Call::new("container").sealed();
        calls.insert(tip.digest.clone(), tip.clone());
        for n in 0..50_000 {
            tip = Call::new("withEnvVariable")
                .with_receiver(&tip.digest)
                .with_nth(n)
                .sealed();
            calls.insert(tip.digest.clone(), tip.clone());
        }
        let dag = Dag::extract(&tip.digest, &calls);
        assert_eq!(dag.calls_by_digest.len(), 50_001);
    }

    #[test]
    fn test_decode_rejects_deeply_nested_call() {
        use crate::wire::nest_messages;

        // DAG{calls: Entry{call: Call{type: Type{elem: ...}}}}
        let mut call = vec![0x1a, 0x01, b'f'];
        call.extend(nest_messages(&[0x0a, 0x01, b'T'], &[0x12], 5_000));
        let entry = nest_messages(&call, &[0x12], 1);
        let bytes = nest_messages(&entry, &[0x12], 1);
        assert!(matches!(Dag::from_bytes(&bytes), Err(CallError::TooDeep(_))));
    }

    #[test]
    fn test_decode_rejects_missing_root() {
        let dag = Dag {
            root_digest: "sha256:nothing".into(),
            calls_by_digest: BTreeMap::new(),
        };
        assert!(matches!(
            Dag::decode(&dag.encode()),
            Err(CallError::MissingCall(_))
        ));
    }
}
