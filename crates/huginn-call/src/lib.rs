//! huginn-call: Content-addressed call graphs
//!
//! This crate provides the identity layer for traced operations:
//!
//! - **Call**: one field selection with receiver, arguments, return type and module
//! - **Literal**: argument values, including references to other calls by digest
//! - **Digest**: SHA-256 over a deterministic protobuf-compatible encoding
//! - **Dag**: a root call plus every call reachable from it, deduplicated by digest
//!
//! # Usage
//!
//! ```rust
//! use huginn_call::{Call, Dag, Literal, Type};
//! use std::collections::HashMap;
//!
//! let container = Call::new("container").sealed();
//! let from = Call::new("from")
//!     .with_receiver(&container.digest)
//!     .with_type(Type::named("Container").non_null())
//!     .with_arg("address", Literal::from("alpine"))
//!     .sealed();
//!
//! let token = from.encode();
//! assert_eq!(Call::decode(&token).unwrap(), from);
//!
//! let calls: HashMap<String, Call> = [container, from.clone()]
//!     .into_iter()
//!     .map(|c| (c.digest.clone(), c))
//!     .collect();
//! let dag = Dag::extract(&from.digest, &calls);
//! assert_eq!(dag.calls_by_digest.len(), 2);
//! ```

pub mod call;
pub mod dag;
pub mod error;
pub mod literal;
mod wire;

pub use call::{Call, DIGEST_PREFIX, Module, Type};
pub use dag::{CallResolver, Dag};
pub use error::{CallError, Result};
pub use literal::{Argument, Literal};
