//! Foundation types for vmcp, the durable checkpoint layer.
//!
//! Every other vmcp crate depends on `vmcp-types`.
//!
//! # Key Types
//!
//! - [`Hash`] -- 32-byte structural BLAKE3 digest, the store's primary key
//! - [`Value`] -- immutable scalar-or-tuple datum forming a hash-addressed DAG
//! - [`StructuralHasher`] -- domain-separated hashing for each value shape

pub mod error;
pub mod hash;
pub mod value;

pub use error::TypeError;
pub use hash::{Hash, StructuralHasher};
pub use value::{Value, MAX_TUPLE_ARITY};
