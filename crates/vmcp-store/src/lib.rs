//! Embedded key-value substrate for vmcp.
//!
//! The checkpoint layer needs an ordered, durable key-value store with
//! atomic multi-key writes and prefix scans. This crate provides that
//! contract as the [`KvStore`] trait and two backends:
//!
//! - [`InMemoryKvStore`] -- `BTreeMap`-based store for tests and embedding
//! - [`LogKvStore`] -- append-only, CRC-framed log file replayed into an
//!   ordered index on open
//!
//! # Design Rules
//!
//! 1. A [`WriteBatch`] is applied as one unit: after a crash either all of
//!    its operations are visible or none are.
//! 2. Writes are durable when `write` returns (under [`SyncMode::EveryWrite`]).
//! 3. A store location is held by at most one open handle at a time.
//! 4. All I/O errors are propagated, never silently ignored.

pub mod batch;
pub mod error;
pub mod log;
pub mod memory;
pub mod traits;

pub use batch::{BatchOp, WriteBatch};
pub use error::{StoreError, StoreResult};
pub use log::{LogConfig, LogKvStore, OpenMode, SyncMode};
pub use memory::InMemoryKvStore;
pub use traits::KvStore;
