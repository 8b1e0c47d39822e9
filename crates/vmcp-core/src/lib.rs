//! Durable checkpointing for virtual machines.
//!
//! A machine's state is split into opaque code bytes and a list of root
//! [`Value`]s. Values are stored once per distinct structural hash in a
//! reference-counted [`ValueStore`], so consecutive snapshots of a running
//! machine share nearly all of their storage.
//!
//! # Checkpointers
//!
//! - [`Checkpointer`] -- owns the store; saves and restores machines under
//!   byte keys
//! - [`VersionedCheckpointer`] -- numbered snapshot history with aux bytes
//! - [`EventChainCheckpointer`] -- two-phase (intent, signatures) records per
//!   sequence number, resumable after restart
//!
//! # Design Rules
//!
//! 1. Every mutating call commits one atomic batch before returning.
//! 2. A stored value is never rewritten; re-adding only bumps its count.
//! 3. Restored values and machines are checked against their recorded hashes.
//! 4. Sequence and version cursors live in storage, not in handles.

pub mod checkpointer;
pub mod config;
pub mod error;
pub mod event_chain;
pub(crate) mod keys;
pub mod machine;
pub mod value_store;
pub mod versioned;

#[cfg(test)]
mod test_support;

pub use checkpointer::Checkpointer;
pub use config::CheckpointConfig;
pub use error::{CheckpointError, CheckpointResult};
pub use event_chain::{EventChainCheckpointer, RecordState};
pub use machine::{Machine, MachineError, MachineImage, MachineRecord};
pub use value_store::ValueStore;
pub use versioned::{VersionRecord, VersionedCheckpointer};

pub use vmcp_store::SyncMode;
pub use vmcp_types::{Hash, Value};
