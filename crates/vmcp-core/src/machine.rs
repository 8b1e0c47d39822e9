//! The boundary between the checkpointer and a VM engine.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use vmcp_store::KvStore;
use vmcp_types::{Hash, Value};

use crate::error::{CheckpointError, CheckpointResult};
use crate::value_store::{restore_with, stage_add_ref, Txn};

/// Engine-defined serialization of a machine's full state.
///
/// `code` is opaque to the checkpointer and stored verbatim. Everything else
/// (registers, stacks, data structures) is expressed as `roots`, which go
/// through the value store and share structure with earlier snapshots.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MachineImage {
    pub code: Vec<u8>,
    pub roots: Vec<Value>,
}

/// The engine refused to rebuild a machine from an image.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("machine image rejected: {0}")]
pub struct MachineError(pub String);

/// A VM whose state can be checkpointed.
///
/// The checkpointer never runs a machine; it only moves its state in and
/// out of storage.
pub trait Machine: Sized {
    /// The machine's own content hash.
    fn machine_hash(&self) -> Hash;

    /// Snapshot the full state. Later mutation of `self` must not affect the
    /// returned image.
    fn to_image(&self) -> MachineImage;

    /// Rebuild a machine from an image produced by [`Machine::to_image`].
    fn from_image(image: MachineImage) -> Result<Self, MachineError>;
}

/// Root descriptor persisted for one machine snapshot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineRecord {
    /// [`Machine::machine_hash`] at save time.
    pub machine_hash: Hash,
    pub code: Vec<u8>,
    pub roots: Vec<Hash>,
}

/// Stage every reachable value of `machine` and return its descriptor.
pub(crate) fn stage_machine<M: Machine>(
    txn: &mut Txn<'_>,
    machine: &M,
) -> CheckpointResult<MachineRecord> {
    let image = machine.to_image();
    let roots = image
        .roots
        .iter()
        .map(|root| stage_add_ref(txn, root))
        .collect::<CheckpointResult<Vec<_>>>()?;
    Ok(MachineRecord {
        machine_hash: machine.machine_hash(),
        code: image.code,
        roots,
    })
}

/// Rebuild the image described by `record`, sharing nodes across roots.
pub(crate) fn load_image(
    store: &dyn KvStore,
    record: &MachineRecord,
) -> CheckpointResult<MachineImage> {
    let mut memo = HashMap::new();
    let roots = record
        .roots
        .iter()
        .map(|hash| restore_with(store, *hash, &mut memo))
        .collect::<CheckpointResult<Vec<_>>>()?;
    Ok(MachineImage {
        code: record.code.clone(),
        roots,
    })
}

/// Rebuild a machine and check it hashes to what was saved.
pub(crate) fn load_machine<M: Machine>(
    store: &dyn KvStore,
    record: &MachineRecord,
) -> CheckpointResult<M> {
    let image = load_image(store, record)?;
    let machine = M::from_image(image).map_err(|e| CheckpointError::Corruption(e.to_string()))?;
    let computed = machine.machine_hash();
    if computed != record.machine_hash {
        return Err(CheckpointError::HashMismatch {
            expected: record.machine_hash,
            computed,
        });
    }
    Ok(machine)
}

pub(crate) fn encode<T: Serialize>(value: &T) -> CheckpointResult<Vec<u8>> {
    bincode::serialize(value).map_err(|e| CheckpointError::Serialization(e.to_string()))
}

/// Decode persisted metadata; failures are corruption, not caller error.
pub(crate) fn decode<T: DeserializeOwned>(bytes: &[u8], what: &str) -> CheckpointResult<T> {
    bincode::deserialize(bytes).map_err(|e| CheckpointError::Corruption(format!("{what}: {e}")))
}
