use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::checkpointer::Checkpointer;
use crate::error::{CheckpointError, CheckpointResult};
use crate::keys;
use crate::machine::{decode, encode, load_machine, stage_machine, Machine, MachineRecord};
use crate::value_store::Txn;

/// Persisted range of known versions: `[min, next)`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
struct VersionCursor {
    min: u64,
    next: u64,
}

/// One saved version: a machine snapshot plus opaque caller bytes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionRecord {
    pub machine: MachineRecord,
    pub aux: Option<Vec<u8>>,
}

/// Append-only sequence of machine snapshots numbered `0, 1, 2, …`.
///
/// The next version number lives in a persisted cursor that is read and
/// advanced in the same batch as the snapshot it numbers, so numbers are
/// never reused or skipped, even across restarts.
pub struct VersionedCheckpointer<'a> {
    cp: &'a Checkpointer,
    cursor: VersionCursor,
}

impl<'a> VersionedCheckpointer<'a> {
    /// Wrap `cp`, loading the known version range from storage.
    pub fn open(cp: &'a Checkpointer) -> CheckpointResult<Self> {
        let cursor = cp.read(|store| match store.get(keys::VERSION_META)? {
            Some(bytes) => decode_cursor(&bytes),
            None => Ok(VersionCursor::default()),
        })?;
        info!(min = cursor.min, next = cursor.next, "versioned checkpointer opened");
        Ok(Self { cp, cursor })
    }

    /// `(min_version, max_version)`; `(0, -1)` when nothing is saved yet.
    pub fn known_versions(&self) -> (u64, i64) {
        (self.cursor.min, self.cursor.next as i64 - 1)
    }

    /// Save `machine` with optional aux bytes as the next version and return
    /// its number.
    pub fn save_version<M: Machine>(
        &mut self,
        machine: &M,
        aux_state: Option<&[u8]>,
    ) -> CheckpointResult<u64> {
        let cursor = self.cp.transact(|txn| {
            let mut cursor = load_cursor(txn)?;
            let record = VersionRecord {
                machine: stage_machine(txn, machine)?,
                aux: aux_state.map(<[u8]>::to_vec),
            };
            txn.put(keys::version_record(cursor.next), encode(&record)?);
            cursor.next += 1;
            txn.put(keys::VERSION_META.to_vec(), encode(&cursor)?);
            Ok(cursor)
        })?;
        self.cursor = cursor;
        let version = cursor.next - 1;
        debug!(version, "version saved");
        Ok(version)
    }

    /// The record saved as `version`.
    pub fn version_record(&self, version: u64) -> CheckpointResult<VersionRecord> {
        self.check_known(version)?;
        self.cp.read(|store| {
            let bytes = store
                .get(&keys::version_record(version))?
                .ok_or_else(|| {
                    CheckpointError::Corruption(format!("version {version} is in range but missing"))
                })?;
            decode(&bytes, "version record")
        })
    }

    /// Rebuild the machine and aux bytes saved as `version`.
    pub fn restore_version<M: Machine>(
        &self,
        version: u64,
    ) -> CheckpointResult<(M, Option<Vec<u8>>)> {
        let record = self.version_record(version)?;
        let machine = self.cp.read(|store| load_machine(store, &record.machine))?;
        Ok((machine, record.aux))
    }

    pub fn aux_state(&self, version: u64) -> CheckpointResult<Option<Vec<u8>>> {
        Ok(self.version_record(version)?.aux)
    }

    fn check_known(&self, version: u64) -> CheckpointResult<()> {
        if version < self.cursor.min || version >= self.cursor.next {
            return Err(CheckpointError::not_found(format!("version {version}")));
        }
        Ok(())
    }
}

fn load_cursor(txn: &Txn<'_>) -> CheckpointResult<VersionCursor> {
    match txn.get(keys::VERSION_META)? {
        Some(bytes) => decode_cursor(&bytes),
        None => Ok(VersionCursor::default()),
    }
}

fn decode_cursor(bytes: &[u8]) -> CheckpointResult<VersionCursor> {
    let cursor: VersionCursor = decode(bytes, "version cursor")?;
    if cursor.min > cursor.next {
        return Err(CheckpointError::Corruption(format!(
            "version cursor min {} exceeds next {}",
            cursor.min, cursor.next
        )));
    }
    Ok(cursor)
}
