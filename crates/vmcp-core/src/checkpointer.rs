use std::sync::Mutex;

use tracing::{debug, info};
use vmcp_store::{InMemoryKvStore, KvStore, LogKvStore, OpenMode, WriteBatch};
use vmcp_types::{Hash, Value};

use crate::config::CheckpointConfig;
use crate::error::{CheckpointError, CheckpointResult};
use crate::keys;
use crate::machine::{decode, encode, load_image, load_machine, stage_machine};
use crate::machine::{Machine, MachineImage, MachineRecord};
use crate::value_store::{stage_add_ref, Txn, ValueStore};

/// Persists machine snapshots under caller-chosen byte keys.
///
/// A `Checkpointer` exclusively owns one storage location. Every mutating
/// call commits one atomic, durable batch before returning, and all calls
/// are serialised behind a single lock. The versioned and event-chain
/// checkpointers borrow a `Checkpointer` and do all their I/O through it,
/// so it cannot be closed while they are alive.
pub struct Checkpointer {
    store: Box<dyn KvStore>,
    lock: Mutex<()>,
}

impl Checkpointer {
    /// Open the log store at `config.path`.
    ///
    /// `fresh = true` destroys anything previously stored there;
    /// `fresh = false` reopens it with everything committed before.
    pub fn open(config: &CheckpointConfig, fresh: bool) -> CheckpointResult<Self> {
        let store = LogKvStore::open(
            &config.path,
            OpenMode::from_fresh(fresh),
            config.log_config(),
        )?;
        info!(path = %config.path.display(), fresh, "checkpointer opened");
        Ok(Self::with_store(Box::new(store)))
    }

    /// Open an existing store for inspection only.
    ///
    /// Nothing is created or truncated. A missing store is `NotFound`, and
    /// every mutating call fails with a storage error.
    pub fn open_read_only(config: &CheckpointConfig) -> CheckpointResult<Self> {
        let store = LogKvStore::open(&config.path, OpenMode::ReadOnly, config.log_config())?;
        info!(path = %config.path.display(), "checkpointer opened read-only");
        Ok(Self::with_store(Box::new(store)))
    }

    /// Open like [`Checkpointer::open`], then prime the value store with
    /// `seed`'s values so later snapshots of the same program share them.
    pub fn open_seeded<M: Machine>(
        config: &CheckpointConfig,
        seed: &M,
        fresh: bool,
    ) -> CheckpointResult<Self> {
        let cp = Self::open(config, fresh)?;
        cp.prime(seed)?;
        Ok(cp)
    }

    /// Wrap an already-open store.
    pub fn with_store(store: Box<dyn KvStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    /// A checkpointer that keeps everything in memory.
    pub fn in_memory() -> Self {
        Self::with_store(Box::new(InMemoryKvStore::new()))
    }

    /// Reference every root value of `machine` without recording a key.
    pub fn prime<M: Machine>(&self, machine: &M) -> CheckpointResult<()> {
        let record = self.transact(|txn| stage_machine(txn, machine))?;
        debug!(machine = %record.machine_hash.short_hex(), roots = record.roots.len(), "primed seed machine");
        Ok(())
    }

    /// Snapshot `machine` under `key`, replacing any earlier association.
    pub fn save_machine<M: Machine>(&self, key: &[u8], machine: &M) -> CheckpointResult<()> {
        let record = self.transact(|txn| {
            let record = stage_machine(txn, machine)?;
            txn.put(keys::machine(key), encode(&record)?);
            Ok(record)
        })?;
        debug!(key = %display_key(key), machine = %record.machine_hash.short_hex(), "machine saved");
        Ok(())
    }

    /// Rebuild the machine saved under `key`.
    pub fn restore_machine<M: Machine>(&self, key: &[u8]) -> CheckpointResult<M> {
        self.read(|store| {
            let record = read_machine_record(store, key)?;
            load_machine(store, &record)
        })
    }

    /// The descriptor saved under `key`.
    pub fn machine_record(&self, key: &[u8]) -> CheckpointResult<MachineRecord> {
        self.read(|store| read_machine_record(store, key))
    }

    /// The image saved under `key`, without handing it to an engine.
    pub fn restore_image(&self, key: &[u8]) -> CheckpointResult<MachineImage> {
        self.read(|store| {
            let record = read_machine_record(store, key)?;
            load_image(store, &record)
        })
    }

    /// All keys with a saved machine, in key order.
    pub fn machine_keys(&self) -> CheckpointResult<Vec<Vec<u8>>> {
        self.read(|store| {
            Ok(store
                .scan_prefix(keys::MACHINE)?
                .into_iter()
                .map(|(k, _)| k[keys::MACHINE.len()..].to_vec())
                .collect())
        })
    }

    /// Forget the association for `key`. Returns `false` if there was none.
    ///
    /// The values the snapshot referenced stay in the value store.
    pub fn delete_machine(&self, key: &[u8]) -> CheckpointResult<bool> {
        let _guard = self.lock.lock().expect("checkpointer lock poisoned");
        let full = keys::machine(key);
        if !self.store.contains(&full)? {
            return Ok(false);
        }
        let mut batch = WriteBatch::new();
        batch.delete(full);
        self.store.write(batch)?;
        Ok(true)
    }

    /// Store `value` in the value store and return its hash.
    pub fn add_ref_value(&self, value: &Value) -> CheckpointResult<Hash> {
        self.transact(|txn| stage_add_ref(txn, value))
    }

    pub fn restore_value(&self, hash: Hash) -> CheckpointResult<Value> {
        self.read(|store| ValueStore::new(store).restore(hash))
    }

    pub fn ref_count(&self, hash: &Hash) -> CheckpointResult<u64> {
        self.read(|store| ValueStore::new(store).ref_count(hash))
    }

    /// Flush and release the storage location.
    ///
    /// Flush failures are returned; the location is released either way.
    pub fn close(self) -> CheckpointResult<()> {
        {
            let _guard = self.lock.lock().expect("checkpointer lock poisoned");
            self.store.flush()?;
        }
        drop(self.store);
        info!("checkpointer closed");
        Ok(())
    }

    /// Run `f` against a staging transaction and commit it as one batch.
    ///
    /// Nothing is written if `f` fails.
    pub(crate) fn transact<T>(
        &self,
        f: impl FnOnce(&mut Txn<'_>) -> CheckpointResult<T>,
    ) -> CheckpointResult<T> {
        let _guard = self.lock.lock().expect("checkpointer lock poisoned");
        let mut txn = Txn::new(self.store.as_ref());
        let out = f(&mut txn)?;
        txn.commit()?;
        Ok(out)
    }

    /// Run a read-only `f` under the lock.
    pub(crate) fn read<T>(
        &self,
        f: impl FnOnce(&dyn KvStore) -> CheckpointResult<T>,
    ) -> CheckpointResult<T> {
        let _guard = self.lock.lock().expect("checkpointer lock poisoned");
        f(self.store.as_ref())
    }
}

impl std::fmt::Debug for Checkpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Checkpointer").finish_non_exhaustive()
    }
}

fn read_machine_record(store: &dyn KvStore, key: &[u8]) -> CheckpointResult<MachineRecord> {
    let bytes = store
        .get(&keys::machine(key))?
        .ok_or_else(|| CheckpointError::not_found(format!("machine {}", display_key(key))))?;
    decode(&bytes, "machine record")
}

/// Printable form of a caller key: UTF-8 when possible, hex otherwise.
pub(crate) fn display_key(key: &[u8]) -> String {
    match std::str::from_utf8(key) {
        Ok(s) => format!("{s:?}"),
        Err(_) => format!("0x{}", hex::encode(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FibMachine, ForgetfulMachine};
    use vmcp_store::StoreError;

    fn on_disk(dir: &std::path::Path) -> CheckpointConfig {
        CheckpointConfig::at(dir.join("cp"))
    }

    #[test]
    fn open_and_close() {
        let dir = tempfile::tempdir().unwrap();
        let cp = Checkpointer::open(&on_disk(dir.path()), true).unwrap();
        cp.close().unwrap();
    }

    #[test]
    fn values_roundtrip_through_checkpointer() {
        let cp = Checkpointer::in_memory();
        let v38 = Value::int(38);
        let hash = cp.add_ref_value(&v38).unwrap();
        assert_eq!(cp.restore_value(hash).unwrap(), v38);

        let tup1 = Value::tuple(vec![v38.clone(), v38.clone(), Value::EmptyTuple]).unwrap();
        let tup2 = Value::tuple(vec![
            tup1.clone(),
            v38.clone(),
            v38.clone(),
            tup1.clone(),
            v38,
            tup1,
        ])
        .unwrap();
        let hash2 = cp.add_ref_value(&tup2).unwrap();
        assert_eq!(hash2, tup2.hash());
        assert_eq!(cp.restore_value(hash2).unwrap(), tup2);
        assert_eq!(cp.ref_count(&hash2).unwrap(), 1);
    }

    #[test]
    fn save_is_a_snapshot_not_an_alias() {
        let cp = Checkpointer::in_memory();
        let mut machine = FibMachine::new();
        machine.run(10);

        cp.save_machine(b"test", &machine).unwrap();
        let restored: FibMachine = cp.restore_machine(b"test").unwrap();
        assert_eq!(restored.machine_hash(), machine.machine_hash());

        let saved_hash = machine.machine_hash();
        machine.run(10);
        let restored: FibMachine = cp.restore_machine(b"test").unwrap();
        assert_eq!(restored.machine_hash(), saved_hash);
        assert_ne!(restored.machine_hash(), machine.machine_hash());
    }

    #[test]
    fn saving_same_key_twice_keeps_latest() {
        let cp = Checkpointer::in_memory();
        let mut machine = FibMachine::new();
        machine.run(10);
        cp.save_machine(b"test", &machine).unwrap();

        machine.run(10);
        cp.save_machine(b"test", &machine).unwrap();

        let restored: FibMachine = cp.restore_machine(b"test").unwrap();
        assert_eq!(restored.machine_hash(), machine.machine_hash());
        assert_eq!(restored.steps(), 20);
        assert_eq!(cp.machine_keys().unwrap(), vec![b"test".to_vec()]);
    }

    #[test]
    fn consecutive_snapshots_share_values() {
        let cp = Checkpointer::in_memory();
        let mut machine = FibMachine::new();
        machine.run(5);
        cp.save_machine(b"a", &machine).unwrap();
        let statics = machine.to_image().roots[4].hash();
        machine.run(1);
        cp.save_machine(b"b", &machine).unwrap();

        // Both snapshots reference the same static tuple node.
        assert_eq!(cp.ref_count(&statics).unwrap(), 2);
        let image = cp.restore_image(b"b").unwrap();
        assert_eq!(image.roots[4].hash(), statics);
    }

    #[test]
    fn restore_missing_key_is_not_found() {
        let cp = Checkpointer::in_memory();
        let err = cp.restore_machine::<FibMachine>(b"nope").unwrap_err();
        assert!(err.is_not_found());
        assert!(cp.machine_record(b"nope").unwrap_err().is_not_found());
    }

    #[test]
    fn machines_survive_restart() {
        let dir = tempfile::tempdir().unwrap();
        let config = on_disk(dir.path());
        let mut machine = FibMachine::new();
        machine.run(7);

        let cp = Checkpointer::open_seeded(&config, &machine, true).unwrap();
        cp.save_machine(b"test", &machine).unwrap();
        cp.close().unwrap();

        let cp = Checkpointer::open(&config, false).unwrap();
        let restored: FibMachine = cp.restore_machine(b"test").unwrap();
        assert_eq!(restored.machine_hash(), machine.machine_hash());
        cp.close().unwrap();
    }

    #[test]
    fn fresh_open_discards_previous_snapshots() {
        let dir = tempfile::tempdir().unwrap();
        let config = on_disk(dir.path());
        let cp = Checkpointer::open(&config, true).unwrap();
        cp.save_machine(b"test", &FibMachine::new()).unwrap();
        cp.close().unwrap();

        let cp = Checkpointer::open(&config, true).unwrap();
        assert!(cp
            .restore_machine::<FibMachine>(b"test")
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn double_open_is_already_open() {
        let dir = tempfile::tempdir().unwrap();
        let config = on_disk(dir.path());
        let cp = Checkpointer::open(&config, true).unwrap();
        let err = Checkpointer::open(&config, false).unwrap_err();
        assert!(matches!(err, CheckpointError::AlreadyOpen(_)));
        cp.close().unwrap();
        Checkpointer::open(&config, false).unwrap().close().unwrap();
    }

    #[test]
    fn read_only_open_never_creates_a_store() {
        let dir = tempfile::tempdir().unwrap();
        let config = on_disk(dir.path());
        let err = Checkpointer::open_read_only(&config).unwrap_err();
        assert!(err.is_not_found());
        assert!(!config.path.exists());
    }

    #[test]
    fn read_only_open_restores_but_rejects_saves() {
        let dir = tempfile::tempdir().unwrap();
        let config = on_disk(dir.path());
        let mut machine = FibMachine::new();
        machine.run(4);
        let cp = Checkpointer::open(&config, true).unwrap();
        cp.save_machine(b"test", &machine).unwrap();
        cp.close().unwrap();

        let cp = Checkpointer::open_read_only(&config).unwrap();
        let restored: FibMachine = cp.restore_machine(b"test").unwrap();
        assert_eq!(restored.machine_hash(), machine.machine_hash());
        let err = cp.save_machine(b"other", &machine).unwrap_err();
        assert!(matches!(err, CheckpointError::Storage(StoreError::ReadOnly(_))));
        assert_eq!(cp.machine_keys().unwrap(), vec![b"test".to_vec()]);
        cp.close().unwrap();
    }

    #[test]
    fn hash_mismatch_after_engine_restore_is_reported() {
        let cp = Checkpointer::in_memory();
        let mut inner = FibMachine::new();
        inner.run(3);
        cp.save_machine(b"m", &ForgetfulMachine(inner)).unwrap();
        let err = cp.restore_machine::<ForgetfulMachine>(b"m").unwrap_err();
        assert!(matches!(err, CheckpointError::HashMismatch { .. }));
    }

    #[test]
    fn delete_machine_removes_only_the_key() {
        let cp = Checkpointer::in_memory();
        let machine = FibMachine::new();
        cp.save_machine(b"gone", &machine).unwrap();
        let root = cp.machine_record(b"gone").unwrap().roots[4];

        assert!(cp.delete_machine(b"gone").unwrap());
        assert!(!cp.delete_machine(b"gone").unwrap());
        assert!(cp.machine_keys().unwrap().is_empty());
        assert!(cp.restore_value(root).is_ok());
    }

    #[test]
    fn display_key_handles_binary() {
        assert_eq!(display_key(b"test"), "\"test\"");
        assert_eq!(display_key(&[0xff, 0x01]), "0xff01");
    }
}
