//! Content-addressed, reference-counted persistence for [`Value`]s.
//!
//! Each distinct sub-value is stored once under `val/<hash>` as a
//! [`StoredNode`]: a scalar, or the ordered hashes of a tuple's children.
//! Next to it, `rc/<hash>` holds a persisted reference count. A count is the
//! number of explicit `add_ref` calls on that hash plus the number of stored
//! parent edges that point at it; children are counted once per edge when
//! their parent is first stored, and never revisited after that.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tracing::debug;
use vmcp_store::{KvStore, WriteBatch};
use vmcp_types::{Hash, StructuralHasher, Value};

use crate::error::{CheckpointError, CheckpointResult};
use crate::keys;

/// On-disk form of one value node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum StoredNode {
    Int(i64),
    /// Child hashes in order; empty for the empty tuple.
    Tuple(Vec<Hash>),
}

impl StoredNode {
    fn of(value: &Value) -> Self {
        match value {
            Value::Int(v) => Self::Int(*v),
            Value::Tuple(_) | Value::EmptyTuple => {
                Self::Tuple(value.children().iter().map(Value::hash).collect())
            }
        }
    }

    /// Structural hash recomputed from the node alone.
    fn hash(&self) -> Hash {
        match self {
            Self::Int(v) => StructuralHasher::INT.hash_int(*v),
            Self::Tuple(children) => StructuralHasher::TUPLE.hash_children(children),
        }
    }
}

/// Staged writes over a [`KvStore`], committed as one atomic batch.
///
/// Reads see the transaction's own writes first.
pub(crate) struct Txn<'s> {
    store: &'s dyn KvStore,
    staged: BTreeMap<Vec<u8>, Vec<u8>>,
    erased_prefixes: Vec<Vec<u8>>,
    batch: WriteBatch,
}

impl<'s> Txn<'s> {
    pub(crate) fn new(store: &'s dyn KvStore) -> Self {
        Self {
            store,
            staged: BTreeMap::new(),
            erased_prefixes: Vec::new(),
            batch: WriteBatch::new(),
        }
    }

    pub(crate) fn get(&self, key: &[u8]) -> CheckpointResult<Option<Vec<u8>>> {
        if let Some(value) = self.staged.get(key) {
            return Ok(Some(value.clone()));
        }
        if self.erased_prefixes.iter().any(|p| key.starts_with(p)) {
            return Ok(None);
        }
        Ok(self.store.get(key)?)
    }

    pub(crate) fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.staged.insert(key.clone(), value.clone());
        self.batch.put(key, value);
    }

    pub(crate) fn delete_prefix(&mut self, prefix: Vec<u8>) {
        self.staged.retain(|k, _| !k.starts_with(&prefix));
        self.batch.delete_prefix(prefix.clone());
        self.erased_prefixes.push(prefix);
    }

    pub(crate) fn commit(self) -> CheckpointResult<()> {
        let ops = self.batch.len();
        self.store.write(self.batch)?;
        debug!(ops, "checkpoint transaction committed");
        Ok(())
    }
}

/// Stage an `add_ref` of `value` into `txn`, returning its root hash.
///
/// Walks with an explicit stack rather than recursion.
pub(crate) fn stage_add_ref(txn: &mut Txn<'_>, value: &Value) -> CheckpointResult<Hash> {
    let root = value.hash();
    let mut pending = vec![value.clone()];
    let mut stored = 0usize;

    while let Some(v) = pending.pop() {
        let hash = v.hash();
        let count = read_ref_count(txn.get(&keys::refcount(&hash))?, &hash)?;
        txn.put(keys::refcount(&hash), (count + 1).to_le_bytes().to_vec());
        if count > 0 {
            continue;
        }
        let node = bincode::serialize(&StoredNode::of(&v))
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        txn.put(keys::value(&hash), node);
        stored += 1;
        pending.extend(v.children().iter().cloned());
    }

    debug!(root = %root.short_hex(), new_nodes = stored, "value referenced");
    Ok(root)
}

/// Reconstruct the value stored under `hash` from `store`.
///
/// Nodes are memoised by hash, so sub-values shared in storage come back
/// as shared allocations. Callers restoring several roots of one snapshot
/// pass the same `memo` to keep sharing across roots. The walk keeps its
/// own stack of partially rebuilt tuples, so depth is bounded by heap, not
/// by the thread stack.
pub(crate) fn restore_with(
    store: &dyn KvStore,
    hash: Hash,
    memo: &mut HashMap<Hash, Value>,
) -> CheckpointResult<Value> {
    let mut pending: Vec<PendingTuple> = Vec::new();
    let mut current = hash;

    loop {
        // Descend until `current` resolves to a finished value.
        let mut done = match memo.get(&current) {
            Some(v) => v.clone(),
            None => match read_node(store, current)? {
                StoredNode::Int(v) => {
                    let value = Value::Int(v);
                    memo.insert(current, value.clone());
                    value
                }
                StoredNode::Tuple(children) => match children.first() {
                    None => {
                        memo.insert(current, Value::EmptyTuple);
                        Value::EmptyTuple
                    }
                    Some(&first) => {
                        pending.push(PendingTuple {
                            hash: current,
                            items: Vec::with_capacity(children.len()),
                            children,
                        });
                        current = first;
                        continue;
                    }
                },
            },
        };

        // Ascend, handing each finished value to its parent.
        loop {
            let Some(mut parent) = pending.pop() else {
                return Ok(done);
            };
            parent.items.push(done);
            if let Some(&next) = parent.children.get(parent.items.len()) {
                current = next;
                pending.push(parent);
                break;
            }
            done = Value::tuple(parent.items).map_err(|e| {
                CheckpointError::Corruption(format!("node {}: {e}", parent.hash))
            })?;
            memo.insert(parent.hash, done.clone());
        }
    }
}

/// A tuple whose children are still being restored.
struct PendingTuple {
    hash: Hash,
    children: Vec<Hash>,
    items: Vec<Value>,
}

/// Read and integrity-check one stored node.
fn read_node(store: &dyn KvStore, hash: Hash) -> CheckpointResult<StoredNode> {
    let bytes = store
        .get(&keys::value(&hash))?
        .ok_or_else(|| CheckpointError::not_found(format!("value {hash}")))?;
    let node: StoredNode = bincode::deserialize(&bytes)
        .map_err(|e| CheckpointError::Corruption(format!("undecodable node {hash}: {e}")))?;
    let computed = node.hash();
    if computed != hash {
        return Err(CheckpointError::HashMismatch {
            expected: hash,
            computed,
        });
    }
    Ok(node)
}

fn read_ref_count(raw: Option<Vec<u8>>, hash: &Hash) -> CheckpointResult<u64> {
    match raw {
        None => Ok(0),
        Some(bytes) => {
            let arr: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
                CheckpointError::Corruption(format!(
                    "reference count for {hash} has {} bytes",
                    bytes.len()
                ))
            })?;
            Ok(u64::from_le_bytes(arr))
        }
    }
}

/// Value store over any [`KvStore`].
///
/// Each call is one atomic batch. `ValueStore` does not lock; callers that
/// share a store between threads serialise access themselves, as
/// [`Checkpointer`](crate::Checkpointer) does.
pub struct ValueStore<'a> {
    store: &'a dyn KvStore,
}

impl<'a> ValueStore<'a> {
    pub fn new(store: &'a dyn KvStore) -> Self {
        Self { store }
    }

    /// Persist `value` (or bump the counts of what is already there) and
    /// return its root hash.
    pub fn add_ref(&self, value: &Value) -> CheckpointResult<Hash> {
        let mut txn = Txn::new(self.store);
        let hash = stage_add_ref(&mut txn, value)?;
        txn.commit()?;
        Ok(hash)
    }

    /// Rebuild the value stored under `hash`.
    ///
    /// Fails with `NotFound` if any node is absent and with `HashMismatch`
    /// if a node's content does not hash to its key.
    pub fn restore(&self, hash: Hash) -> CheckpointResult<Value> {
        restore_with(self.store, hash, &mut HashMap::new())
    }

    /// Persisted reference count of `hash`; 0 when not stored.
    pub fn ref_count(&self, hash: &Hash) -> CheckpointResult<u64> {
        read_ref_count(self.store.get(&keys::refcount(hash))?, hash)
    }

    pub fn contains(&self, hash: &Hash) -> CheckpointResult<bool> {
        Ok(self.store.contains(&keys::value(hash))?)
    }

    /// Number of distinct nodes stored.
    pub fn node_count(&self) -> CheckpointResult<usize> {
        Ok(self.store.scan_prefix(keys::VALUE)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use vmcp_store::InMemoryKvStore;

    fn tup(items: Vec<Value>) -> Value {
        Value::tuple(items).unwrap()
    }

    #[test]
    fn scalar_roundtrip() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let v = Value::int(38);
        let hash = vs.add_ref(&v).unwrap();
        assert_eq!(hash, v.hash());
        assert_eq!(vs.restore(hash).unwrap(), v);
    }

    #[test]
    fn shared_tuple_roundtrip_preserves_sharing() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let v38 = Value::int(38);
        let tup1 = tup(vec![v38.clone(), v38.clone(), Value::EmptyTuple]);
        let tup2 = tup(vec![
            tup1.clone(),
            v38.clone(),
            v38.clone(),
            tup1.clone(),
            v38,
            tup1,
        ]);

        let hash = vs.add_ref(&tup2).unwrap();
        let restored = vs.restore(hash).unwrap();
        assert_eq!(restored, tup2);

        let kids = restored.children();
        assert!(Value::ptr_eq(&kids[0], &kids[3]));
        assert!(Value::ptr_eq(&kids[0], &kids[5]));
        // tup2, tup1, 38 and the empty tuple.
        assert_eq!(vs.node_count().unwrap(), 4);
    }

    #[test]
    fn repeated_add_ref_only_grows_counts() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let leaf = Value::int(7);
        let v = tup(vec![leaf.clone(), leaf.clone()]);

        let h1 = vs.add_ref(&v).unwrap();
        let keys_after_first = kv.len();
        assert_eq!(vs.ref_count(&h1).unwrap(), 1);
        // One count per parent edge.
        assert_eq!(vs.ref_count(&leaf.hash()).unwrap(), 2);

        let h2 = vs.add_ref(&tup(vec![leaf.clone(), leaf.clone()])).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(kv.len(), keys_after_first);
        assert_eq!(vs.ref_count(&h1).unwrap(), 2);
        // Children are not revisited once the parent exists.
        assert_eq!(vs.ref_count(&leaf.hash()).unwrap(), 2);
    }

    #[test]
    fn adding_a_stored_descendant_bumps_it() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let inner = tup(vec![Value::int(1)]);
        vs.add_ref(&tup(vec![inner.clone()])).unwrap();
        vs.add_ref(&inner).unwrap();
        assert_eq!(vs.ref_count(&inner.hash()).unwrap(), 2);
    }

    #[test]
    fn restore_missing_is_not_found() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let err = vs.restore(Value::int(1).hash()).unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(vs.ref_count(&Value::int(1).hash()).unwrap(), 0);
        assert!(!vs.contains(&Value::int(1).hash()).unwrap());
    }

    #[test]
    fn tampered_node_is_detected() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let hash = vs.add_ref(&Value::int(38)).unwrap();

        let forged = bincode::serialize(&StoredNode::Int(39)).unwrap();
        kv.put(&keys::value(&hash), &forged).unwrap();

        let err = vs.restore(hash).unwrap_err();
        assert!(matches!(err, CheckpointError::HashMismatch { expected, .. } if expected == hash));
    }

    #[test]
    fn garbage_node_is_corruption() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let hash = vs.add_ref(&Value::int(1)).unwrap();
        kv.put(&keys::value(&hash), &[0xff; 3]).unwrap();
        assert!(vs.restore(hash).unwrap_err().is_corruption());
    }

    #[test]
    fn malformed_ref_count_is_corruption() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let hash = vs.add_ref(&Value::int(1)).unwrap();
        kv.put(&keys::refcount(&hash), &[1, 2, 3]).unwrap();
        assert!(vs.ref_count(&hash).unwrap_err().is_corruption());
        assert!(vs.add_ref(&Value::int(1)).unwrap_err().is_corruption());
    }

    #[test]
    fn deep_shared_dag_stays_linear() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let mut v = Value::int(1);
        for _ in 0..40 {
            v = tup(vec![v.clone(), v]);
        }
        let hash = vs.add_ref(&v).unwrap();
        assert_eq!(vs.node_count().unwrap(), 41);
        assert_eq!(vs.restore(hash).unwrap(), v);
    }

    #[test]
    fn deep_chain_restores_without_recursion() {
        let kv = InMemoryKvStore::new();
        let vs = ValueStore::new(&kv);
        let depth = 5_000;
        let mut v = Value::EmptyTuple;
        for i in 0..depth {
            v = tup(vec![Value::int(i), v]);
        }
        let hash = vs.add_ref(&v).unwrap();
        let restored = vs.restore(hash).unwrap();
        assert_eq!(restored.hash(), hash);

        let mut cursor = restored.clone();
        let mut seen = 0;
        while let [head, tail] = cursor.children() {
            assert_eq!(head.as_int(), Some(depth - 1 - seen));
            let tail = tail.clone();
            cursor = tail;
            seen += 1;
        }
        assert_eq!(seen, depth);
        drop_chain(v);
        drop_chain(restored);
    }

    /// Release a long `(head, tail)` chain link by link; `Drop` on the
    /// whole chain would recurse once per link.
    fn drop_chain(mut v: Value) {
        while let [_, tail] = v.children() {
            let tail = tail.clone();
            v = tail;
        }
    }

    #[test]
    fn txn_reads_its_own_writes_and_erasures() {
        let kv = InMemoryKvStore::new();
        kv.put(b"ns/a", b"old").unwrap();
        let mut txn = Txn::new(&kv);
        txn.delete_prefix(b"ns/".to_vec());
        assert_eq!(txn.get(b"ns/a").unwrap(), None);
        txn.put(b"ns/b".to_vec(), b"new".to_vec());
        assert_eq!(txn.get(b"ns/b").unwrap(), Some(b"new".to_vec()));
        // Nothing is visible before commit.
        assert!(kv.contains(b"ns/a").unwrap());
        txn.commit().unwrap();
        assert!(!kv.contains(b"ns/a").unwrap());
        assert!(kv.contains(b"ns/b").unwrap());
    }

    fn arb_value() -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            any::<i64>().prop_map(Value::int),
            Just(Value::EmptyTuple),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop::collection::vec(inner, 0..=8).prop_map(tup)
        })
    }

    proptest! {
        #[test]
        fn any_value_roundtrips(v in arb_value()) {
            let kv = InMemoryKvStore::new();
            let vs = ValueStore::new(&kv);
            let hash = vs.add_ref(&v).unwrap();
            prop_assert_eq!(hash, v.hash());
            prop_assert_eq!(vs.restore(hash).unwrap(), v);
        }
    }
}
