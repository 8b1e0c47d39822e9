use crate::batch::WriteBatch;
use crate::error::StoreResult;

/// Ordered, durable key-value store.
///
/// All implementations must satisfy these invariants:
/// - A batch passed to `write` is applied atomically and in order.
/// - A `get` or `scan_prefix` after `write` returns observes the batch.
/// - Keys are compared bytewise; `scan_prefix` returns entries in key order.
/// - All I/O errors are propagated, never silently ignored.
pub trait KvStore: Send + Sync {
    /// Read a value by key. Returns `Ok(None)` if the key does not exist.
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>>;

    /// All entries whose key starts with `prefix`, in key order.
    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>>;

    /// Apply a batch of writes atomically.
    fn write(&self, batch: WriteBatch) -> StoreResult<()>;

    /// Force buffered writes to stable storage.
    fn flush(&self) -> StoreResult<()>;

    /// Check whether a key exists.
    fn contains(&self, key: &[u8]) -> StoreResult<bool> {
        Ok(self.get(key)?.is_some())
    }

    /// Write a single key.
    fn put(&self, key: &[u8], value: &[u8]) -> StoreResult<()> {
        let mut batch = WriteBatch::new();
        batch.put(key, value);
        self.write(batch)
    }
}
