use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::batch::WriteBatch;
use crate::error::{StoreError, StoreResult};
use crate::traits::KvStore;

/// Name of the log file inside the store directory.
pub const LOG_FILE: &str = "store.log";

/// Header size: 4 bytes length + 4 bytes payload CRC + 4 bytes header CRC.
const HEADER_SIZE: usize = 12;

/// Directories currently held by an open [`LogKvStore`] in this process.
static OPEN_DIRS: LazyLock<Mutex<HashSet<PathBuf>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// How opening treats existing contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Start from an empty store, destroying prior contents.
    Fresh,
    /// Reopen and replay whatever was previously committed.
    Existing,
    /// Replay an existing store without ever writing to it. Fails with
    /// [`StoreError::NotFound`] when there is no store, and leaves a torn
    /// tail in place.
    ReadOnly,
}

impl OpenMode {
    pub fn from_fresh(fresh: bool) -> Self {
        if fresh {
            Self::Fresh
        } else {
            Self::Existing
        }
    }
}

/// Flush/sync strategy for the log.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncMode {
    /// `fsync` after every batch; a returned `write` is durable.
    #[default]
    EveryWrite,
    /// Rely on OS page-cache buffering (fastest, least durable).
    OsDefault,
}

/// Configuration for a [`LogKvStore`].
#[derive(Clone, Debug, Default)]
pub struct LogConfig {
    pub sync_mode: SyncMode,
}

/// Exclusive claim on a store directory, released on drop.
struct DirLease {
    dir: PathBuf,
}

impl DirLease {
    fn acquire(dir: PathBuf) -> StoreResult<Self> {
        let mut open = OPEN_DIRS.lock().expect("lock poisoned");
        if !open.insert(dir.clone()) {
            return Err(StoreError::AlreadyOpen(dir));
        }
        Ok(Self { dir })
    }
}

impl Drop for DirLease {
    fn drop(&mut self) {
        if let Ok(mut open) = OPEN_DIRS.lock() {
            open.remove(&self.dir);
        }
    }
}

struct LogWriter {
    file: File,
    /// End of the last complete frame.
    offset: u64,
}

/// Durable key-value store backed by an append-only, CRC-framed log.
///
/// Each [`WriteBatch`] becomes one frame:
///
/// ```text
/// [4 bytes: payload length (little-endian u32)]
/// [4 bytes: CRC32 of payload (little-endian u32)]
/// [4 bytes: CRC32 of the preceding 8 header bytes (little-endian u32)]
/// [N bytes: payload (bincode-serialized WriteBatch)]
/// ```
///
/// On open the log is replayed front-to-back into an ordered in-memory index.
/// Only the final frame can be torn by a crash: a short header, a payload
/// that stops before its checked length, a CRC-failing payload that ends
/// exactly at end of file, or a zero-filled tail. Such a tail is truncated
/// away so the store reflects the last complete batch. Anything else that
/// fails a check is reported as [`StoreError::Corrupt`] and nothing is
/// truncated.
pub struct LogKvStore {
    dir: PathBuf,
    mode: OpenMode,
    index: RwLock<BTreeMap<Vec<u8>, Vec<u8>>>,
    writer: Mutex<LogWriter>,
    config: LogConfig,
    _lease: DirLease,
}

impl LogKvStore {
    /// Open the store in `dir`, creating it unless `mode` is
    /// [`OpenMode::ReadOnly`].
    pub fn open(dir: &Path, mode: OpenMode, config: LogConfig) -> StoreResult<Self> {
        let missing = |e: std::io::Error, path: &Path| match e.kind() {
            std::io::ErrorKind::NotFound => StoreError::NotFound(path.to_path_buf()),
            _ => StoreError::Io(e),
        };
        if mode != OpenMode::ReadOnly {
            fs::create_dir_all(dir)?;
        }
        let dir = fs::canonicalize(dir).map_err(|e| missing(e, dir))?;
        let lease = DirLease::acquire(dir.clone())?;
        let path = dir.join(LOG_FILE);

        if mode == OpenMode::Fresh {
            File::create(&path)?.sync_all()?;
        }

        let file = match mode {
            OpenMode::ReadOnly => OpenOptions::new()
                .read(true)
                .open(&path)
                .map_err(|e| missing(e, &path))?,
            OpenMode::Fresh | OpenMode::Existing => OpenOptions::new()
                .create(true)
                .read(true)
                .append(true)
                .open(&path)?,
        };

        let (index, valid_len) = replay(&path)?;
        let file_len = file.metadata()?.len();
        if valid_len < file_len {
            if mode == OpenMode::ReadOnly {
                warn!(valid_len, file_len, "ignoring torn tail of read-only store log");
            } else {
                warn!(valid_len, file_len, "discarding torn tail of store log");
                file.set_len(valid_len)?;
                file.sync_all()?;
            }
        }

        info!(path = %path.display(), keys = index.len(), ?mode, "log store opened");

        Ok(Self {
            dir,
            mode,
            index: RwLock::new(index),
            writer: Mutex::new(LogWriter {
                file,
                offset: valid_len,
            }),
            config,
            _lease: lease,
        })
    }

    /// Flush, sync and release the directory.
    ///
    /// Unlike dropping the store, failures here are reported.
    pub fn close(self) -> StoreResult<()> {
        self.flush()?;
        info!(dir = %self.dir.display(), "log store closed");
        Ok(())
    }

    /// Directory holding the log.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.index.read().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current size of the log in bytes.
    pub fn log_size(&self) -> u64 {
        self.writer.lock().expect("log mutex poisoned").offset
    }
}

impl KvStore for LogKvStore {
    fn get(&self, key: &[u8]) -> StoreResult<Option<Vec<u8>>> {
        let index = self.index.read().expect("lock poisoned");
        Ok(index.get(key).cloned())
    }

    fn scan_prefix(&self, prefix: &[u8]) -> StoreResult<Vec<(Vec<u8>, Vec<u8>)>> {
        let index = self.index.read().expect("lock poisoned");
        Ok(index
            .range(prefix.to_vec()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn write(&self, batch: WriteBatch) -> StoreResult<()> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StoreError::ReadOnly(self.dir.clone()));
        }
        if batch.is_empty() {
            return Ok(());
        }
        let payload =
            bincode::serialize(&batch).map_err(|e| StoreError::Serialization(e.to_string()))?;
        let length = u32::try_from(payload.len())
            .map_err(|_| StoreError::Serialization("batch exceeds 4 GiB".into()))?;
        let crc = crc32fast::hash(&payload);

        let mut frame = Vec::with_capacity(HEADER_SIZE + payload.len());
        frame.extend_from_slice(&length.to_le_bytes());
        frame.extend_from_slice(&crc.to_le_bytes());
        let header_crc = crc32fast::hash(&frame);
        frame.extend_from_slice(&header_crc.to_le_bytes());
        frame.extend_from_slice(&payload);

        let mut w = self.writer.lock().expect("log mutex poisoned");
        let frame_offset = w.offset;
        if let Err(e) = append_frame(&mut w.file, &frame, self.config.sync_mode) {
            // Drop any partial frame so later appends stay replayable.
            if let Err(rollback) = w.file.set_len(frame_offset) {
                warn!(offset = frame_offset, error = %rollback, "failed to roll back partial frame");
            }
            return Err(e);
        }
        w.offset += frame.len() as u64;

        // The index is updated while the writer lock is held so readers never
        // see a batch that is not yet in the log.
        batch.apply_to(&mut self.index.write().expect("lock poisoned"));

        debug!(offset = frame_offset, len = payload.len(), ops = batch.len(), "log append");
        Ok(())
    }

    fn flush(&self) -> StoreResult<()> {
        if self.mode == OpenMode::ReadOnly {
            return Ok(());
        }
        let mut w = self.writer.lock().expect("log mutex poisoned");
        w.file.flush()?;
        w.file.sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for LogKvStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogKvStore")
            .field("dir", &self.dir)
            .field("key_count", &self.len())
            .finish()
    }
}

fn append_frame(file: &mut File, frame: &[u8], sync_mode: SyncMode) -> StoreResult<()> {
    file.write_all(frame)?;
    file.flush()?;
    if sync_mode == SyncMode::EveryWrite {
        file.sync_data()?;
    }
    Ok(())
}

/// Replay the log, returning the rebuilt index and the length of the valid
/// prefix of the file.
fn replay(path: &Path) -> StoreResult<(BTreeMap<Vec<u8>, Vec<u8>>, u64)> {
    let data = fs::read(path)?;
    let mut index = BTreeMap::new();
    let mut offset = 0usize;
    let mut frames = 0usize;

    while offset < data.len() {
        let remaining = data.len() - offset;
        if remaining < HEADER_SIZE {
            warn!(offset, remaining, "truncated frame header; stopping replay");
            break;
        }
        let header = &data[offset..offset + HEADER_SIZE];
        let length = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let expected_crc = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        let header_crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);

        if crc32fast::hash(&header[..8]) != header_crc {
            if data[offset..].iter().all(|&b| b == 0) {
                warn!(offset, "zero-filled tail; stopping replay");
                break;
            }
            return Err(StoreError::Corrupt {
                offset: offset as u64,
                reason: "frame header checksum mismatch".into(),
            });
        }
        if length == 0 {
            return Err(StoreError::Corrupt {
                offset: offset as u64,
                reason: "empty frame".into(),
            });
        }

        let end = offset + HEADER_SIZE + length;
        if end > data.len() {
            warn!(offset, length, file_len = data.len(), "truncated frame; stopping replay");
            break;
        }

        let payload = &data[offset + HEADER_SIZE..end];
        let actual_crc = crc32fast::hash(payload);
        if actual_crc != expected_crc {
            if end == data.len() {
                warn!(offset, "CRC mismatch on final frame; treating as torn write");
                break;
            }
            return Err(StoreError::Corrupt {
                offset: offset as u64,
                reason: format!(
                    "CRC mismatch: expected {expected_crc:#010x}, computed {actual_crc:#010x}"
                ),
            });
        }

        let batch: WriteBatch = bincode::deserialize(payload).map_err(|e| StoreError::Corrupt {
            offset: offset as u64,
            reason: format!("undecodable batch: {e}"),
        })?;
        batch.apply_to(&mut index);
        frames += 1;
        offset = end;
    }

    debug!(frames, keys = index.len(), "log replay complete");
    Ok((index, offset as u64))
}
