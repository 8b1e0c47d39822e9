//! Key layout inside the storage substrate.
//!
//! Integers are big-endian so that key order matches numeric order. Chain
//! keys are length-prefixed so no chain namespace is a prefix of another.

use vmcp_types::Hash;

use crate::error::{CheckpointError, CheckpointResult};

pub(crate) const VALUE: &[u8] = b"val/";
pub(crate) const REFCOUNT: &[u8] = b"rc/";
pub(crate) const MACHINE: &[u8] = b"mach/";
pub(crate) const VERSION_META: &[u8] = b"ver/meta";
pub(crate) const VERSION_RECORD: &[u8] = b"ver/rec/";
pub(crate) const CHAIN: &[u8] = b"chain/";

const CHAIN_META: &[u8] = b"meta";
const CHAIN_RECORD: &[u8] = b"rec/";

fn concat(parts: &[&[u8]]) -> Vec<u8> {
    parts.concat()
}

pub(crate) fn value(hash: &Hash) -> Vec<u8> {
    concat(&[VALUE, hash.as_bytes()])
}

pub(crate) fn refcount(hash: &Hash) -> Vec<u8> {
    concat(&[REFCOUNT, hash.as_bytes()])
}

pub(crate) fn machine(key: &[u8]) -> Vec<u8> {
    concat(&[MACHINE, key])
}

pub(crate) fn version_record(version: u64) -> Vec<u8> {
    concat(&[VERSION_RECORD, &version.to_be_bytes()])
}

/// Namespace holding every key of one event chain.
pub(crate) fn chain_prefix(key: &[u8]) -> CheckpointResult<Vec<u8>> {
    let len = chain_key_len(key.len())?;
    Ok(concat(&[CHAIN, &len.to_be_bytes(), key, b"/"]))
}

fn chain_key_len(len: usize) -> CheckpointResult<u32> {
    u32::try_from(len)
        .map_err(|_| CheckpointError::InvalidKey(format!("chain key of {len} bytes is too long")))
}

pub(crate) fn chain_meta(prefix: &[u8]) -> Vec<u8> {
    concat(&[prefix, CHAIN_META])
}

pub(crate) fn chain_record(prefix: &[u8], seq: u64) -> Vec<u8> {
    concat(&[prefix, CHAIN_RECORD, &seq.to_be_bytes()])
}

/// Recover the caller's chain key from a chain metadata key.
pub(crate) fn parse_chain_meta(full: &[u8]) -> Option<Vec<u8>> {
    let rest = full.strip_prefix(CHAIN)?;
    let len_bytes: [u8; 4] = rest.get(..4)?.try_into().ok()?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    let key = rest.get(4..4 + len)?;
    let tail = rest.get(4 + len..)?;
    (tail.strip_prefix(b"/")? == CHAIN_META).then(|| key.to_vec())
}
