use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use vmcp_types::{Hash, Value};

use crate::checkpointer::{display_key, Checkpointer};
use crate::error::{CheckpointError, CheckpointResult};
use crate::keys;
use crate::machine::{decode, encode, load_machine, stage_machine, Machine, MachineRecord};
use crate::value_store::{restore_with, stage_add_ref};

/// Chain-wide metadata, rewritten with every record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ChainMeta {
    time_bounds: [u64; 2],
    balance_tracker: Vec<u8>,
    initial_machine: MachineRecord,
    next_seq: u64,
    last_signed: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
struct ChainRecord {
    machine: MachineRecord,
    inbox: Hash,
    signatures: Option<Vec<u8>>,
}

/// Progress of one sequence number through the two-phase protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordState {
    Empty,
    IntentRecorded,
    SignaturesRecorded,
}

/// Per-key log of `(machine, inbox, signatures)` records.
///
/// Each sequence number is written twice: first the intent (machine and
/// inbox), then the signatures over it. Intents must arrive in order with
/// no gaps; signatures may only follow their own intent, once. A record is
/// restorable only after both phases.
///
/// The handle caches nothing but the key: every call reads chain metadata
/// from storage, so once any handle discards the chain all others fail
/// with `NotFound`.
pub struct EventChainCheckpointer<'a> {
    cp: &'a Checkpointer,
    key: Vec<u8>,
    prefix: Vec<u8>,
}

impl<'a> EventChainCheckpointer<'a> {
    /// Start a new chain under `key` at sequence 0, replacing any chain that
    /// was stored there.
    pub fn create<M: Machine>(
        cp: &'a Checkpointer,
        key: &[u8],
        machine: &M,
        time_bounds: [u64; 2],
        balance_tracker: &[u8],
    ) -> CheckpointResult<Self> {
        let prefix = keys::chain_prefix(key)?;
        cp.transact(|txn| {
            txn.delete_prefix(prefix.clone());
            let meta = ChainMeta {
                time_bounds,
                balance_tracker: balance_tracker.to_vec(),
                initial_machine: stage_machine(txn, machine)?,
                next_seq: 0,
                last_signed: None,
            };
            txn.put(keys::chain_meta(&prefix), encode(&meta)?);
            Ok(())
        })?;
        info!(key = %display_key(key), "event chain created");
        Ok(Self {
            cp,
            key: key.to_vec(),
            prefix,
        })
    }

    /// Reattach to the chain stored under `key`.
    pub fn restore(cp: &'a Checkpointer, key: &[u8]) -> CheckpointResult<Self> {
        let chain = Self {
            cp,
            key: key.to_vec(),
            prefix: keys::chain_prefix(key)?,
        };
        let meta = chain.meta()?;
        info!(key = %display_key(key), next_seq = meta.next_seq, "event chain restored");
        Ok(chain)
    }

    /// Keys of every chain in `cp`, in key order.
    pub fn chain_keys(cp: &Checkpointer) -> CheckpointResult<Vec<Vec<u8>>> {
        cp.read(|store| {
            Ok(store
                .scan_prefix(keys::CHAIN)?
                .into_iter()
                .filter_map(|(k, _)| keys::parse_chain_meta(&k))
                .collect())
        })
    }

    /// Phase one for `seq`: persist the machine and inbox it will sign over.
    pub fn record_intent_to_sign<M: Machine>(
        &mut self,
        seq: u64,
        machine: &M,
        inbox: &Value,
    ) -> CheckpointResult<()> {
        let (key, prefix) = (&self.key, &self.prefix);
        self.cp.transact(|txn| {
            let mut meta = decode_meta(txn.get(&keys::chain_meta(prefix))?, key)?;
            if seq != meta.next_seq {
                return Err(CheckpointError::ordering(
                    seq,
                    format!("expected intent for sequence {}", meta.next_seq),
                ));
            }
            let record = ChainRecord {
                machine: stage_machine(txn, machine)?,
                inbox: stage_add_ref(txn, inbox)?,
                signatures: None,
            };
            txn.put(keys::chain_record(prefix, seq), encode(&record)?);
            meta.next_seq += 1;
            txn.put(keys::chain_meta(prefix), encode(&meta)?);
            Ok(())
        })?;
        debug!(key = %display_key(key), seq, "intent to sign recorded");
        Ok(())
    }

    /// Phase two for `seq`: attach the signatures.
    pub fn record_signatures(&mut self, seq: u64, signatures: &[u8]) -> CheckpointResult<()> {
        let (key, prefix) = (&self.key, &self.prefix);
        self.cp.transact(|txn| {
            let mut meta = decode_meta(txn.get(&keys::chain_meta(prefix))?, key)?;
            let mut record = decode_record(txn.get(&keys::chain_record(prefix, seq))?)?
                .ok_or_else(|| CheckpointError::ordering(seq, "no intent recorded"))?;
            if record.signatures.is_some() {
                return Err(CheckpointError::ordering(seq, "signatures already recorded"));
            }
            record.signatures = Some(signatures.to_vec());
            txn.put(keys::chain_record(prefix, seq), encode(&record)?);
            meta.last_signed = Some(meta.last_signed.map_or(seq, |last| last.max(seq)));
            txn.put(keys::chain_meta(prefix), encode(&meta)?);
            Ok(())
        })?;
        debug!(key = %display_key(key), seq, "signatures recorded");
        Ok(())
    }

    /// Rebuild the machine, inbox and signatures of a fully recorded `seq`.
    pub fn restore_from_seq_num<M: Machine>(
        &self,
        seq: u64,
    ) -> CheckpointResult<(M, Value, Vec<u8>)> {
        self.cp.read(|store| {
            decode_meta(store.get(&keys::chain_meta(&self.prefix))?, &self.key)?;
            let missing = || {
                CheckpointError::not_found(format!(
                    "signed record {seq} in chain {}",
                    display_key(&self.key)
                ))
            };
            let record = decode_record(store.get(&keys::chain_record(&self.prefix, seq))?)?
                .ok_or_else(missing)?;
            let signatures = record.signatures.ok_or_else(missing)?;
            let machine = load_machine(store, &record.machine)?;
            let inbox = restore_with(store, record.inbox, &mut HashMap::new())?;
            Ok((machine, inbox, signatures))
        })
    }

    pub fn record_state(&self, seq: u64) -> CheckpointResult<RecordState> {
        let record = self.cp.read(|store| {
            decode_meta(store.get(&keys::chain_meta(&self.prefix))?, &self.key)?;
            decode_record(store.get(&keys::chain_record(&self.prefix, seq))?)
        })?;
        Ok(match record {
            None => RecordState::Empty,
            Some(ChainRecord {
                signatures: None, ..
            }) => RecordState::IntentRecorded,
            Some(_) => RecordState::SignaturesRecorded,
        })
    }

    /// Machine the chain was created with.
    pub fn restore_initial_machine<M: Machine>(&self) -> CheckpointResult<M> {
        self.cp.read(|store| {
            let meta = decode_meta(store.get(&keys::chain_meta(&self.prefix))?, &self.key)?;
            load_machine(store, &meta.initial_machine)
        })
    }

    /// Erase the chain and every record in it.
    pub fn discard(self) -> CheckpointResult<()> {
        self.cp.transact(|txn| {
            txn.delete_prefix(self.prefix.clone());
            Ok(())
        })?;
        info!(key = %display_key(&self.key), "event chain discarded");
        Ok(())
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn time_bounds(&self) -> CheckpointResult<[u64; 2]> {
        Ok(self.meta()?.time_bounds)
    }

    pub fn balance_tracker(&self) -> CheckpointResult<Vec<u8>> {
        Ok(self.meta()?.balance_tracker)
    }

    /// Sequence number the next intent must carry.
    pub fn next_seq_num(&self) -> CheckpointResult<u64> {
        Ok(self.meta()?.next_seq)
    }

    /// Highest sequence number with signatures recorded.
    pub fn last_signed_seq(&self) -> CheckpointResult<Option<u64>> {
        Ok(self.meta()?.last_signed)
    }

    fn meta(&self) -> CheckpointResult<ChainMeta> {
        self.cp
            .read(|store| decode_meta(store.get(&keys::chain_meta(&self.prefix))?, &self.key))
    }
}

impl std::fmt::Debug for EventChainCheckpointer<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChainCheckpointer")
            .field("key", &display_key(&self.key))
            .finish_non_exhaustive()
    }
}

fn decode_meta(bytes: Option<Vec<u8>>, key: &[u8]) -> CheckpointResult<ChainMeta> {
    let bytes =
        bytes.ok_or_else(|| CheckpointError::not_found(format!("chain {}", display_key(key))))?;
    decode(&bytes, "chain metadata")
}

fn decode_record(bytes: Option<Vec<u8>>) -> CheckpointResult<Option<ChainRecord>> {
    bytes
        .map(|bytes| decode(&bytes, "chain record"))
        .transpose()
}
