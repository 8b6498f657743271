//! UTXO ledger backed by the storage trait.
//!
//! The ledger changes only through [`UtxoDelta`]s. A delta lists the outputs a block
//! consumes from the ledger and the outputs it leaves behind; an output created and spent
//! inside the same block appears in neither list. Deltas are staged on a [`UtxoView`]
//! overlay and reach the store as one [`WriteBatch`].

use std::collections::{HashMap, HashSet};
use std::fmt;

use beand_consensus::money::Amount;
use beand_primitives::block::Block;
use beand_primitives::encoding::{DecodeError, Decoder, Encoder};
use beand_primitives::outpoint::OutPoint;
use beand_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::undo::SpentOutput;

pub const OUTPOINT_KEY_LEN: usize = 36;

const FLAG_COINBASE: u8 = 1 << 0;
const FLAG_COINSTAKE: u8 = 1 << 1;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UtxoEntry {
    pub value: Amount,
    pub script_pubkey: Vec<u8>,
    pub height: i32,
    pub is_coinbase: bool,
    pub is_coinstake: bool,
    /// Timestamp of the creating transaction, used for coin age.
    pub tx_time: u32,
}

impl UtxoEntry {
    /// Whether the output may be spent by a transaction in a block at `spend_height`.
    pub fn is_mature(&self, spend_height: i32, maturity: i32) -> bool {
        if !self.is_coinbase && !self.is_coinstake {
            return true;
        }
        spend_height.saturating_sub(self.height) >= maturity
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(18 + self.script_pubkey.len());
        encoder.write_i64_le(self.value);
        encoder.write_var_bytes(&self.script_pubkey);
        encoder.write_i32_le(self.height);
        let mut flags = 0u8;
        if self.is_coinbase {
            flags |= FLAG_COINBASE;
        }
        if self.is_coinstake {
            flags |= FLAG_COINSTAKE;
        }
        encoder.write_u8(flags);
        encoder.write_u32_le(self.tx_time);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let value = decoder.read_i64_le()?;
        let script_pubkey = decoder.read_var_bytes()?;
        let height = decoder.read_i32_le()?;
        let flags = decoder.read_u8()?;
        let tx_time = decoder.read_u32_le()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            value,
            script_pubkey,
            height,
            is_coinbase: flags & FLAG_COINBASE != 0,
            is_coinstake: flags & FLAG_COINSTAKE != 0,
            tx_time,
        })
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OutPointKey([u8; OUTPOINT_KEY_LEN]);

impl OutPointKey {
    pub fn new(outpoint: &OutPoint) -> Self {
        let mut bytes = [0u8; OUTPOINT_KEY_LEN];
        bytes[..32].copy_from_slice(&outpoint.hash);
        bytes[32..].copy_from_slice(&outpoint.index.to_le_bytes());
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; OUTPOINT_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn to_outpoint(&self) -> OutPoint {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&self.0[..32]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&self.0[32..]);
        OutPoint::new(hash, u32::from_le_bytes(index))
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ConflictError {
    /// A spend names an output that is not currently unspent.
    MissingSpend(OutPoint),
    /// The same output is spent twice.
    DuplicateSpend(OutPoint),
    /// A create collides with an output that already exists.
    DuplicateCreate(OutPoint),
    /// Revert found a created output missing or altered.
    MissingCreate(OutPoint),
}

impl fmt::Display for ConflictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (message, outpoint) = match self {
            ConflictError::MissingSpend(outpoint) => ("spend of missing output", outpoint),
            ConflictError::DuplicateSpend(outpoint) => ("output spent twice", outpoint),
            ConflictError::DuplicateCreate(outpoint) => ("output already exists", outpoint),
            ConflictError::MissingCreate(outpoint) => ("created output missing", outpoint),
        };
        write!(
            f,
            "{message}: {}:{}",
            beand_consensus::hash256_to_hex(&outpoint.hash),
            outpoint.index
        )
    }
}

impl std::error::Error for ConflictError {}

#[derive(Debug)]
pub enum LedgerError {
    Conflict(ConflictError),
    Store(StoreError),
}

impl fmt::Display for LedgerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LedgerError::Conflict(err) => write!(f, "{err}"),
            LedgerError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for LedgerError {}

impl From<ConflictError> for LedgerError {
    fn from(err: ConflictError) -> Self {
        LedgerError::Conflict(err)
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        LedgerError::Store(err)
    }
}

/// Net ledger change of one block.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UtxoDelta {
    pub spent: Vec<SpentOutput>,
    pub created: Vec<(OutPoint, UtxoEntry)>,
}

impl UtxoDelta {
    /// Rebuilds the delta of a connected block from the block and its undo record.
    pub fn from_undo(block: &Block, height: i32, spent: Vec<SpentOutput>) -> Self {
        Self {
            spent,
            created: block_created_outputs(block, height),
        }
    }
}

/// Outputs `block` leaves in the ledger: every non-empty output not spent later in the
/// same block, in block order.
pub fn block_created_outputs(block: &Block, height: i32) -> Vec<(OutPoint, UtxoEntry)> {
    let spent_in_block: HashSet<OutPointKey> = block
        .transactions
        .iter()
        .filter(|tx| !tx.is_coinbase())
        .flat_map(|tx| tx.vin.iter().map(|input| OutPointKey::new(&input.prevout)))
        .collect();

    let mut created = Vec::new();
    for tx in &block.transactions {
        let txid = tx.txid();
        let is_coinbase = tx.is_coinbase();
        let is_coinstake = tx.is_coinstake();
        for (index, output) in tx.vout.iter().enumerate() {
            if output.is_empty() {
                continue;
            }
            let outpoint = OutPoint::new(txid, index as u32);
            if spent_in_block.contains(&OutPointKey::new(&outpoint)) {
                continue;
            }
            created.push((
                outpoint,
                UtxoEntry {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height,
                    is_coinbase,
                    is_coinstake,
                    tx_time: tx.time,
                },
            ));
        }
    }
    created
}

/// Read access to a ledger state.
pub trait UtxoLookup {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError>;
}

pub struct UtxoSet<S> {
    store: S,
}

impl<S> UtxoSet<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }
}

impl<S: KeyValueStore> UtxoSet<S> {
    pub fn get(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        self.get_key(&OutPointKey::new(outpoint))
    }

    fn get_key(&self, key: &OutPointKey) -> Result<Option<UtxoEntry>, StoreError> {
        match self.store.get(Column::Utxo, key.as_bytes())? {
            Some(bytes) => Ok(Some(
                UtxoEntry::decode(&bytes).map_err(|err| StoreError::Backend(err.to_string()))?,
            )),
            None => Ok(None),
        }
    }

    pub fn put(&self, batch: &mut WriteBatch, outpoint: &OutPoint, entry: &UtxoEntry) {
        batch.put(Column::Utxo, OutPointKey::new(outpoint).as_bytes(), entry.encode());
    }

    pub fn delete(&self, batch: &mut WriteBatch, outpoint: &OutPoint) {
        batch.delete(Column::Utxo, OutPointKey::new(outpoint).as_bytes());
    }

    /// Visits every unspent output in key order.
    pub fn for_each(
        &self,
        mut visit: impl FnMut(OutPoint, UtxoEntry) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.store
            .for_each_prefix(Column::Utxo, &[], &mut |key, value| {
                let key = OutPointKey::from_slice(key)
                    .ok_or_else(|| StoreError::Backend("invalid utxo key".to_string()))?;
                let entry = UtxoEntry::decode(value)
                    .map_err(|err| StoreError::Backend(err.to_string()))?;
                visit(key.to_outpoint(), entry)
            })
    }
}

impl<S: KeyValueStore> UtxoLookup for UtxoSet<S> {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        self.get(outpoint)
    }
}

#[derive(Clone, Debug)]
struct Slot {
    original: Option<UtxoEntry>,
    current: Option<UtxoEntry>,
}

/// Uncommitted changes layered over a [`UtxoSet`]. Dropping the view discards them.
pub struct UtxoView<'a, S> {
    base: &'a UtxoSet<S>,
    slots: HashMap<OutPointKey, Slot>,
}

impl<'a, S: KeyValueStore> UtxoView<'a, S> {
    pub fn new(base: &'a UtxoSet<S>) -> Self {
        Self {
            base,
            slots: HashMap::new(),
        }
    }

    /// Number of outputs whose state differs from the base.
    pub fn pending_changes(&self) -> usize {
        self.slots
            .values()
            .filter(|slot| slot.original != slot.current)
            .count()
    }

    fn lookup_key(&self, key: &OutPointKey) -> Result<Option<UtxoEntry>, StoreError> {
        match self.slots.get(key) {
            Some(slot) => Ok(slot.current.clone()),
            None => self.base.get_key(key),
        }
    }

    fn set(&mut self, key: OutPointKey, value: Option<UtxoEntry>) -> Result<(), StoreError> {
        if let Some(slot) = self.slots.get_mut(&key) {
            slot.current = value;
            return Ok(());
        }
        let original = self.base.get_key(&key)?;
        self.slots.insert(
            key,
            Slot {
                original,
                current: value,
            },
        );
        Ok(())
    }

    /// Applies `delta`, or changes nothing when any spend or create conflicts.
    pub fn apply(&mut self, delta: &UtxoDelta) -> Result<(), LedgerError> {
        let mut spent = HashSet::with_capacity(delta.spent.len());
        for item in &delta.spent {
            let key = OutPointKey::new(&item.outpoint);
            if !spent.insert(key) {
                return Err(ConflictError::DuplicateSpend(item.outpoint.clone()).into());
            }
            if self.lookup_key(&key)?.is_none() {
                return Err(ConflictError::MissingSpend(item.outpoint.clone()).into());
            }
        }
        let mut created = HashSet::with_capacity(delta.created.len());
        for (outpoint, _) in &delta.created {
            let key = OutPointKey::new(outpoint);
            if !created.insert(key) || self.lookup_key(&key)?.is_some() {
                return Err(ConflictError::DuplicateCreate(outpoint.clone()).into());
            }
        }

        for item in &delta.spent {
            self.set(OutPointKey::new(&item.outpoint), None)?;
        }
        for (outpoint, entry) in &delta.created {
            self.set(OutPointKey::new(outpoint), Some(entry.clone()))?;
        }
        Ok(())
    }

    /// Exact inverse of [`UtxoView::apply`].
    pub fn revert(&mut self, delta: &UtxoDelta) -> Result<(), LedgerError> {
        let mut created = HashSet::with_capacity(delta.created.len());
        for (outpoint, entry) in &delta.created {
            let key = OutPointKey::new(outpoint);
            if !created.insert(key) || self.lookup_key(&key)?.as_ref() != Some(entry) {
                return Err(ConflictError::MissingCreate(outpoint.clone()).into());
            }
        }
        let mut spent = HashSet::with_capacity(delta.spent.len());
        for item in &delta.spent {
            let key = OutPointKey::new(&item.outpoint);
            if !spent.insert(key) {
                return Err(ConflictError::DuplicateSpend(item.outpoint.clone()).into());
            }
            if self.lookup_key(&key)?.is_some() {
                return Err(ConflictError::DuplicateCreate(item.outpoint.clone()).into());
            }
        }

        for (outpoint, _) in &delta.created {
            self.set(OutPointKey::new(outpoint), None)?;
        }
        for item in &delta.spent {
            self.set(OutPointKey::new(&item.outpoint), Some(item.entry.clone()))?;
        }
        Ok(())
    }

    /// Moves every pending change into `batch`.
    pub fn into_batch(self, batch: &mut WriteBatch) {
        for (key, slot) in self.slots {
            if slot.original == slot.current {
                continue;
            }
            match slot.current {
                Some(entry) => batch.put(Column::Utxo, key.as_bytes(), entry.encode()),
                None => batch.delete(Column::Utxo, key.as_bytes()),
            }
        }
    }
}

impl<S: KeyValueStore> UtxoLookup for UtxoView<'_, S> {
    fn lookup(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, StoreError> {
        self.lookup_key(&OutPointKey::new(outpoint))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_storage::memory::MemoryStore;

    fn entry(value: Amount, height: i32) -> UtxoEntry {
        UtxoEntry {
            value,
            script_pubkey: vec![0x51],
            height,
            is_coinbase: false,
            is_coinstake: false,
            tx_time: 1_000,
        }
    }

    fn seeded() -> UtxoSet<MemoryStore> {
        let set = UtxoSet::new(MemoryStore::new());
        let mut batch = WriteBatch::new();
        set.put(&mut batch, &OutPoint::new([1u8; 32], 0), &entry(50, 1));
        set.put(&mut batch, &OutPoint::new([1u8; 32], 1), &entry(70, 1));
        set.store.write_batch(&batch).expect("seed");
        set
    }

    fn spend(set: &UtxoSet<MemoryStore>, outpoint: OutPoint) -> SpentOutput {
        let entry = set.get(&outpoint).expect("get").expect("present");
        SpentOutput { outpoint, entry }
    }

    #[test]
    fn entry_encoding_keeps_flags() {
        let mut stake = entry(9, 4);
        stake.is_coinstake = true;
        stake.tx_time = 77;
        assert_eq!(UtxoEntry::decode(&stake.encode()).expect("decode"), stake);
        let mut bytes = stake.encode();
        bytes.push(0);
        assert_eq!(UtxoEntry::decode(&bytes), Err(DecodeError::TrailingBytes));
    }

    #[test]
    fn maturity_applies_to_generated_outputs_only() {
        let mut generated = entry(1, 10);
        assert!(generated.is_mature(10, 500));
        generated.is_coinbase = true;
        assert!(!generated.is_mature(509, 500));
        assert!(generated.is_mature(510, 500));
    }

    #[test]
    fn apply_then_revert_leaves_no_changes() {
        let set = seeded();
        let delta = UtxoDelta {
            spent: vec![spend(&set, OutPoint::new([1u8; 32], 0))],
            created: vec![(OutPoint::new([2u8; 32], 0), entry(45, 2))],
        };
        let mut view = UtxoView::new(&set);
        view.apply(&delta).expect("apply");
        assert_eq!(view.pending_changes(), 2);
        assert!(view.lookup(&OutPoint::new([1u8; 32], 0)).expect("lookup").is_none());
        view.revert(&delta).expect("revert");
        assert_eq!(view.pending_changes(), 0);

        let mut batch = WriteBatch::new();
        view.into_batch(&mut batch);
        assert!(batch.is_empty());
    }

    #[test]
    fn conflicting_apply_has_no_effect() {
        let set = seeded();
        let good = spend(&set, OutPoint::new([1u8; 32], 0));
        let missing = SpentOutput {
            outpoint: OutPoint::new([9u8; 32], 0),
            entry: entry(1, 1),
        };
        let mut view = UtxoView::new(&set);
        let err = view
            .apply(&UtxoDelta {
                spent: vec![good.clone(), missing],
                created: Vec::new(),
            })
            .expect_err("missing spend");
        assert!(matches!(
            err,
            LedgerError::Conflict(ConflictError::MissingSpend(_))
        ));
        assert_eq!(view.pending_changes(), 0);

        let err = view
            .apply(&UtxoDelta {
                spent: vec![good.clone(), good],
                created: Vec::new(),
            })
            .expect_err("double spend");
        assert!(matches!(
            err,
            LedgerError::Conflict(ConflictError::DuplicateSpend(_))
        ));

        let err = view
            .apply(&UtxoDelta {
                spent: Vec::new(),
                created: vec![(OutPoint::new([1u8; 32], 1), entry(3, 2))],
            })
            .expect_err("duplicate create");
        assert!(matches!(
            err,
            LedgerError::Conflict(ConflictError::DuplicateCreate(_))
        ));
        assert_eq!(view.pending_changes(), 0);
    }

    #[test]
    fn committed_batch_matches_view() {
        let set = seeded();
        let delta = UtxoDelta {
            spent: vec![spend(&set, OutPoint::new([1u8; 32], 1))],
            created: vec![(OutPoint::new([3u8; 32], 2), entry(60, 2))],
        };
        let mut view = UtxoView::new(&set);
        view.apply(&delta).expect("apply");
        let mut batch = WriteBatch::new();
        view.into_batch(&mut batch);
        set.store.write_batch(&batch).expect("commit");

        assert!(set.get(&OutPoint::new([1u8; 32], 1)).expect("get").is_none());
        assert_eq!(
            set.get(&OutPoint::new([3u8; 32], 2)).expect("get"),
            Some(entry(60, 2))
        );
        let mut seen = Vec::new();
        set.for_each(|outpoint, _| {
            seen.push(outpoint);
            Ok(())
        })
        .expect("scan");
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn outpoint_key_roundtrip() {
        let outpoint = OutPoint::new([4u8; 32], 513);
        let key = OutPointKey::new(&outpoint);
        assert_eq!(key.to_outpoint(), outpoint);
        assert_eq!(OutPointKey::from_slice(key.as_bytes()), Some(key));
        assert_eq!(OutPointKey::from_slice(&[0u8; 5]), None);
    }
}
