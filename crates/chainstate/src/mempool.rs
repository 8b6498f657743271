//! Pool of validated transactions waiting for a block.
//!
//! Entries spend confirmed outputs only; the pool keeps a spend index so a second
//! transaction spending the same outpoint is refused as a conflict.

use std::collections::HashMap;

use beand_consensus::money::Amount;
use beand_consensus::{hash256_to_hex, Hash256};
use beand_primitives::{Block, OutPoint, Transaction};

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum MempoolErrorKind {
    AlreadyInMempool,
    ConflictingInput,
    MempoolFull,
}

#[derive(Clone, Debug)]
pub struct MempoolError {
    pub kind: MempoolErrorKind,
    pub message: String,
}

impl MempoolError {
    pub fn new(kind: MempoolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for MempoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for MempoolError {}

pub struct MempoolEntry {
    pub txid: Hash256,
    pub tx: Transaction,
    pub size: usize,
    pub fee: Amount,
    /// Insertion order.
    pub sequence: u64,
}

impl MempoolEntry {
    pub fn spent_outpoints(&self) -> impl Iterator<Item = &OutPoint> {
        self.tx.vin.iter().map(|input| &input.prevout)
    }
}

#[derive(Default)]
pub struct Mempool {
    entries: HashMap<Hash256, MempoolEntry>,
    spent: HashMap<OutPoint, Hash256>,
    total_bytes: usize,
    max_bytes: usize,
    next_sequence: u64,
}

impl Mempool {
    pub fn new(max_bytes: usize) -> Self {
        Self {
            max_bytes,
            ..Self::default()
        }
    }

    pub fn contains(&self, txid: &Hash256) -> bool {
        self.entries.contains_key(txid)
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spent.contains_key(outpoint)
    }

    pub fn spender(&self, outpoint: &OutPoint) -> Option<Hash256> {
        self.spent.get(outpoint).copied()
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes
    }

    pub fn get(&self, txid: &Hash256) -> Option<&MempoolEntry> {
        self.entries.get(txid)
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> Vec<&MempoolEntry> {
        let mut entries: Vec<&MempoolEntry> = self.entries.values().collect();
        entries.sort_by_key(|entry| entry.sequence);
        entries
    }

    pub fn insert(&mut self, tx: Transaction, fee: Amount) -> Result<Hash256, MempoolError> {
        let txid = tx.txid();
        if self.entries.contains_key(&txid) {
            return Err(MempoolError::new(
                MempoolErrorKind::AlreadyInMempool,
                "transaction already in mempool",
            ));
        }
        for input in &tx.vin {
            if let Some(conflict) = self.spent.get(&input.prevout) {
                return Err(MempoolError::new(
                    MempoolErrorKind::ConflictingInput,
                    format!(
                        "input {}:{} already spent by {}",
                        hash256_to_hex(&input.prevout.hash),
                        input.prevout.index,
                        hash256_to_hex(conflict)
                    ),
                ));
            }
        }
        let size = tx.serialized_size();
        if self.max_bytes > 0 && self.total_bytes.saturating_add(size) > self.max_bytes {
            return Err(MempoolError::new(MempoolErrorKind::MempoolFull, "mempool full"));
        }
        for input in &tx.vin {
            self.spent.insert(input.prevout.clone(), txid);
        }
        self.total_bytes = self.total_bytes.saturating_add(size);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.entries.insert(
            txid,
            MempoolEntry {
                txid,
                tx,
                size,
                fee,
                sequence,
            },
        );
        Ok(txid)
    }

    pub fn remove(&mut self, txid: &Hash256) -> Option<MempoolEntry> {
        let entry = self.entries.remove(txid)?;
        self.total_bytes = self.total_bytes.saturating_sub(entry.size);
        for outpoint in entry.spent_outpoints() {
            if self.spent.get(outpoint) == Some(txid) {
                self.spent.remove(outpoint);
            }
        }
        Some(entry)
    }

    /// Drops every entry mined by `block` or spending an outpoint the block spends.
    pub fn remove_for_block(&mut self, block: &Block) -> Vec<Hash256> {
        let mut removed = Vec::new();
        for tx in &block.transactions {
            let txid = tx.txid();
            if self.remove(&txid).is_some() {
                removed.push(txid);
            }
            if tx.is_coinbase() {
                continue;
            }
            for input in &tx.vin {
                if let Some(conflict) = self.spender(&input.prevout) {
                    self.remove(&conflict);
                    removed.push(conflict);
                }
            }
        }
        removed
    }

    /// Removes and returns every entry, oldest first.
    pub fn drain(&mut self) -> Vec<MempoolEntry> {
        let mut entries: Vec<MempoolEntry> = self.entries.drain().map(|(_, entry)| entry).collect();
        entries.sort_by_key(|entry| entry.sequence);
        self.spent.clear();
        self.total_bytes = 0;
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_primitives::block::BlockHeader;
    use beand_primitives::{TxIn, TxOut};

    fn spend(prevout: OutPoint, value: Amount) -> Transaction {
        Transaction {
            version: 1,
            time: 10,
            vin: vec![TxIn::new(prevout, vec![0x51])],
            vout: vec![TxOut {
                value,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn conflicting_spend_is_refused() {
        let mut pool = Mempool::new(0);
        let outpoint = OutPoint::new([1u8; 32], 0);
        let first = pool.insert(spend(outpoint.clone(), 5), 1).expect("insert");
        let err = pool.insert(spend(outpoint.clone(), 4), 2).expect_err("conflict");
        assert_eq!(err.kind, MempoolErrorKind::ConflictingInput);
        let again = pool.insert(spend(outpoint.clone(), 5), 1).expect_err("duplicate");
        assert_eq!(again.kind, MempoolErrorKind::AlreadyInMempool);
        assert_eq!(pool.spender(&outpoint), Some(first));

        pool.remove(&first).expect("remove");
        assert!(!pool.is_spent(&outpoint));
        assert_eq!(pool.bytes(), 0);
    }

    #[test]
    fn block_evicts_mined_and_conflicting() {
        let mut pool = Mempool::new(0);
        let mined = spend(OutPoint::new([1u8; 32], 0), 5);
        let conflicted = spend(OutPoint::new([2u8; 32], 0), 5);
        let untouched = spend(OutPoint::new([3u8; 32], 0), 5);
        let mined_id = pool.insert(mined.clone(), 0).expect("mined");
        let conflicted_id = pool.insert(conflicted, 0).expect("conflicted");
        let untouched_id = pool.insert(untouched, 0).expect("untouched");

        let coinbase = Transaction {
            version: 1,
            time: 10,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x01, 0x01])],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        };
        let double = spend(OutPoint::new([2u8; 32], 0), 1);
        let block = Block {
            header: BlockHeader {
                version: 6,
                prev_block: [0u8; 32],
                merkle_root: [0u8; 32],
                time: 10,
                bits: 0,
                nonce: 0,
            },
            transactions: vec![coinbase, mined, double],
            signature: Vec::new(),
        };
        let removed = pool.remove_for_block(&block);
        assert_eq!(removed, vec![mined_id, conflicted_id]);
        assert_eq!(pool.size(), 1);
        assert!(pool.contains(&untouched_id));
        assert_eq!(pool.entries()[0].txid, untouched_id);
    }
}
