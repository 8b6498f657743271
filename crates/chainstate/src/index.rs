//! In-memory block index.
//!
//! Entries live in an arena and are addressed by [`IndexHandle`]s that stay valid for the
//! lifetime of the index. A parent is always inserted before its children, so arena order
//! is a topological order of the block tree.

use std::collections::HashMap;
use std::fmt;

use beand_consensus::constants::MEDIAN_TIME_SPAN;
use beand_consensus::{hash256_to_hex, ConsensusParams, Hash256};
use beand_pow::difficulty::{
    block_proof, median_time_past, next_target_required, CompactError, TargetPoint,
};
use beand_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};
use beand_primitives::Block;
use beand_stake::modifier::{block_stake_modifier, GENESIS_STAKE_MODIFIER};
use beand_storage::{Column, KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;

use crate::flatfiles::FileLocation;
use crate::validation::RejectKind;

const META_BEST_BLOCK_KEY: &[u8] = b"best_block";

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct IndexHandle(u32);

impl IndexHandle {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockStatus {
    /// Body stored, not yet validated against its parent chain.
    HeaderOnly,
    /// Fully validated. Active or not depends on the chain selector.
    Valid,
    Invalid,
}

impl BlockStatus {
    fn to_u8(self) -> u8 {
        match self {
            BlockStatus::HeaderOnly => 0,
            BlockStatus::Valid => 1,
            BlockStatus::Invalid => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(BlockStatus::HeaderOnly),
            1 => Some(BlockStatus::Valid),
            2 => Some(BlockStatus::Invalid),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct IndexEntry {
    pub hash: Hash256,
    pub parent: Option<IndexHandle>,
    pub prev_hash: Hash256,
    pub height: i32,
    pub time: u32,
    pub bits: u32,
    pub chain_weight: U256,
    pub status: BlockStatus,
    pub failure: Option<RejectKind>,
    pub location: Option<FileLocation>,
    pub undo: Option<FileLocation>,
    pub tx_count: u32,
    pub is_proof_of_stake: bool,
    pub stake_modifier: Hash256,
    /// Order of first arrival; breaks ties between equal-weight tips.
    pub arrival: u64,
    skip: Option<IndexHandle>,
}

#[derive(Debug)]
pub enum IndexError {
    UnknownParent(Hash256),
    BadBits(CompactError),
    Corrupt(String),
}

impl fmt::Display for IndexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IndexError::UnknownParent(hash) => {
                write!(f, "unknown parent block {}", hash256_to_hex(hash))
            }
            IndexError::BadBits(err) => write!(f, "invalid compact target: {err}"),
            IndexError::Corrupt(message) => write!(f, "corrupt block index: {message}"),
        }
    }
}

impl std::error::Error for IndexError {}

impl From<CompactError> for IndexError {
    fn from(err: CompactError) -> Self {
        IndexError::BadBits(err)
    }
}

fn invert_lowest_one(value: i32) -> i32 {
    value & value.saturating_sub(1)
}

fn get_skip_height(height: i32) -> i32 {
    if height < 2 {
        0
    } else if (height & 1) != 0 {
        invert_lowest_one(invert_lowest_one(height - 1)) + 1
    } else {
        invert_lowest_one(height)
    }
}

#[derive(Default)]
pub struct BlockIndex {
    entries: Vec<IndexEntry>,
    by_hash: HashMap<Hash256, IndexHandle>,
    next_arrival: u64,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entry(&self, handle: IndexHandle) -> &IndexEntry {
        &self.entries[handle.index()]
    }

    pub fn entry_mut(&mut self, handle: IndexHandle) -> &mut IndexEntry {
        &mut self.entries[handle.index()]
    }

    pub fn lookup(&self, hash: &Hash256) -> Option<IndexHandle> {
        self.by_hash.get(hash).copied()
    }

    pub fn handles(&self) -> impl Iterator<Item = IndexHandle> + '_ {
        (0..self.entries.len() as u32).map(IndexHandle)
    }

    /// Adds `block`'s header, or returns the existing handle for its hash.
    ///
    /// A block whose parent is invalid enters the index already invalid.
    pub fn insert_header(&mut self, block: &Block) -> Result<IndexHandle, IndexError> {
        let hash = block.hash();
        if let Some(handle) = self.lookup(&hash) {
            return Ok(handle);
        }
        let proof = block_proof(block.header.bits)?;
        let header = &block.header;
        let (parent, height, chain_weight, stake_modifier, status, failure) =
            if header.prev_block == [0u8; 32] && self.entries.is_empty() {
                (
                    None,
                    0,
                    proof,
                    GENESIS_STAKE_MODIFIER,
                    BlockStatus::HeaderOnly,
                    None,
                )
            } else {
                let parent = self
                    .lookup(&header.prev_block)
                    .ok_or(IndexError::UnknownParent(header.prev_block))?;
                let parent_entry = self.entry(parent);
                let (status, failure) = if parent_entry.status == BlockStatus::Invalid {
                    (BlockStatus::Invalid, parent_entry.failure)
                } else {
                    (BlockStatus::HeaderOnly, None)
                };
                (
                    Some(parent),
                    parent_entry.height + 1,
                    parent_entry.chain_weight.saturating_add(proof),
                    block_stake_modifier(block, &parent_entry.stake_modifier),
                    status,
                    failure,
                )
            };
        let skip = match parent {
            Some(parent) => self.ancestor_at_height(parent, get_skip_height(height)),
            None => None,
        };
        let handle = IndexHandle(self.entries.len() as u32);
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        self.entries.push(IndexEntry {
            hash,
            parent,
            prev_hash: header.prev_block,
            height,
            time: header.time,
            bits: header.bits,
            chain_weight,
            status,
            failure,
            location: None,
            undo: None,
            tx_count: block.transactions.len() as u32,
            is_proof_of_stake: block.is_proof_of_stake(),
            stake_modifier,
            arrival,
            skip,
        });
        self.by_hash.insert(hash, handle);
        Ok(handle)
    }

    /// Records full validation. Invalid entries stay invalid.
    pub fn mark_valid(&mut self, handle: IndexHandle) -> bool {
        let entry = self.entry_mut(handle);
        if entry.status != BlockStatus::HeaderOnly {
            return false;
        }
        entry.status = BlockStatus::Valid;
        true
    }

    /// Marks `handle` and every descendant invalid. Returns the entries that changed.
    pub fn mark_invalid(&mut self, handle: IndexHandle, kind: RejectKind) -> Vec<IndexHandle> {
        let mut changed = Vec::new();
        let mut invalid = vec![false; self.entries.len()];
        invalid[handle.index()] = true;
        for index in handle.index()..self.entries.len() {
            let entry = &mut self.entries[index];
            let inherited = entry.parent.is_some_and(|parent| invalid[parent.index()]);
            if index != handle.index() && !inherited {
                continue;
            }
            invalid[index] = true;
            if entry.status != BlockStatus::Invalid {
                entry.status = BlockStatus::Invalid;
                entry.failure = Some(kind);
                changed.push(IndexHandle(index as u32));
            }
        }
        changed
    }

    /// Whether tip `a` is preferred over tip `b`: more weight, then earlier arrival.
    pub fn is_better(&self, a: IndexHandle, b: IndexHandle) -> bool {
        let (a, b) = (self.entry(a), self.entry(b));
        a.chain_weight > b.chain_weight
            || (a.chain_weight == b.chain_weight && a.arrival < b.arrival)
    }

    /// Heaviest fully validated entry.
    pub fn best_tip(&self) -> Option<IndexHandle> {
        self.handles()
            .filter(|handle| self.entry(*handle).status == BlockStatus::Valid)
            .reduce(|best, candidate| {
                if self.is_better(candidate, best) {
                    candidate
                } else {
                    best
                }
            })
    }

    pub fn ancestor_at_height(&self, handle: IndexHandle, height: i32) -> Option<IndexHandle> {
        let mut current = handle;
        let mut current_height = self.entry(current).height;
        if height < 0 || height > current_height {
            return None;
        }
        while current_height > height {
            let entry = self.entry(current);
            let skip_height = get_skip_height(current_height);
            current = match entry.skip {
                Some(skip) if skip_height >= height => skip,
                _ => entry.parent?,
            };
            current_height = self.entry(current).height;
        }
        Some(current)
    }

    /// Last common ancestor of `a` and `b`.
    pub fn find_fork_point(&self, a: IndexHandle, b: IndexHandle) -> Option<IndexHandle> {
        let height = self.entry(a).height.min(self.entry(b).height);
        let mut a = self.ancestor_at_height(a, height)?;
        let mut b = self.ancestor_at_height(b, height)?;
        while a != b {
            a = self.entry(a).parent?;
            b = self.entry(b).parent?;
        }
        Some(a)
    }

    /// Walks back from `handle` to the nearest block of the requested kind.
    /// Genesis ends the walk whatever its kind.
    pub fn last_of_kind(&self, handle: IndexHandle, proof_of_stake: bool) -> IndexHandle {
        let mut current = handle;
        loop {
            let entry = self.entry(current);
            match entry.parent {
                Some(parent) if entry.is_proof_of_stake != proof_of_stake => current = parent,
                _ => return current,
            }
        }
    }

    /// Compact target a child of `parent` must carry.
    pub fn next_bits(
        &self,
        parent: IndexHandle,
        proof_of_stake: bool,
        params: &ConsensusParams,
    ) -> Result<u32, CompactError> {
        let limit = if proof_of_stake {
            &params.pos_limit
        } else {
            &params.pow_limit
        };
        let last = self.last_of_kind(parent, proof_of_stake);
        let Some(last_parent) = self.entry(last).parent else {
            return next_target_required(None, None, limit, params);
        };
        let before_last = self.last_of_kind(last_parent, proof_of_stake);
        let point = |handle: IndexHandle| {
            let entry = self.entry(handle);
            TargetPoint {
                bits: entry.bits,
                time: entry.time,
            }
        };
        next_target_required(Some(point(last)), Some(point(before_last)), limit, params)
    }

    pub fn median_time_past(&self, handle: IndexHandle) -> u32 {
        let mut times = Vec::with_capacity(MEDIAN_TIME_SPAN);
        let mut current = Some(handle);
        while let Some(handle) = current {
            if times.len() == MEDIAN_TIME_SPAN {
                break;
            }
            let entry = self.entry(handle);
            times.push(entry.time);
            current = entry.parent;
        }
        median_time_past(&times)
    }

    /// Handles from just above `ancestor` up to `tip`, in forward order.
    pub fn path_from(&self, ancestor: IndexHandle, tip: IndexHandle) -> Vec<IndexHandle> {
        let stop = self.entry(ancestor).height;
        let mut path = Vec::new();
        let mut current = tip;
        while self.entry(current).height > stop {
            path.push(current);
            match self.entry(current).parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        path.reverse();
        path
    }

    pub fn children(&self, handle: IndexHandle) -> Vec<IndexHandle> {
        self.handles()
            .skip(handle.index() + 1)
            .filter(|child| self.entry(*child).parent == Some(handle))
            .collect()
    }

    /// Rebuilds the arena from `Column::BlockIndex`.
    pub fn load<S: KeyValueStore>(store: &S) -> Result<Self, IndexError> {
        let mut records = Vec::new();
        store
            .for_each_prefix(Column::BlockIndex, &[], &mut |key, value| {
                let hash: Hash256 = key
                    .try_into()
                    .map_err(|_| StoreError::Backend("invalid block index key".to_string()))?;
                let record = decode_entry(hash, value)
                    .map_err(|err| StoreError::Backend(format!("invalid block index entry: {err}")))?;
                records.push(record);
                Ok(())
            })
            .map_err(|err| IndexError::Corrupt(err.to_string()))?;
        records.sort_by_key(|entry| (entry.height, entry.arrival));

        let mut index = Self::new();
        for mut entry in records {
            entry.parent = if entry.height == 0 {
                None
            } else {
                Some(
                    index
                        .lookup(&entry.prev_hash)
                        .ok_or(IndexError::UnknownParent(entry.prev_hash))?,
                )
            };
            entry.skip = match entry.parent {
                Some(parent) => index.ancestor_at_height(parent, get_skip_height(entry.height)),
                None => None,
            };
            index.next_arrival = index.next_arrival.max(entry.arrival + 1);
            let handle = IndexHandle(index.entries.len() as u32);
            index.by_hash.insert(entry.hash, handle);
            index.entries.push(entry);
        }
        Ok(index)
    }

    pub fn put_entry(&self, batch: &mut WriteBatch, handle: IndexHandle) {
        put_index_record(batch, self.entry(handle));
    }
}

/// Queues `entry` for persistence without touching the arena.
pub fn put_index_record(batch: &mut WriteBatch, entry: &IndexEntry) {
    batch.put(Column::BlockIndex, entry.hash, encode_entry(entry));
}

fn encode_location(encoder: &mut Encoder, location: Option<FileLocation>) {
    match location {
        Some(location) => {
            encoder.write_u8(1);
            location.consensus_encode(encoder);
        }
        None => encoder.write_u8(0),
    }
}

fn decode_location(decoder: &mut Decoder<'_>) -> Result<Option<FileLocation>, DecodeError> {
    match decoder.read_u8()? {
        0 => Ok(None),
        1 => FileLocation::consensus_decode(decoder).map(Some),
        _ => Err(DecodeError::InvalidData("invalid location flag")),
    }
}

fn encode_entry(entry: &IndexEntry) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(160);
    encoder.write_hash_le(&entry.prev_hash);
    encoder.write_i32_le(entry.height);
    encoder.write_u32_le(entry.time);
    encoder.write_u32_le(entry.bits);
    encoder.write_bytes(&entry.chain_weight.to_big_endian());
    encoder.write_u8(entry.status.to_u8());
    encoder.write_u8(entry.failure.map_or(0, RejectKind::to_u8));
    encode_location(&mut encoder, entry.location);
    encode_location(&mut encoder, entry.undo);
    encoder.write_u32_le(entry.tx_count);
    encoder.write_u8(u8::from(entry.is_proof_of_stake));
    encoder.write_bytes(&entry.stake_modifier);
    encoder.write_u64_le(entry.arrival);
    encoder.into_inner()
}

fn decode_entry(hash: Hash256, bytes: &[u8]) -> Result<IndexEntry, DecodeError> {
    let mut decoder = Decoder::new(bytes);
    let prev_hash = decoder.read_hash_le()?;
    let height = decoder.read_i32_le()?;
    let time = decoder.read_u32_le()?;
    let bits = decoder.read_u32_le()?;
    let chain_weight = U256::from_big_endian(&decoder.read_fixed::<32>()?);
    let status = BlockStatus::from_u8(decoder.read_u8()?)
        .ok_or(DecodeError::InvalidData("invalid block status"))?;
    let failure = match decoder.read_u8()? {
        0 => None,
        code => Some(
            RejectKind::from_u8(code).ok_or(DecodeError::InvalidData("invalid reject kind"))?,
        ),
    };
    let location = decode_location(&mut decoder)?;
    let undo = decode_location(&mut decoder)?;
    let tx_count = decoder.read_u32_le()?;
    let is_proof_of_stake = decoder.read_u8()? != 0;
    let stake_modifier = decoder.read_fixed::<32>()?;
    let arrival = decoder.read_u64_le()?;
    if !decoder.is_empty() {
        return Err(DecodeError::TrailingBytes);
    }
    Ok(IndexEntry {
        hash,
        parent: None,
        prev_hash,
        height,
        time,
        bits,
        chain_weight,
        status,
        failure,
        location,
        undo,
        tx_count,
        is_proof_of_stake,
        stake_modifier,
        arrival,
        skip: None,
    })
}

pub fn height_key(height: i32) -> [u8; 4] {
    (height as u32).to_be_bytes()
}

pub fn put_height_hash(batch: &mut WriteBatch, height: i32, hash: &Hash256) {
    batch.put(Column::HeightIndex, height_key(height), *hash);
}

pub fn delete_height_hash(batch: &mut WriteBatch, height: i32) {
    batch.delete(Column::HeightIndex, height_key(height));
}

pub fn set_best_block(batch: &mut WriteBatch, hash: &Hash256) {
    batch.put(Column::Meta, META_BEST_BLOCK_KEY, *hash);
}

pub fn load_best_block<S: KeyValueStore>(store: &S) -> Result<Option<Hash256>, StoreError> {
    match store.get(Column::Meta, META_BEST_BLOCK_KEY)? {
        Some(bytes) => bytes
            .as_slice()
            .try_into()
            .map(Some)
            .map_err(|_| StoreError::Backend("invalid best block hash".to_string())),
        None => Ok(None),
    }
}

pub fn load_height_hash<S: KeyValueStore>(
    store: &S,
    height: i32,
) -> Result<Option<Hash256>, StoreError> {
    match store.get(Column::HeightIndex, &height_key(height))? {
        Some(bytes) => bytes
            .as_slice()
            .try_into()
            .map(Some)
            .map_err(|_| StoreError::Backend("invalid height index entry".to_string())),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_consensus::{consensus_params, Network};
    use beand_primitives::block::BlockHeader;
    use beand_primitives::{genesis_block, OutPoint, Transaction, TxIn, TxOut};
    use beand_storage::memory::MemoryStore;

    fn child(parent: &Block, time: u32, tag: u8) -> Block {
        let coinbase = Transaction {
            version: 1,
            time,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x01, tag, 0x00])],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut block = Block {
            header: BlockHeader {
                version: 6,
                prev_block: parent.hash(),
                merkle_root: [0u8; 32],
                time,
                bits: parent.header.bits,
                nonce: 0,
            },
            transactions: vec![coinbase],
            signature: Vec::new(),
        };
        block.header.merkle_root = block.compute_merkle_root().0;
        block
    }

    fn chain(index: &mut BlockIndex, from: &Block, len: usize, tag: u8) -> Vec<(Block, IndexHandle)> {
        let mut out: Vec<(Block, IndexHandle)> = Vec::new();
        let mut parent = from.clone();
        for step in 0..len {
            let block = child(&parent, parent.header.time + 60, tag.wrapping_add(step as u8));
            let handle = index.insert_header(&block).expect("insert");
            parent = block.clone();
            out.push((block, handle));
        }
        out
    }

    #[test]
    fn insert_is_idempotent_and_needs_parent() {
        let params = consensus_params(Network::Regtest);
        let genesis = genesis_block(&params);
        let mut index = BlockIndex::new();
        let root = index.insert_header(&genesis).expect("genesis");
        assert_eq!(index.insert_header(&genesis).expect("again"), root);
        assert_eq!(index.len(), 1);

        let b1 = child(&genesis, genesis.header.time + 60, 1);
        let orphan = child(&b1, b1.header.time + 60, 2);
        assert!(matches!(
            index.insert_header(&orphan),
            Err(IndexError::UnknownParent(hash)) if hash == b1.hash()
        ));
        let h1 = index.insert_header(&b1).expect("b1");
        assert_eq!(index.entry(h1).height, 1);
        assert_eq!(index.entry(h1).parent, Some(root));
        assert!(index.entry(h1).chain_weight > index.entry(root).chain_weight);
    }

    #[test]
    fn invalid_is_sticky_and_inherited() {
        let params = consensus_params(Network::Regtest);
        let genesis = genesis_block(&params);
        let mut index = BlockIndex::new();
        index.insert_header(&genesis).expect("genesis");
        let blocks = chain(&mut index, &genesis, 3, 1);
        let changed = index.mark_invalid(blocks[0].1, RejectKind::ImmatureSpend);
        assert_eq!(changed.len(), 3);
        assert!(!index.mark_valid(blocks[0].1));
        assert_eq!(index.entry(blocks[2].1).status, BlockStatus::Invalid);

        let late = child(&blocks[2].0, blocks[2].0.header.time + 60, 9);
        let handle = index.insert_header(&late).expect("insert");
        assert_eq!(index.entry(handle).status, BlockStatus::Invalid);
        assert_eq!(index.entry(handle).failure, Some(RejectKind::ImmatureSpend));
    }

    #[test]
    fn ancestors_and_fork_point() {
        let params = consensus_params(Network::Regtest);
        let genesis = genesis_block(&params);
        let mut index = BlockIndex::new();
        let root = index.insert_header(&genesis).expect("genesis");
        let main = chain(&mut index, &genesis, 40, 0);
        let side = chain(&mut index, &main[9].0, 5, 100);

        let tip = main[39].1;
        for height in [0, 1, 7, 16, 33, 40] {
            let ancestor = index.ancestor_at_height(tip, height).expect("ancestor");
            assert_eq!(index.entry(ancestor).height, height);
        }
        assert_eq!(index.ancestor_at_height(tip, 0), Some(root));
        assert_eq!(index.ancestor_at_height(tip, 41), None);

        let fork = index.find_fork_point(tip, side[4].1).expect("fork");
        assert_eq!(fork, main[9].1);
        assert_eq!(index.path_from(fork, side[4].1).len(), 5);
        assert_eq!(index.children(main[9].1), vec![main[10].1, side[0].1]);
    }

    #[test]
    fn equal_weight_prefers_first_arrival() {
        let params = consensus_params(Network::Regtest);
        let genesis = genesis_block(&params);
        let mut index = BlockIndex::new();
        let root = index.insert_header(&genesis).expect("genesis");
        index.mark_valid(root);
        let first = index
            .insert_header(&child(&genesis, genesis.header.time + 60, 1))
            .expect("first");
        let second = index
            .insert_header(&child(&genesis, genesis.header.time + 60, 2))
            .expect("second");
        index.mark_valid(second);
        index.mark_valid(first);
        assert!(index.is_better(first, second));
        assert_eq!(index.best_tip(), Some(first));
    }

    #[test]
    fn reload_preserves_entries() {
        let params = consensus_params(Network::Regtest);
        let genesis = genesis_block(&params);
        let mut index = BlockIndex::new();
        let root = index.insert_header(&genesis).expect("genesis");
        index.mark_valid(root);
        let blocks = chain(&mut index, &genesis, 4, 1);
        index.mark_valid(blocks[0].1);
        index.mark_invalid(blocks[1].1, RejectKind::CheckpointViolation);
        index.entry_mut(blocks[0].1).location = Some(FileLocation {
            file_id: 0,
            offset: 8,
            len: 120,
        });

        let store = MemoryStore::new();
        let mut batch = WriteBatch::new();
        for handle in index.handles() {
            index.put_entry(&mut batch, handle);
        }
        store.write_batch(&batch).expect("commit");

        let reloaded = BlockIndex::load(&store).expect("load");
        assert_eq!(reloaded.len(), 5);
        let tip = reloaded.lookup(&blocks[3].0.hash()).expect("tip");
        assert_eq!(reloaded.entry(tip).height, 4);
        assert_eq!(reloaded.entry(tip).failure, Some(RejectKind::CheckpointViolation));
        let first = reloaded.lookup(&blocks[0].0.hash()).expect("first");
        assert_eq!(reloaded.entry(first).location, index.entry(blocks[0].1).location);
        assert_eq!(reloaded.entry(first).status, BlockStatus::Valid);
        assert_eq!(reloaded.ancestor_at_height(tip, 0), reloaded.lookup(&genesis.hash()));
    }
}
