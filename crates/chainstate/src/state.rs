//! The chain state aggregate: block index, ledger, active chain and pools behind one lock.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use beand_consensus::constants::MAX_FUTURE_BLOCK_TIME;
use beand_consensus::money::Amount;
use beand_consensus::{hash256_to_hex, ChainParams, CheckpointMode, Hash256};
use beand_primitives::encoding::{decode, DecodeError};
use beand_primitives::{genesis_block, Block, OutPoint, Transaction};
use beand_script::interpreter::STANDARD_SCRIPT_VERIFY_FLAGS;
use beand_storage::{KeyValueStore, StoreError, WriteBatch};
use primitive_types::U256;
use sha2::{Digest, Sha256};

use crate::checkpoints::{
    load_signed_checkpoint, put_signed_checkpoint, CheckpointEnforcer, CheckpointError,
    SignedCheckpoint,
};
use crate::connect::{connect_block, ConnectError, ConnectedBlock};
use crate::filemeta::{load_file_info, put_file_info, FileKind, FlatFileInfo};
use crate::flatfiles::{FileLocation, FlatFileError, FlatFileStore};
use crate::index::{
    delete_height_hash, load_best_block, load_height_hash, put_height_hash, put_index_record,
    set_best_block, BlockIndex, BlockStatus, IndexEntry, IndexError, IndexHandle,
};
use crate::mempool::Mempool;
use crate::notify::{dispatch, ChainEvent, ChainListener};
use crate::orphans::OrphanPool;
use crate::undo::BlockUndo;
use crate::utxo::{block_created_outputs, LedgerError, UtxoDelta, UtxoEntry, UtxoSet, UtxoView};
use crate::validation::{
    check_block, check_block_context, check_transaction, check_tx_inputs, verify_scripts,
    BlockContext, RejectKind, ScriptCheck, ValidationError, ValidationFlags,
};

pub const DEFAULT_MAX_FLAT_FILE_SIZE: u64 = 128 * 1024 * 1024;
pub const DEFAULT_MEMPOOL_BYTES: usize = 300 * 1024 * 1024;

#[derive(Debug)]
pub enum ChainStateError {
    Store(StoreError),
    FlatFile(FlatFileError),
    Decode(DecodeError),
    Ledger(LedgerError),
    Index(IndexError),
    Checkpoint(CheckpointError),
    Validation(ValidationError),
    CorruptIndex(&'static str),
    GenesisMismatch { expected: Hash256, found: Hash256 },
    Halted,
    Poisoned,
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::FlatFile(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::Ledger(err) => write!(f, "{err}"),
            ChainStateError::Index(err) => write!(f, "{err}"),
            ChainStateError::Checkpoint(err) => write!(f, "{err}"),
            ChainStateError::Validation(err) => write!(f, "{err}"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
            ChainStateError::GenesisMismatch { expected, found } => write!(
                f,
                "genesis block mismatch: expected {}, found {}",
                hash256_to_hex(expected),
                hash256_to_hex(found)
            ),
            ChainStateError::Halted => write!(f, "chain state halted after a storage failure"),
            ChainStateError::Poisoned => write!(f, "chain state lock poisoned"),
        }
    }
}

impl std::error::Error for ChainStateError {}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<FlatFileError> for ChainStateError {
    fn from(err: FlatFileError) -> Self {
        ChainStateError::FlatFile(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}

impl From<LedgerError> for ChainStateError {
    fn from(err: LedgerError) -> Self {
        ChainStateError::Ledger(err)
    }
}

impl From<IndexError> for ChainStateError {
    fn from(err: IndexError) -> Self {
        ChainStateError::Index(err)
    }
}

impl From<CheckpointError> for ChainStateError {
    fn from(err: CheckpointError) -> Self {
        ChainStateError::Checkpoint(err)
    }
}

impl From<ValidationError> for ChainStateError {
    fn from(err: ValidationError) -> Self {
        ChainStateError::Validation(err)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Acceptance {
    Accepted(Hash256),
    AlreadyKnown(Hash256),
}

impl Acceptance {
    pub fn hash(&self) -> Hash256 {
        match self {
            Acceptance::Accepted(hash) | Acceptance::AlreadyKnown(hash) => *hash,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Rejection {
    pub kind: RejectKind,
    pub reason: String,
}

impl Rejection {
    pub fn new(kind: RejectKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.reason)
    }
}

impl std::error::Error for Rejection {}

impl From<ValidationError> for Rejection {
    fn from(err: ValidationError) -> Self {
        Rejection::new(err.kind(), err.to_string())
    }
}

impl From<ChainStateError> for Rejection {
    fn from(err: ChainStateError) -> Self {
        match err {
            ChainStateError::Validation(err) => err.into(),
            other => Rejection::new(RejectKind::StorageFailure, other.to_string()),
        }
    }
}

pub type AcceptanceResult = Result<Acceptance, Rejection>;

#[derive(Clone, Debug)]
pub struct ChainStateConfig {
    pub checkpoint_mode: CheckpointMode,
    pub flags: ValidationFlags,
    pub max_flat_file_size: u64,
    pub mempool_bytes: usize,
}

impl Default for ChainStateConfig {
    fn default() -> Self {
        Self {
            checkpoint_mode: CheckpointMode::default(),
            flags: ValidationFlags::default(),
            max_flat_file_size: DEFAULT_MAX_FLAT_FILE_SIZE,
            mempool_bytes: DEFAULT_MEMPOOL_BYTES,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ChainTip {
    pub hash: Hash256,
    pub height: i32,
    pub time: u32,
    pub chain_weight: U256,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockInfo {
    pub hash: Hash256,
    pub height: i32,
    pub status: BlockStatus,
    pub failure: Option<RejectKind>,
    pub is_active: bool,
    pub chain_weight: U256,
    pub is_proof_of_stake: bool,
}

/// Parent-chain facts the stake minter needs to build the next block.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MintContext {
    pub prev_hash: Hash256,
    pub height: i32,
    pub prev_modifier: Hash256,
    pub bits: u32,
    pub median_time_past: u32,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct UtxoStats {
    pub best_block: Hash256,
    pub txouts: u64,
    pub total_amount: i64,
    pub hash_serialized: Hash256,
}

pub(crate) struct ChainInner {
    pub(crate) index: BlockIndex,
    /// Active chain, indexed by height.
    pub(crate) active: Vec<IndexHandle>,
    pub(crate) mempool: Mempool,
    pub(crate) orphans: OrphanPool,
    pub(crate) checkpoints: CheckpointEnforcer,
    file_info: HashMap<(FileKind, u32), FlatFileInfo>,
}

impl ChainInner {
    pub(crate) fn tip(&self) -> IndexHandle {
        self.active[self.active.len() - 1]
    }

    fn is_active(&self, handle: IndexHandle) -> bool {
        let height = self.index.entry(handle).height;
        usize::try_from(height)
            .ok()
            .and_then(|height| self.active.get(height))
            == Some(&handle)
    }
}

pub struct ChainState<S> {
    pub(crate) store: Arc<S>,
    pub(crate) params: ChainParams,
    pub(crate) config: ChainStateConfig,
    pub(crate) utxos: UtxoSet<Arc<S>>,
    pub(crate) blocks: FlatFileStore,
    pub(crate) undo: FlatFileStore,
    pub(crate) inner: RwLock<ChainInner>,
    listeners: RwLock<Vec<Arc<dyn ChainListener>>>,
    notify_lock: Mutex<()>,
    halted: AtomicBool,
}

pub(crate) fn unix_now() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| u32::try_from(elapsed.as_secs()).unwrap_or(u32::MAX))
        .unwrap_or(0)
}

struct Connected {
    handle: IndexHandle,
    block: Block,
    result: ConnectedBlock,
}

/// Handles and file locations between the tip and an activation target.
struct Route {
    tip: IndexHandle,
    target: IndexHandle,
    fork_height: i32,
    /// Active blocks above the fork, tip first, with block and undo locations.
    disconnect: Vec<(IndexHandle, Option<FileLocation>, Option<FileLocation>)>,
    connect: Vec<(IndexHandle, Option<FileLocation>)>,
}

/// A [`Route`] with its blocks and undo records read from disk.
struct ActivationPlan {
    tip: IndexHandle,
    target: IndexHandle,
    fork_height: i32,
    disconnect: Vec<(IndexHandle, Block, BlockUndo)>,
    connect: Vec<(IndexHandle, Block)>,
}

fn validated(entry: &IndexEntry) -> IndexEntry {
    let mut entry = entry.clone();
    if entry.status == BlockStatus::HeaderOnly {
        entry.status = BlockStatus::Valid;
    }
    entry
}

impl<S: KeyValueStore> ChainState<S> {
    /// Opens the chain state in `blocks_dir`, writing genesis into an empty store.
    ///
    /// Fails with `GenesisMismatch` when the compiled-in genesis does not hash to the
    /// network's genesis hash or the store holds a different genesis.
    pub fn open(
        store: Arc<S>,
        params: ChainParams,
        blocks_dir: impl AsRef<std::path::Path>,
        config: ChainStateConfig,
    ) -> Result<Self, ChainStateError> {
        let blocks_dir = blocks_dir.as_ref();
        let blocks = FlatFileStore::new(
            blocks_dir,
            "blk",
            params.message_start,
            config.max_flat_file_size,
        )?;
        let undo = FlatFileStore::new(
            blocks_dir,
            "rev",
            params.message_start,
            config.max_flat_file_size,
        )?;

        let genesis = genesis_block(&params.consensus);
        let genesis_hash = genesis.hash();
        if genesis_hash != params.consensus.hash_genesis_block {
            return Err(ChainStateError::GenesisMismatch {
                expected: params.consensus.hash_genesis_block,
                found: genesis_hash,
            });
        }

        let utxos = UtxoSet::new(Arc::clone(&store));
        let mut index = BlockIndex::load(store.as_ref())?;
        let mut file_info = HashMap::new();
        if index.is_empty() {
            beand_log::log_info!(
                "initializing chain state with genesis {}",
                hash256_to_hex(&genesis_hash)
            );
            let location = blocks.append(&genesis.consensus_encode_vec())?;
            let handle = index.insert_header(&genesis)?;
            index.mark_valid(handle);
            index.entry_mut(handle).location = Some(location);
            let mut info = FlatFileInfo::default();
            info.add_record(location, 0, genesis.header.time);
            file_info.insert((FileKind::Blocks, location.file_id), info);

            let mut batch = WriteBatch::new();
            index.put_entry(&mut batch, handle);
            put_height_hash(&mut batch, 0, &genesis_hash);
            set_best_block(&mut batch, &genesis_hash);
            for (outpoint, entry) in block_created_outputs(&genesis, 0) {
                utxos.put(&mut batch, &outpoint, &entry);
            }
            put_file_info(&mut batch, FileKind::Blocks, location.file_id, &info);
            store.write_batch(&batch)?;
        } else {
            let stored = load_height_hash(store.as_ref(), 0)?
                .ok_or(ChainStateError::CorruptIndex("missing genesis height entry"))?;
            if stored != genesis_hash {
                return Err(ChainStateError::GenesisMismatch {
                    expected: genesis_hash,
                    found: stored,
                });
            }
        }

        let best = load_best_block(store.as_ref())?
            .ok_or(ChainStateError::CorruptIndex("missing best block"))?;
        let tip = index
            .lookup(&best)
            .ok_or(ChainStateError::CorruptIndex("best block not in index"))?;
        let mut active = Vec::with_capacity(index.entry(tip).height as usize + 1);
        let mut cursor = Some(tip);
        while let Some(handle) = cursor {
            active.push(handle);
            cursor = index.entry(handle).parent;
        }
        active.reverse();
        if index.entry(active[0]).hash != genesis_hash {
            return Err(ChainStateError::CorruptIndex("active chain does not reach genesis"));
        }

        let mut checkpoints =
            CheckpointEnforcer::from_params(config.checkpoint_mode, &params.consensus);
        if let Some(signed) = load_signed_checkpoint(store.as_ref())? {
            if let Err(err) = checkpoints.accept_signed(signed) {
                beand_log::log_warn!("discarding stored checkpoint: {err}");
            }
        }

        let tip_entry = index.entry(tip);
        beand_log::log_info!(
            "chain state loaded: {} index entries, tip {} at height {}",
            index.len(),
            hash256_to_hex(&tip_entry.hash),
            tip_entry.height
        );

        let mempool = Mempool::new(config.mempool_bytes);
        Ok(Self {
            utxos,
            blocks,
            undo,
            inner: RwLock::new(ChainInner {
                index,
                active,
                mempool,
                orphans: OrphanPool::default(),
                checkpoints,
                file_info,
            }),
            store,
            params,
            config,
            listeners: RwLock::new(Vec::new()),
            notify_lock: Mutex::new(()),
            halted: AtomicBool::new(false),
        })
    }

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn add_listener(&self, listener: Arc<dyn ChainListener>) {
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn read_inner(&self) -> Result<RwLockReadGuard<'_, ChainInner>, ChainStateError> {
        self.inner.read().map_err(|_| ChainStateError::Poisoned)
    }

    fn write_inner(&self) -> Result<RwLockWriteGuard<'_, ChainInner>, ChainStateError> {
        if self.is_halted() {
            return Err(ChainStateError::Halted);
        }
        self.inner.write().map_err(|_| ChainStateError::Poisoned)
    }

    pub fn best_tip(&self) -> Result<ChainTip, ChainStateError> {
        let inner = self.read_inner()?;
        let entry = inner.index.entry(inner.tip());
        Ok(ChainTip {
            hash: entry.hash,
            height: entry.height,
            time: entry.time,
            chain_weight: entry.chain_weight,
        })
    }

    pub fn block_hash_at_height(&self, height: i32) -> Result<Option<Hash256>, ChainStateError> {
        let inner = self.read_inner()?;
        Ok(usize::try_from(height)
            .ok()
            .and_then(|height| inner.active.get(height))
            .map(|handle| inner.index.entry(*handle).hash))
    }

    pub fn block_info(&self, hash: &Hash256) -> Result<Option<BlockInfo>, ChainStateError> {
        let inner = self.read_inner()?;
        Ok(inner.index.lookup(hash).map(|handle| {
            let entry = inner.index.entry(handle);
            BlockInfo {
                hash: entry.hash,
                height: entry.height,
                status: entry.status,
                failure: entry.failure,
                is_active: inner.is_active(handle),
                chain_weight: entry.chain_weight,
                is_proof_of_stake: entry.is_proof_of_stake,
            }
        }))
    }

    pub fn read_block_by_hash(&self, hash: &Hash256) -> Result<Option<Block>, ChainStateError> {
        let location = {
            let inner = self.read_inner()?;
            match inner.index.lookup(hash) {
                Some(handle) => inner.index.entry(handle).location,
                None => return Ok(None),
            }
        };
        self.read_block(location).map(Some)
    }

    pub fn utxo(&self, outpoint: &OutPoint) -> Result<Option<UtxoEntry>, ChainStateError> {
        let _inner = self.read_inner()?;
        Ok(self.utxos.get(outpoint)?)
    }

    pub fn mempool_contains(&self, txid: &Hash256) -> Result<bool, ChainStateError> {
        Ok(self.read_inner()?.mempool.contains(txid))
    }

    /// Pooled transactions and their fees, oldest first.
    pub fn mempool_transactions(&self) -> Result<Vec<(Transaction, Amount)>, ChainStateError> {
        let inner = self.read_inner()?;
        Ok(inner
            .mempool
            .entries()
            .into_iter()
            .map(|entry| (entry.tx.clone(), entry.fee))
            .collect())
    }

    pub fn orphan_count(&self) -> Result<usize, ChainStateError> {
        Ok(self.read_inner()?.orphans.len())
    }

    pub(crate) fn read_block(&self, location: Option<FileLocation>) -> Result<Block, ChainStateError> {
        let location = location.ok_or(ChainStateError::CorruptIndex("block data not stored"))?;
        let bytes = self.blocks.read(location)?;
        Ok(decode(&bytes)?)
    }

    pub(crate) fn read_undo(&self, location: Option<FileLocation>) -> Result<BlockUndo, ChainStateError> {
        let location = location.ok_or(ChainStateError::CorruptIndex("undo data not stored"))?;
        let bytes = self.undo.read(location)?;
        Ok(BlockUndo::decode(&bytes)?)
    }

    /// Decodes and submits a serialized block.
    pub fn submit_block(&self, bytes: &[u8]) -> AcceptanceResult {
        if self.is_halted() {
            return Err(ChainStateError::Halted.into());
        }
        let block: Block = decode(bytes)
            .map_err(|err| Rejection::new(RejectKind::MalformedEncoding, err.to_string()))?;
        self.process_block(block)
    }

    /// Accepts `block`, then any buffered orphans that were waiting on it.
    pub fn process_block(&self, block: Block) -> AcceptanceResult {
        let (result, released) = self.accept_block(block);
        let mut queue: VecDeque<Block> = released.into();
        while let Some(orphan) = queue.pop_front() {
            let orphan_hash = orphan.hash();
            let (orphan_result, more) = self.accept_block(orphan);
            if let Err(rejection) = orphan_result {
                beand_log::log_debug!(
                    "orphan {} rejected: {rejection}",
                    hash256_to_hex(&orphan_hash)
                );
            }
            queue.extend(more);
        }
        result
    }

    fn accept_block(&self, block: Block) -> (AcceptanceResult, Vec<Block>) {
        let hash = block.hash();
        let stored = self
            .write_inner()
            .map_err(Rejection::from)
            .and_then(|mut inner| self.store_block(&mut inner, block));
        let result = match stored {
            Ok(Some(handle)) => self.activate(handle).map(|()| Acceptance::Accepted(hash)),
            Ok(None) => Ok(Acceptance::AlreadyKnown(hash)),
            Err(rejection) => Err(rejection),
        };
        let released = match &result {
            Ok(Acceptance::Accepted(_)) => self
                .inner
                .write()
                .map(|mut inner| inner.orphans.take_children(&hash))
                .unwrap_or_default(),
            _ => Vec::new(),
        };
        (result, released)
    }

    /// Hands `events` to listeners after the write lock is released. Holding the
    /// notification lock across the hand-over keeps deliveries in transition order.
    fn notify(&self, guard: RwLockWriteGuard<'_, ChainInner>, events: Vec<ChainEvent>) {
        if events.is_empty() {
            return;
        }
        let _order = self.notify_lock.lock().unwrap_or_else(PoisonError::into_inner);
        drop(guard);
        let listeners = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        dispatch(&listeners, &events);
    }

    /// Runs the context-free checks and stores the body and index entry of a new block.
    /// Returns `None` for a block that is already indexed.
    fn store_block(
        &self,
        inner: &mut ChainInner,
        block: Block,
    ) -> Result<Option<IndexHandle>, Rejection> {
        let hash = block.hash();
        if let Some(handle) = inner.index.lookup(&hash) {
            let entry = inner.index.entry(handle);
            if entry.status == BlockStatus::Invalid {
                return Err(Rejection::new(
                    entry.failure.unwrap_or(RejectKind::MalformedEncoding),
                    "block previously rejected",
                ));
            }
            return Ok(None);
        }

        let consensus = &self.params.consensus;
        let parent = inner.index.lookup(&block.header.prev_block);
        if let Err(err) = check_block(&block, consensus, unix_now(), &self.config.flags) {
            beand_log::log_debug!("block {} failed checks: {err}", hash256_to_hex(&hash));
            if parent.is_some() && !err.is_malleable() {
                self.record_invalid_header(inner, &block, err.kind())?;
            }
            return Err(err.into());
        }

        let Some(parent) = parent else {
            if inner.orphans.insert(block) {
                beand_log::log_debug!("buffered orphan block {}", hash256_to_hex(&hash));
            }
            return Err(Rejection::new(RejectKind::UnknownParent, "parent block unknown"));
        };

        let (parent_status, parent_failure, parent_height) = {
            let entry = inner.index.entry(parent);
            (entry.status, entry.failure, entry.height)
        };
        if parent_status == BlockStatus::Invalid {
            let kind = parent_failure.unwrap_or(RejectKind::MalformedEncoding);
            self.record_invalid_header(inner, &block, kind)?;
            return Err(Rejection::new(kind, "descends from an invalid block"));
        }

        let height = parent_height + 1;
        let context = BlockContext {
            height,
            expected_bits: inner
                .index
                .next_bits(parent, block.is_proof_of_stake(), consensus)
                .map_err(|err| {
                    Rejection::new(RejectKind::ProofOfWorkOrStakeInvalid, err.to_string())
                })?,
            median_time_past: inner.index.median_time_past(parent),
        };
        let contextual = check_block_context(&block, &context, consensus).and_then(|()| {
            inner
                .checkpoints
                .check_block(height, &hash)
                .map_err(ValidationError::from)
        });
        if let Err(err) = contextual {
            beand_log::log_debug!(
                "block {} failed contextual checks: {err}",
                hash256_to_hex(&hash)
            );
            self.record_invalid_header(inner, &block, err.kind())?;
            return Err(err.into());
        }

        let location = self
            .blocks
            .append(&block.consensus_encode_vec())
            .map_err(|err| self.halt(err))?;
        let handle = inner.index.insert_header(&block).map_err(ChainStateError::from)?;
        inner.index.entry_mut(handle).location = Some(location);
        let mut batch = WriteBatch::new();
        let mut files = HashMap::new();
        let time = block.header.time;
        self.stage_file(inner, &mut files, &mut batch, FileKind::Blocks, location, height, time)?;
        inner.index.put_entry(&mut batch, handle);
        self.commit(&batch)?;
        inner.file_info.extend(files);
        Ok(Some(handle))
    }

    fn record_invalid_header(
        &self,
        inner: &mut ChainInner,
        block: &Block,
        kind: RejectKind,
    ) -> Result<(), ChainStateError> {
        let Ok(handle) = inner.index.insert_header(block) else {
            return Ok(());
        };
        let changed = inner.index.mark_invalid(handle, kind);
        self.persist_entries(inner, &changed)
    }

    fn persist_entries(
        &self,
        inner: &ChainInner,
        handles: &[IndexHandle],
    ) -> Result<(), ChainStateError> {
        if handles.is_empty() {
            return Ok(());
        }
        let mut batch = WriteBatch::new();
        for handle in handles {
            inner.index.put_entry(&mut batch, *handle);
        }
        self.commit(&batch)
    }

    /// Adds a record to the stats of its file in `staged`, queueing the updated stats.
    /// `inner` is left alone until the batch commits.
    #[allow(clippy::too_many_arguments)]
    fn stage_file(
        &self,
        inner: &ChainInner,
        staged: &mut HashMap<(FileKind, u32), FlatFileInfo>,
        batch: &mut WriteBatch,
        kind: FileKind,
        location: FileLocation,
        height: i32,
        time: u32,
    ) -> Result<(), ChainStateError> {
        let key = (kind, location.file_id);
        if !staged.contains_key(&key) {
            let current = match inner.file_info.get(&key) {
                Some(info) => *info,
                None => load_file_info(self.store.as_ref(), kind, location.file_id)?,
            };
            staged.insert(key, current);
        }
        let info = staged.entry(key).or_default();
        info.add_record(location, height, time);
        put_file_info(batch, kind, location.file_id, info);
        Ok(())
    }

    /// Marks the node halted after a storage failure. Every later mutation is refused.
    fn halt(&self, err: impl Into<ChainStateError>) -> ChainStateError {
        let err = err.into();
        self.halted.store(true, Ordering::SeqCst);
        beand_log::log_error!("storage failure, halting: {err}");
        err
    }

    /// Writes `batch` or halts the node.
    fn commit(&self, batch: &WriteBatch) -> Result<(), ChainStateError> {
        self.store.write_batch(batch).map_err(|err| self.halt(err))
    }

    /// Path from the current tip to `target` with the file locations it touches.
    fn route(inner: &ChainInner, target: IndexHandle) -> Result<Route, ChainStateError> {
        let tip = inner.tip();
        let fork = inner
            .index
            .find_fork_point(target, tip)
            .ok_or(ChainStateError::CorruptIndex("branch does not meet active chain"))?;
        let fork_height = inner.index.entry(fork).height;
        let disconnect = inner.active[(fork_height as usize + 1)..]
            .iter()
            .rev()
            .map(|handle| {
                let entry = inner.index.entry(*handle);
                (*handle, entry.location, entry.undo)
            })
            .collect();
        let connect = inner
            .index
            .path_from(fork, target)
            .into_iter()
            .map(|handle| (handle, inner.index.entry(handle).location))
            .collect();
        Ok(Route {
            tip,
            target,
            fork_height,
            disconnect,
            connect,
        })
    }

    /// Reads every body and undo record `route` needs. Runs without the chain lock.
    fn prefetch(&self, route: Route) -> Result<ActivationPlan, ChainStateError> {
        let mut disconnect = Vec::with_capacity(route.disconnect.len());
        for (handle, location, undo) in route.disconnect {
            disconnect.push((handle, self.read_block(location)?, self.read_undo(undo)?));
        }
        let mut connect = Vec::with_capacity(route.connect.len());
        for (handle, location) in route.connect {
            connect.push((handle, self.read_block(location)?));
        }
        Ok(ActivationPlan {
            tip: route.tip,
            target: route.target,
            fork_height: route.fork_height,
            disconnect,
            connect,
        })
    }

    /// Validates the branch ending at `target` and makes it active if it beats the tip.
    ///
    /// The route is planned under the shared lock and its blocks are read with no lock
    /// held. If the tip moved before the write lock is taken the plan is rebuilt.
    fn activate(&self, target: IndexHandle) -> Result<(), Rejection> {
        loop {
            let route = Self::route(&*self.read_inner()?, target)?;
            let plan = self.prefetch(route)?;
            let mut inner = self.write_inner()?;
            if inner.tip() != plan.tip {
                continue;
            }
            let mut events = Vec::new();
            let result = self.apply_plan(&mut inner, plan, false, &mut events);
            self.notify(inner, events);
            return result;
        }
    }

    /// Connects the plan's branch on top of its fork point. With `force` the branch
    /// replaces the active chain regardless of weight.
    fn apply_plan(
        &self,
        inner: &mut ChainInner,
        plan: ActivationPlan,
        force: bool,
        events: &mut Vec<ChainEvent>,
    ) -> Result<(), Rejection> {
        let ActivationPlan {
            tip,
            target,
            fork_height,
            disconnect,
            connect,
        } = plan;
        let target_entry = inner.index.entry(target);
        if target_entry.status == BlockStatus::Invalid {
            return Err(Rejection::new(
                target_entry.failure.unwrap_or(RejectKind::MalformedEncoding),
                "block previously rejected",
            ));
        }
        let better = force || inner.index.is_better(target, tip);
        let tip_height = inner.index.entry(tip).height;

        if better && !disconnect.is_empty() {
            let index = &inner.index;
            let active = &inner.active;
            let verdict = inner.checkpoints.check_reorg(
                fork_height,
                |height| {
                    usize::try_from(height)
                        .ok()
                        .and_then(|height| active.get(height))
                        .map(|handle| index.entry(*handle).hash)
                },
                |height| {
                    index
                        .ancestor_at_height(target, height)
                        .map(|handle| index.entry(handle).hash)
                },
            );
            if let Err(err) = verdict {
                beand_log::log_warn!("refusing reorganization: {err}");
                let culprit = match &err {
                    CheckpointError::HashMismatch { height, .. } => {
                        inner.index.ancestor_at_height(target, *height)
                    }
                    _ => connect.first().map(|(handle, _)| *handle),
                };
                if let Some(culprit) = culprit {
                    let changed = inner
                        .index
                        .mark_invalid(culprit, RejectKind::CheckpointViolation);
                    self.persist_entries(inner, &changed)?;
                }
                return Err(Rejection::new(RejectKind::CheckpointViolation, err.to_string()));
            }
        }

        let mut view = UtxoView::new(&self.utxos);
        let mut disconnected = Vec::with_capacity(disconnect.len());
        for (handle, block, undo) in disconnect {
            let height = inner.index.entry(handle).height;
            let delta = UtxoDelta::from_undo(&block, height, undo.spent);
            view.revert(&delta).map_err(ChainStateError::from)?;
            disconnected.push(block);
        }

        let mut connected: Vec<Connected> = Vec::with_capacity(connect.len());
        for (handle, block) in connect {
            let entry = inner.index.entry(handle);
            let parent_modifier = match entry.parent {
                Some(parent) => inner.index.entry(parent).stake_modifier,
                None => return Err(ChainStateError::CorruptIndex("branch reaches genesis").into()),
            };
            let outcome = connect_block(
                &block,
                entry.height,
                &parent_modifier,
                &view,
                &self.params.consensus,
                &self.config.flags,
            )
            .and_then(|result| match view.apply(&result.delta) {
                Ok(()) => Ok(result),
                Err(LedgerError::Store(err)) => Err(ConnectError::Store(err)),
                Err(LedgerError::Conflict(err)) => Err(ConnectError::Validation(
                    ValidationError::MissingInput(conflict_outpoint(&err)),
                )),
            });
            match outcome {
                Ok(result) => connected.push(Connected {
                    handle,
                    block,
                    result,
                }),
                Err(ConnectError::Store(err)) => return Err(ChainStateError::from(err).into()),
                Err(ConnectError::Validation(err)) => {
                    return self.reject_branch(inner, handle, &connected, err);
                }
            }
        }

        let mut batch = WriteBatch::new();
        if !better {
            let staged: Vec<(IndexHandle, IndexEntry)> = connected
                .iter()
                .map(|item| (item.handle, validated(inner.index.entry(item.handle))))
                .collect();
            for (_, entry) in &staged {
                put_index_record(&mut batch, entry);
            }
            self.commit(&batch)?;
            for (handle, entry) in staged {
                *inner.index.entry_mut(handle) = entry;
            }
            let entry = inner.index.entry(target);
            beand_log::log_info!(
                "block {} at height {} stored on a side branch",
                hash256_to_hex(&entry.hash),
                entry.height
            );
            return Ok(());
        }

        // Undo records reach disk before the batch that points at them.
        let mut files = HashMap::new();
        let mut staged = Vec::with_capacity(connected.len());
        for item in &connected {
            let location = self
                .undo
                .append(&item.result.undo.encode())
                .map_err(|err| self.halt(err))?;
            let mut entry = validated(inner.index.entry(item.handle));
            entry.undo = Some(location);
            let (height, time) = (entry.height, entry.time);
            self.stage_file(inner, &mut files, &mut batch, FileKind::Undo, location, height, time)?;
            put_index_record(&mut batch, &entry);
            put_height_hash(&mut batch, entry.height, &entry.hash);
            staged.push((item.handle, entry));
        }
        let target_height = inner.index.entry(target).height;
        for height in (target_height + 1)..=tip_height {
            delete_height_hash(&mut batch, height);
        }
        let target_hash = inner.index.entry(target).hash;
        set_best_block(&mut batch, &target_hash);
        view.into_batch(&mut batch);
        self.commit(&batch)?;

        for (handle, entry) in staged {
            *inner.index.entry_mut(handle) = entry;
        }
        inner.file_info.extend(files);
        inner.active.truncate(fork_height as usize + 1);
        inner.active.extend(connected.iter().map(|item| item.handle));

        for item in &connected {
            inner.mempool.remove_for_block(&item.block);
        }
        if !disconnected.is_empty() {
            self.readmit_after_reorg(inner, &disconnected);
            beand_log::log_info!(
                "reorganized: disconnected {} blocks, connected {}, fork at height {fork_height}",
                disconnected.len(),
                connected.len()
            );
        }
        beand_log::log_info!(
            "new best block {} height {} weight {}",
            hash256_to_hex(&target_hash),
            target_height,
            inner.index.entry(target).chain_weight
        );

        events.extend(
            disconnected
                .into_iter()
                .map(|block| ChainEvent::BlockDisconnected(Arc::new(block))),
        );
        events.extend(
            connected
                .into_iter()
                .map(|item| ChainEvent::BlockConnected(Arc::new(item.block))),
        );
        events.push(ChainEvent::NewBestTip(target_hash));
        Ok(())
    }

    /// Marks `failed` and its descendants invalid. Blocks of the branch that connected
    /// before it stay behind as validated side-branch blocks.
    fn reject_branch(
        &self,
        inner: &mut ChainInner,
        failed: IndexHandle,
        connected: &[Connected],
        err: ValidationError,
    ) -> Result<(), Rejection> {
        let kind = err.kind();
        beand_log::log_warn!(
            "block {} failed connection: {err}",
            hash256_to_hex(&inner.index.entry(failed).hash)
        );
        let mut changed = inner.index.mark_invalid(failed, kind);
        for item in connected {
            if inner.index.mark_valid(item.handle) {
                changed.push(item.handle);
            }
        }
        self.persist_entries(inner, &changed)?;
        Err(err.into())
    }

    /// Returns transactions from disconnected blocks to the pool and drops pooled ones
    /// whose inputs no longer exist.
    fn readmit_after_reorg(&self, inner: &mut ChainInner, disconnected: &[Block]) {
        let mut candidates: Vec<Transaction> = disconnected
            .iter()
            .rev()
            .flat_map(|block| block.transactions.iter())
            .filter(|tx| !tx.is_coinbase() && !tx.is_coinstake())
            .cloned()
            .collect();
        candidates.extend(inner.mempool.drain().into_iter().map(|entry| entry.tx));
        for tx in candidates {
            if let Err(rejection) = self.admit_transaction(inner, tx) {
                beand_log::log_debug!("dropped transaction after reorganization: {rejection}");
            }
        }
    }

    /// Decodes and submits a serialized transaction to the pool.
    pub fn submit_transaction(&self, bytes: &[u8]) -> AcceptanceResult {
        let tx: Transaction = decode(bytes)
            .map_err(|err| Rejection::new(RejectKind::MalformedEncoding, err.to_string()))?;
        let txid = tx.txid();
        let mut inner = self.write_inner()?;
        let generated = tx.is_coinbase() || tx.is_coinstake();
        if inner.mempool.contains(&txid) || (!generated && self.has_unspent_outputs(&tx)?) {
            return Ok(Acceptance::AlreadyKnown(txid));
        }
        self.admit_transaction(&mut inner, tx)?;
        beand_log::log_debug!("accepted transaction {}", hash256_to_hex(&txid));
        self.notify(inner, vec![ChainEvent::NewTransaction(txid)]);
        Ok(Acceptance::Accepted(txid))
    }

    /// Whether the ledger still holds an output of `tx`, i.e. it is confirmed on the
    /// active chain.
    fn has_unspent_outputs(&self, tx: &Transaction) -> Result<bool, ChainStateError> {
        let txid = tx.txid();
        for (index, output) in tx.vout.iter().enumerate() {
            if output.is_empty() {
                continue;
            }
            if self.utxos.get(&OutPoint::new(txid, index as u32))?.is_some() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn admit_transaction(&self, inner: &mut ChainInner, tx: Transaction) -> Result<Hash256, Rejection> {
        check_transaction(&tx)?;
        if tx.is_coinbase() || tx.is_coinstake() {
            return Err(Rejection::new(
                RejectKind::MalformedEncoding,
                "coinbase or coinstake as standalone transaction",
            ));
        }
        let now = unix_now();
        let height = inner.index.entry(inner.tip()).height + 1;
        if !tx.is_final(height, now) {
            return Err(ValidationError::Timestamp("non-final transaction").into());
        }
        if u64::from(tx.time) > u64::from(now) + u64::from(MAX_FUTURE_BLOCK_TIME) {
            return Err(ValidationError::Timestamp("transaction timestamp too far in the future").into());
        }

        let mut resolved = Vec::with_capacity(tx.vin.len());
        for input in &tx.vin {
            if let Some(spender) = inner.mempool.spender(&input.prevout) {
                return Err(Rejection::new(
                    RejectKind::DuplicateOrMissingInput,
                    format!("input already spent by pooled {}", hash256_to_hex(&spender)),
                ));
            }
            let entry = self
                .utxos
                .get(&input.prevout)
                .map_err(ChainStateError::from)?
                .ok_or_else(|| ValidationError::MissingInput(input.prevout.clone()))?;
            resolved.push(entry);
        }
        let totals = check_tx_inputs(&tx, &resolved, height, &self.params.consensus)?;
        let checks: Vec<ScriptCheck<'_>> = resolved
            .iter()
            .enumerate()
            .map(|(input_index, entry)| ScriptCheck {
                tx: &tx,
                tx_index: 0,
                input_index,
                script_pubkey: &entry.script_pubkey,
            })
            .collect();
        verify_scripts(&checks, STANDARD_SCRIPT_VERIFY_FLAGS)?;

        inner
            .mempool
            .insert(tx, totals.fee)
            .map_err(|err| Rejection::new(RejectKind::DuplicateOrMissingInput, err.to_string()))
    }

    /// Accepts a signed checkpoint from the network and persists it.
    ///
    /// Under strict enforcement an active block that conflicts with the checkpoint is
    /// invalidated, and the chain falls back to the best validated branch that agrees
    /// with the checkpoint.
    pub fn accept_checkpoint(&self, checkpoint: SignedCheckpoint) -> Result<bool, ChainStateError> {
        loop {
            let rewind = self.plan_checkpoint_rewind(&checkpoint)?;
            let mut inner = self.write_inner()?;
            if !inner.checkpoints.supersedes(&checkpoint)? {
                return Ok(false);
            }
            let strict = inner.checkpoints.mode() == CheckpointMode::Strict;
            let conflict = checkpoint_conflict(&inner, &checkpoint);
            let stale = match (&rewind, conflict) {
                (_, None) => false,
                (Some((planned, plan)), Some(conflict)) => {
                    *planned != conflict || plan.tip != inner.tip()
                }
                (None, Some(_)) => strict,
            };
            if stale {
                continue;
            }

            let mut batch = WriteBatch::new();
            put_signed_checkpoint(&mut batch, &checkpoint);
            self.commit(&batch)?;
            inner.checkpoints.accept_signed(checkpoint.clone())?;
            beand_log::log_info!(
                "accepted checkpoint {} at height {}",
                hash256_to_hex(&checkpoint.hash),
                checkpoint.height
            );

            let mut events = Vec::new();
            match (rewind, conflict) {
                (Some((conflict, plan)), Some(_)) => {
                    beand_log::log_warn!(
                        "active block {} conflicts with checkpoint at height {}, switching branches",
                        hash256_to_hex(&inner.index.entry(conflict).hash),
                        checkpoint.height
                    );
                    let changed = inner
                        .index
                        .mark_invalid(conflict, RejectKind::CheckpointViolation);
                    self.persist_entries(&inner, &changed)?;
                    if let Err(rejection) = self.apply_plan(&mut inner, plan, true, &mut events) {
                        beand_log::log_error!("could not leave the conflicting branch: {rejection}");
                    }
                }
                (_, Some(_)) => beand_log::log_warn!(
                    "checkpoint {} at height {} conflicts with the active chain",
                    hash256_to_hex(&checkpoint.hash),
                    checkpoint.height
                ),
                (_, None) => {}
            }
            self.notify(inner, events);
            return Ok(true);
        }
    }

    /// Under strict enforcement, the active block conflicting with `checkpoint` and the
    /// prefetched plan that moves the tip onto the best validated branch agreeing with it.
    fn plan_checkpoint_rewind(
        &self,
        checkpoint: &SignedCheckpoint,
    ) -> Result<Option<(IndexHandle, ActivationPlan)>, ChainStateError> {
        let (conflict, route) = {
            let inner = self.read_inner()?;
            if inner.checkpoints.mode() != CheckpointMode::Strict
                || !inner.checkpoints.supersedes(checkpoint)?
            {
                return Ok(None);
            }
            let Some(conflict) = checkpoint_conflict(&inner, checkpoint) else {
                return Ok(None);
            };
            let index = &inner.index;
            let fallback = index
                .handles()
                .filter(|handle| {
                    index.entry(*handle).status == BlockStatus::Valid
                        && index
                            .ancestor_at_height(*handle, checkpoint.height)
                            .map_or(true, |ancestor| index.entry(ancestor).hash == checkpoint.hash)
                })
                .reduce(|best, candidate| {
                    if index.is_better(candidate, best) {
                        candidate
                    } else {
                        best
                    }
                });
            let Some(fallback) = fallback else {
                return Err(CheckpointError::HashMismatch {
                    height: checkpoint.height,
                    expected: checkpoint.hash,
                    found: index.entry(conflict).hash,
                }
                .into());
            };
            (conflict, Self::route(&inner, fallback)?)
        };
        Ok(Some((conflict, self.prefetch(route)?)))
    }

    /// Signs the current tip with the checkpoint master key and adopts it.
    pub fn sign_tip_checkpoint(&self, secret: &[u8; 32]) -> Result<SignedCheckpoint, ChainStateError> {
        let tip = self.best_tip()?;
        let checkpoint = SignedCheckpoint::sign(tip.height, tip.hash, secret)
            .map_err(|_| ChainStateError::Checkpoint(CheckpointError::BadSignature))?;
        self.accept_checkpoint(checkpoint.clone())?;
        Ok(checkpoint)
    }

    pub fn checkpoint_mode(&self) -> Result<CheckpointMode, ChainStateError> {
        Ok(self.read_inner()?.checkpoints.mode())
    }

    pub fn mint_context(&self) -> Result<MintContext, ChainStateError> {
        let inner = self.read_inner()?;
        let tip = inner.tip();
        let entry = inner.index.entry(tip);
        let bits = inner
            .index
            .next_bits(tip, true, &self.params.consensus)
            .map_err(IndexError::from)?;
        Ok(MintContext {
            prev_hash: entry.hash,
            height: entry.height + 1,
            prev_modifier: entry.stake_modifier,
            bits,
            median_time_past: inner.index.median_time_past(tip),
        })
    }

    /// Unspent outputs paying one of `scripts` and not spent by a pooled transaction.
    pub fn spendable_outputs(
        &self,
        scripts: &[Vec<u8>],
    ) -> Result<Vec<(OutPoint, UtxoEntry)>, ChainStateError> {
        let inner = self.read_inner()?;
        let mut out = Vec::new();
        self.utxos.for_each(|outpoint, entry| {
            if scripts.contains(&entry.script_pubkey) && !inner.mempool.is_spent(&outpoint) {
                out.push((outpoint, entry));
            }
            Ok(())
        })?;
        Ok(out)
    }

    /// Count, total value and a digest of the ledger at the current tip.
    pub fn utxo_stats(&self) -> Result<UtxoStats, ChainStateError> {
        let inner = self.read_inner()?;
        let best_block = inner.index.entry(inner.tip()).hash;
        let mut hasher = Sha256::new();
        hasher.update(best_block);
        let mut stats = UtxoStats {
            best_block,
            ..UtxoStats::default()
        };
        self.utxos.for_each(|outpoint, entry| {
            hasher.update(outpoint.hash);
            hasher.update(outpoint.index.to_le_bytes());
            hasher.update(entry.encode());
            stats.txouts += 1;
            stats.total_amount = stats
                .total_amount
                .checked_add(entry.value)
                .ok_or_else(|| StoreError::Backend("utxo total overflow".to_string()))?;
            Ok(())
        })?;
        let first = hasher.finalize();
        stats.hash_serialized.copy_from_slice(&Sha256::digest(first));
        Ok(stats)
    }

    /// Hashes of indexed blocks whose display hex starts with `prefix`.
    pub fn find_blocks_by_prefix(&self, prefix: &str) -> Result<Vec<Hash256>, ChainStateError> {
        let prefix = prefix.to_ascii_lowercase();
        let inner = self.read_inner()?;
        Ok(inner
            .index
            .handles()
            .map(|handle| inner.index.entry(handle).hash)
            .filter(|hash| hash256_to_hex(hash).starts_with(&prefix))
            .collect())
    }

    /// Renders the block tree, one line per block, side branches indented.
    pub fn block_tree(&self) -> Result<String, ChainStateError> {
        let inner = self.read_inner()?;
        let mut out = String::new();
        let Some(root) = inner.index.handles().next() else {
            return Ok(out);
        };
        let mut stack = vec![(root, 0usize)];
        while let Some((handle, column)) = stack.pop() {
            let entry = inner.index.entry(handle);
            let marker = match (entry.status, inner.is_active(handle)) {
                (BlockStatus::Invalid, _) => "invalid",
                (_, true) => "active",
                (BlockStatus::Valid, false) => "valid",
                (BlockStatus::HeaderOnly, false) => "header",
            };
            out.push_str(&format!(
                "{}{} {} {} {} {}\n",
                "| ".repeat(column),
                entry.height,
                hash256_to_hex(&entry.hash),
                entry.time,
                if entry.is_proof_of_stake { "PoS" } else { "PoW" },
                marker
            ));
            let children = inner.index.children(handle);
            for (offset, child) in children.iter().enumerate().rev() {
                stack.push((*child, column + offset));
            }
        }
        Ok(out)
    }
}

/// The active block at the checkpoint's height, when it is not the checkpointed one.
fn checkpoint_conflict(inner: &ChainInner, checkpoint: &SignedCheckpoint) -> Option<IndexHandle> {
    let handle = *usize::try_from(checkpoint.height)
        .ok()
        .and_then(|height| inner.active.get(height))?;
    (inner.index.entry(handle).hash != checkpoint.hash).then_some(handle)
}

fn conflict_outpoint(err: &crate::utxo::ConflictError) -> OutPoint {
    use crate::utxo::ConflictError;
    match err {
        ConflictError::MissingSpend(outpoint)
        | ConflictError::DuplicateSpend(outpoint)
        | ConflictError::DuplicateCreate(outpoint)
        | ConflictError::MissingCreate(outpoint) => outpoint.clone(),
    }
}
