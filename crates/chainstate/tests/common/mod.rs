#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use beand_chainstate::state::{ChainState, ChainStateConfig};
use beand_chainstate::ChainListener;
use beand_consensus::money::{Amount, COIN};
use beand_consensus::{chain_params, ChainParams, Checkpoint, CheckpointMode, Hash256, Network};
use beand_pow::difficulty::target_to_compact;
use beand_pow::validation::check_proof_of_work;
use beand_primitives::block::{BlockHeader, CURRENT_VERSION};
use beand_primitives::{genesis_block, Block, OutPoint, Transaction, TxIn, TxOut};
use beand_script::standard::push_data;
use beand_storage::memory::MemoryStore;
use tempfile::TempDir;

pub const OP_TRUE: u8 = 0x51;
pub const REWARD: Amount = 50 * COIN;

/// Regtest with spendable coinbases after one confirmation.
pub fn regtest_params() -> ChainParams {
    let mut params = chain_params(Network::Regtest);
    params.consensus.coinbase_maturity = 1;
    let genesis = genesis_block(&params.consensus).hash();
    params.consensus.hash_genesis_block = genesis;
    params.consensus.checkpoints = vec![Checkpoint {
        height: 0,
        hash: genesis,
    }];
    params
}

pub struct Node {
    pub chain: Arc<ChainState<MemoryStore>>,
    pub store: Arc<MemoryStore>,
    pub params: ChainParams,
    pub genesis: Block,
    pub dir: TempDir,
}

impl Node {
    pub fn start(params: ChainParams, mode: CheckpointMode) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryStore::new());
        let config = ChainStateConfig {
            checkpoint_mode: mode,
            ..ChainStateConfig::default()
        };
        let chain = ChainState::open(Arc::clone(&store), params.clone(), dir.path(), config)
            .expect("open chain state");
        Self {
            chain: Arc::new(chain),
            store,
            genesis: genesis_block(&params.consensus),
            params,
            dir,
        }
    }

    pub fn regtest() -> Self {
        Self::start(regtest_params(), CheckpointMode::Strict)
    }

    pub fn tip(&self) -> Hash256 {
        self.chain.best_tip().expect("tip").hash
    }

    pub fn submit(&self, block: &Block) -> beand_chainstate::AcceptanceResult {
        self.chain.submit_block(&block.consensus_encode_vec())
    }
}

pub fn coinbase(height: i32, tag: u8, time: u32, outputs: Vec<TxOut>) -> Transaction {
    let mut script_sig = push_data(&height.to_le_bytes());
    script_sig.extend(push_data(&[tag]));
    Transaction {
        version: 1,
        time,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: outputs,
        lock_time: 0,
    }
}

pub fn anyone_can_spend(value: Amount) -> TxOut {
    TxOut {
        value,
        script_pubkey: vec![OP_TRUE],
    }
}

pub fn spend(prevouts: &[OutPoint], value: Amount, time: u32) -> Transaction {
    Transaction {
        version: 1,
        time,
        vin: prevouts
            .iter()
            .map(|prevout| TxIn::new(prevout.clone(), Vec::new()))
            .collect(),
        vout: vec![anyone_can_spend(value)],
        lock_time: 0,
    }
}

pub fn block_time(params: &ChainParams, height: i32, tag: u8) -> u32 {
    params.consensus.genesis_time + 60 * height as u32 + u32::from(tag)
}

/// A proof-of-work block on `prev` at `height` paying one anyone-can-spend coinbase output.
pub fn build_block(
    params: &ChainParams,
    prev: Hash256,
    height: i32,
    tag: u8,
    extra: Vec<Transaction>,
) -> Block {
    let time = block_time(params, height, tag);
    let mut transactions = vec![coinbase(height, tag, time, vec![anyone_can_spend(REWARD)])];
    transactions.extend(extra);
    mine(
        params,
        Block {
            header: BlockHeader {
                version: CURRENT_VERSION,
                prev_block: prev,
                merkle_root: [0u8; 32],
                time,
                bits: target_to_compact(&params.consensus.pow_limit),
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        },
    )
}

pub fn mine(params: &ChainParams, mut block: Block) -> Block {
    block.header.merkle_root = block.compute_merkle_root().0;
    while check_proof_of_work(&block.hash(), block.header.bits, &params.consensus).is_err() {
        block.header.nonce += 1;
    }
    block
}

/// Extends `prev` with `count` blocks, returning them in order.
pub fn build_chain(params: &ChainParams, prev: Hash256, start: i32, count: i32, tag: u8) -> Vec<Block> {
    let mut out: Vec<Block> = Vec::new();
    let mut parent = prev;
    for height in start..start + count {
        let block = build_block(params, parent, height, tag, Vec::new());
        parent = block.hash();
        out.push(block);
    }
    out
}

pub fn coinbase_outpoint(block: &Block) -> OutPoint {
    OutPoint::new(block.transactions[0].txid(), 0)
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Seen {
    Connected(Hash256),
    Disconnected(Hash256),
    Tip(Hash256),
    Tx(Hash256),
}

#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<Seen>>,
}

impl Recorder {
    pub fn take(&self) -> Vec<Seen> {
        std::mem::take(&mut *self.seen.lock().expect("recorder"))
    }
}

impl ChainListener for Recorder {
    fn on_new_best_tip(&self, hash: &Hash256) {
        self.seen.lock().expect("recorder").push(Seen::Tip(*hash));
    }

    fn on_new_transaction(&self, txid: &Hash256) {
        self.seen.lock().expect("recorder").push(Seen::Tx(*txid));
    }

    fn on_block_connected(&self, block: &Block) {
        self.seen
            .lock()
            .expect("recorder")
            .push(Seen::Connected(block.hash()));
    }

    fn on_block_disconnected(&self, block: &Block) {
        self.seen
            .lock()
            .expect("recorder")
            .push(Seen::Disconnected(block.hash()));
    }
}
