//! Hard-coded genesis blocks.

use beand_consensus::ConsensusParams;

use crate::block::{Block, BlockHeader};
use crate::outpoint::OutPoint;
use crate::transaction::{Transaction, TxIn, TxOut};

pub const GENESIS_TIMESTAMP: &str =
    "13 Feb 2015 - BitBean launches and changes the world with it's awesomeness";

/// Builds the genesis block for `params`. Its hash must equal `params.hash_genesis_block`.
pub fn genesis_block(params: &ConsensusParams) -> Block {
    // OP_0, push(42), push(timestamp)
    let mut script_sig = vec![0x00, 0x01, 0x2a];
    script_sig.push(GENESIS_TIMESTAMP.len() as u8);
    script_sig.extend_from_slice(GENESIS_TIMESTAMP.as_bytes());

    let coinbase = Transaction {
        version: 1,
        time: params.genesis_time,
        vin: vec![TxIn::new(OutPoint::null(), script_sig)],
        vout: vec![TxOut::empty()],
        lock_time: 0,
    };
    let mut block = Block {
        header: BlockHeader {
            version: 1,
            prev_block: [0u8; 32],
            merkle_root: [0u8; 32],
            time: params.genesis_time,
            bits: params.genesis_bits,
            nonce: params.genesis_nonce,
        },
        transactions: vec![coinbase],
        signature: Vec::new(),
    };
    block.header.merkle_root = block.compute_merkle_root().0;
    block
}
