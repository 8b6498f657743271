//! Stake modifier chaining.
//!
//! Every block carries a modifier derived from its parent's modifier and a source that
//! cannot be ground cheaply: the staked outpoint's txid for proof-of-stake blocks and the
//! block hash for proof-of-work blocks. Genesis starts the chain at zero.

use beand_consensus::Hash256;
use beand_primitives::hash::sha256d;
use beand_primitives::Block;

pub const GENESIS_STAKE_MODIFIER: Hash256 = [0u8; 32];

pub fn kernel_source(block: &Block) -> Hash256 {
    match block.proof_of_stake() {
        Some((prevout, _)) => prevout.hash,
        None => block.hash(),
    }
}

pub fn next_stake_modifier(prev_modifier: &Hash256, source: &Hash256) -> Hash256 {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(source);
    preimage[32..].copy_from_slice(prev_modifier);
    sha256d(&preimage)
}

/// Modifier of `block`, given the modifier of its parent.
pub fn block_stake_modifier(block: &Block, prev_modifier: &Hash256) -> Hash256 {
    if block.header.prev_block == [0u8; 32] {
        return GENESIS_STAKE_MODIFIER;
    }
    next_stake_modifier(prev_modifier, &kernel_source(block))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_consensus::{consensus_params, Network};
    use beand_primitives::genesis_block;

    #[test]
    fn genesis_modifier_is_zero() {
        let genesis = genesis_block(&consensus_params(Network::Regtest));
        assert_eq!(block_stake_modifier(&genesis, &[7u8; 32]), GENESIS_STAKE_MODIFIER);
    }

    #[test]
    fn modifier_chains_through_parent() {
        let a = next_stake_modifier(&[1u8; 32], &[2u8; 32]);
        let b = next_stake_modifier(&[9u8; 32], &[2u8; 32]);
        assert_ne!(a, b);
        assert_eq!(a, next_stake_modifier(&[1u8; 32], &[2u8; 32]));
    }

    #[test]
    fn work_block_source_is_its_hash() {
        let mut block = genesis_block(&consensus_params(Network::Regtest));
        block.header.prev_block = [5u8; 32];
        assert_eq!(kernel_source(&block), block.hash());
    }
}
