//! Consensus constants, per-network parameters and checkpoint policy.

pub mod checkpoints;
pub mod constants;
pub mod money;
pub mod params;

pub use checkpoints::{Checkpoint, CheckpointMode};
pub use params::{
    bytes_from_hex, chain_params, consensus_params, hash256_from_hex, hash256_to_hex,
    select_network, Base58Prefixes, ChainParams, ConsensusParams, Network, NetworkSelectError,
};

/// 32-byte hash in internal (little-endian) byte order.
pub type Hash256 = [u8; 32];
