//! Per-network chain and consensus parameters.
//!
//! Each network is one immutable value built by its own constructor; nothing is derived
//! from another network at runtime.

use std::fmt;

use crate::checkpoints::Checkpoint;
use crate::money::{Amount, CENT, COIN};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "main",
            Network::Testnet => "test",
            Network::Regtest => "regtest",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum NetworkSelectError {
    TestnetAndRegtest,
}

impl fmt::Display for NetworkSelectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkSelectError::TestnetAndRegtest => {
                write!(f, "invalid combination of -testnet and -regtest")
            }
        }
    }
}

impl std::error::Error for NetworkSelectError {}

/// Maps the two startup switches onto a network; both at once is an error.
pub fn select_network(testnet: bool, regtest: bool) -> Result<Network, NetworkSelectError> {
    match (testnet, regtest) {
        (true, true) => Err(NetworkSelectError::TestnetAndRegtest),
        (true, false) => Ok(Network::Testnet),
        (false, true) => Ok(Network::Regtest),
        (false, false) => Ok(Network::Mainnet),
    }
}

#[derive(Clone, Debug)]
pub struct ConsensusParams {
    pub network: Network,
    pub hash_genesis_block: Hash256,
    pub genesis_time: u32,
    pub genesis_bits: u32,
    pub genesis_nonce: u32,
    pub pow_limit: Hash256,
    /// Easiest stake target; the kernel target is this scaled by coin-day weight.
    pub pos_limit: Hash256,
    pub target_spacing: i64,
    pub target_timespan: i64,
    /// Regtest keeps every block at the limit.
    pub no_retargeting: bool,
    /// Confirmations before coinbase and coinstake outputs may be spent.
    pub coinbase_maturity: i32,
    pub stake_min_age: u32,
    pub stake_max_age: u32,
    /// Highest height at which a proof-of-work block is accepted.
    pub last_pow_block: i32,
    pub pow_subsidy: Amount,
    pub stake_base_reward: Amount,
    /// Interest paid per coin-year of consumed coin age.
    pub coin_year_reward: Amount,
    /// Compressed secp256k1 key that signs checkpoints.
    pub checkpoint_pubkey: Vec<u8>,
    pub checkpoints: Vec<Checkpoint>,
}

impl ConsensusParams {
    pub fn retarget_interval(&self) -> i64 {
        self.target_timespan / self.target_spacing
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Base58Prefixes {
    pub pubkey_address: u8,
    pub script_address: u8,
    pub secret_key: u8,
}

#[derive(Clone, Debug)]
pub struct ChainParams {
    pub network: Network,
    pub consensus: ConsensusParams,
    pub message_start: [u8; 4],
    pub default_port: u16,
    pub rpc_port: u16,
    pub base58: Base58Prefixes,
    /// Subdirectory of the data directory, `None` for mainnet.
    pub data_dir_suffix: Option<&'static str>,
    pub dns_seeds: &'static [&'static str],
}

#[derive(Debug)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash hex has invalid length"),
            HexError::InvalidHex => write!(f, "hash hex has invalid characters"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses display-order hex (as printed by explorers) into internal byte order.
/// Short input is left padded with zeros.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.is_empty() || hex.len() > 64 {
        return Err(HexError::InvalidLength);
    }
    let padded = format!("{hex:0>64}");

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let digits = padded
            .get(i * 2..i * 2 + 2)
            .ok_or(HexError::InvalidHex)?;
        *byte_out = u8::from_str_radix(digits, 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

/// Plain (non-reversed) hex to bytes.
pub fn bytes_from_hex(input: &str) -> Result<Vec<u8>, HexError> {
    let hex = input.trim();
    if hex.len() % 2 != 0 {
        return Err(HexError::InvalidLength);
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .and_then(|digits| u8::from_str_radix(digits, 16).ok())
                .ok_or(HexError::InvalidHex)
        })
        .collect()
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

pub fn consensus_params(network: Network) -> ConsensusParams {
    match network {
        Network::Mainnet => mainnet_consensus_params(),
        Network::Testnet => testnet_consensus_params(),
        Network::Regtest => regtest_consensus_params(),
    }
}

pub fn chain_params(network: Network) -> ChainParams {
    match network {
        Network::Mainnet => mainnet_chain_params(),
        Network::Testnet => testnet_chain_params(),
        Network::Regtest => regtest_chain_params(),
    }
}

const GENESIS_TIME: u32 = 1_423_862_862;
const MAINNET_CHECKPOINT_PUBKEY: &str =
    "020dd8d110163315b5ed74293dcb6a69fc4a2ed0e549af37f69d4ecf99e1a21f40";
const TESTNET_CHECKPOINT_PUBKEY: &str =
    "029ce30d356cdbee7553659bdd7a0bea8088791dd57c2ae7c04d28dcdd3b786861";

fn mainnet_consensus_params() -> ConsensusParams {
    let hash_genesis_block = hash256_from_hex(
        "000009d2f828234d65299216e258242a4ea75d1b8d8a71d076377145068f08de",
    )
    .expect("mainnet genesis hash");
    let pow_limit = hash256_from_hex(
        "00000fffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
    )
    .expect("mainnet pow limit");
    ConsensusParams {
        network: Network::Mainnet,
        hash_genesis_block,
        genesis_time: GENESIS_TIME,
        genesis_bits: 0x1e0f_ffff,
        genesis_nonce: 620_091,
        pow_limit,
        pos_limit: pow_limit,
        target_spacing: 60,
        target_timespan: 20 * 60,
        no_retargeting: false,
        coinbase_maturity: 500,
        stake_min_age: 8 * 60 * 60,
        stake_max_age: 90 * 24 * 60 * 60,
        last_pow_block: 10_000,
        pow_subsidy: 1_000 * COIN,
        stake_base_reward: COIN,
        coin_year_reward: 10 * CENT,
        checkpoint_pubkey: bytes_from_hex(MAINNET_CHECKPOINT_PUBKEY)
            .expect("mainnet checkpoint key"),
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash_genesis_block,
        }],
    }
}

fn testnet_consensus_params() -> ConsensusParams {
    let hash_genesis_block = hash256_from_hex(
        "0000021cddf3e66033819044559ebf09acdb95dd79b1743d367d03224e10674b",
    )
    .expect("testnet genesis hash");
    let pow_limit = hash256_from_hex(
        "0000ffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
    )
    .expect("testnet pow limit");
    ConsensusParams {
        network: Network::Testnet,
        hash_genesis_block,
        genesis_time: GENESIS_TIME,
        genesis_bits: 0x1f00_ffff,
        genesis_nonce: 98_938,
        pow_limit,
        pos_limit: pow_limit,
        target_spacing: 60,
        target_timespan: 20 * 60,
        no_retargeting: false,
        coinbase_maturity: 500,
        stake_min_age: 8 * 60 * 60,
        stake_max_age: 90 * 24 * 60 * 60,
        last_pow_block: i32::MAX,
        pow_subsidy: 1_000 * COIN,
        stake_base_reward: COIN,
        coin_year_reward: 10 * CENT,
        checkpoint_pubkey: bytes_from_hex(TESTNET_CHECKPOINT_PUBKEY)
            .expect("testnet checkpoint key"),
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash_genesis_block,
        }],
    }
}

fn regtest_consensus_params() -> ConsensusParams {
    let hash_genesis_block = hash256_from_hex(
        "99912ff50ce95c6c611c3f2e5ccbee9b7bf41db8f8250bc127359ee228876798",
    )
    .expect("regtest genesis hash");
    let pow_limit = hash256_from_hex(
        "7fffffffffffffffffffffffffffffffffffffffffffffffffffffffffffffff",
    )
    .expect("regtest pow limit");
    ConsensusParams {
        network: Network::Regtest,
        hash_genesis_block,
        genesis_time: GENESIS_TIME,
        genesis_bits: 0x207f_ffff,
        genesis_nonce: 2,
        pow_limit,
        pos_limit: pow_limit,
        target_spacing: 60,
        target_timespan: 20 * 60,
        no_retargeting: true,
        coinbase_maturity: 10,
        stake_min_age: 60,
        stake_max_age: 90 * 24 * 60 * 60,
        last_pow_block: i32::MAX,
        pow_subsidy: 1_000 * COIN,
        stake_base_reward: COIN,
        coin_year_reward: 10 * CENT,
        checkpoint_pubkey: bytes_from_hex(TESTNET_CHECKPOINT_PUBKEY)
            .expect("testnet checkpoint key"),
        checkpoints: vec![Checkpoint {
            height: 0,
            hash: hash_genesis_block,
        }],
    }
}

fn mainnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Mainnet,
        consensus: mainnet_consensus_params(),
        message_start: [0xa4, 0xd2, 0xf8, 0xa6],
        default_port: 22460,
        rpc_port: 22461,
        base58: Base58Prefixes {
            pubkey_address: 3,
            script_address: 85,
            secret_key: 131,
        },
        data_dir_suffix: None,
        dns_seeds: &[
            "stalk1.bitbean.org",
            "stalk2.bitbean.org",
            "stalk3.bitbean.org",
            "stalk1.beancash.org",
            "stalk2.beancash.org",
            "stalk3.beancash.org",
        ],
    }
}

fn testnet_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Testnet,
        consensus: testnet_consensus_params(),
        message_start: [0xad, 0xf1, 0xc2, 0xaf],
        default_port: 22462,
        rpc_port: 22463,
        base58: Base58Prefixes {
            pubkey_address: 111,
            script_address: 196,
            secret_key: 239,
        },
        data_dir_suffix: Some("testnet2"),
        dns_seeds: &["stalk1.beancash.net", "stalk2.beancash.net"],
    }
}

fn regtest_chain_params() -> ChainParams {
    ChainParams {
        network: Network::Regtest,
        consensus: regtest_consensus_params(),
        message_start: [0xfa, 0xbf, 0xb5, 0xda],
        default_port: 18444,
        rpc_port: 22463,
        base58: Base58Prefixes {
            pubkey_address: 111,
            script_address: 196,
            secret_key: 239,
        },
        data_dir_suffix: Some("regtest"),
        dns_seeds: &[],
    }
}
