//! Core block/transaction types and consensus serialization.

pub mod address;
pub mod block;
pub mod encoding;
pub mod genesis;
pub mod hash;
pub mod merkle;
pub mod outpoint;
pub mod transaction;

pub use address::{
    address_to_script_pubkey, p2pk_script, p2pkh_script, script_pubkey_to_address,
    secret_key_to_wif, wif_to_secret_key, AddressError,
};
pub use block::{Block, BlockHeader};
pub use encoding::{decode, encode, DecodeError};
pub use genesis::genesis_block;
pub use hash::{hash160, sha256, sha256d};
pub use outpoint::OutPoint;
pub use transaction::{Transaction, TxIn, TxOut};
