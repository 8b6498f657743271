//! Block signatures.
//!
//! A proof-of-stake block is signed by the key paid in the coinstake's second output, which
//! must be pay-to-pubkey. A proof-of-work block whose coinbase pays a bare pubkey must be
//! signed by that key; otherwise, like genesis, it carries an empty signature. The signed
//! message is the block hash.

use std::sync::OnceLock;

use beand_primitives::Block;
use secp256k1::ecdsa::Signature;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey, SignOnly, VerifyOnly};

use crate::StakeError;

const OP_CHECKSIG: u8 = 0xac;

static SECP256K1_VERIFY: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
static SECP256K1_SIGN: OnceLock<Secp256k1<SignOnly>> = OnceLock::new();

fn secp256k1_verify() -> &'static Secp256k1<VerifyOnly> {
    SECP256K1_VERIFY.get_or_init(Secp256k1::verification_only)
}

fn secp256k1_sign() -> &'static Secp256k1<SignOnly> {
    SECP256K1_SIGN.get_or_init(Secp256k1::signing_only)
}

/// The pubkey of a `<pubkey> OP_CHECKSIG` script.
pub fn pay_to_pubkey_key(script: &[u8]) -> Option<&[u8]> {
    match script {
        [33, key @ .., OP_CHECKSIG] if key.len() == 33 => Some(key),
        [65, key @ .., OP_CHECKSIG] if key.len() == 65 => Some(key),
        _ => None,
    }
}

/// Key expected to sign `block`, or `None` when the block must be unsigned.
pub fn block_signer(block: &Block) -> Result<Option<&[u8]>, StakeError> {
    if block.header.prev_block == [0u8; 32] {
        return Ok(None);
    }
    if block.is_proof_of_stake() {
        let coinstake = &block.transactions[1];
        return pay_to_pubkey_key(&coinstake.vout[1].script_pubkey)
            .map(Some)
            .ok_or(StakeError::Signature("coinstake does not pay to a pubkey"));
    }
    Ok(block.transactions.first().and_then(|coinbase| {
        coinbase
            .vout
            .iter()
            .find_map(|out| pay_to_pubkey_key(&out.script_pubkey))
    }))
}

pub fn check_block_signature(block: &Block) -> Result<(), StakeError> {
    let Some(key) = block_signer(block)? else {
        if block.signature.is_empty() {
            return Ok(());
        }
        return Err(StakeError::Signature("unexpected block signature"));
    };
    if block.signature.is_empty() {
        return Err(StakeError::Signature("missing block signature"));
    }
    let pubkey =
        PublicKey::from_slice(key).map_err(|_| StakeError::Signature("invalid signer pubkey"))?;
    let mut signature = Signature::from_der(&block.signature)
        .map_err(|_| StakeError::Signature("malformed block signature"))?;
    signature.normalize_s();
    let message = Message::from_digest(block.hash());
    secp256k1_verify()
        .verify_ecdsa(&message, &signature, &pubkey)
        .map_err(|_| StakeError::Signature("block signature verification failed"))
}

/// Signs `block` in place with `secret`. The key must match the block's signer.
pub fn sign_block(block: &mut Block, secret: &[u8; 32]) -> Result<(), StakeError> {
    let secret =
        SecretKey::from_slice(secret).map_err(|_| StakeError::Signature("invalid secret key"))?;
    let message = Message::from_digest(block.hash());
    let signature = secp256k1_sign().sign_ecdsa(&message, &secret);
    block.signature = signature.serialize_der().to_vec();
    Ok(())
}

/// Compressed public key for `secret`.
pub fn public_key(secret: &[u8; 32]) -> Result<[u8; 33], StakeError> {
    let secret =
        SecretKey::from_slice(secret).map_err(|_| StakeError::Signature("invalid secret key"))?;
    Ok(PublicKey::from_secret_key(secp256k1_sign(), &secret).serialize())
}

/// Compact-DER signature over a 32-byte digest. Used for signed checkpoints.
pub fn sign_digest(digest: &[u8; 32], secret: &[u8; 32]) -> Result<Vec<u8>, StakeError> {
    let secret =
        SecretKey::from_slice(secret).map_err(|_| StakeError::Signature("invalid secret key"))?;
    let signature = secp256k1_sign().sign_ecdsa(&Message::from_digest(*digest), &secret);
    Ok(signature.serialize_der().to_vec())
}

pub fn verify_digest(digest: &[u8; 32], signature: &[u8], pubkey: &[u8]) -> bool {
    let Ok(pubkey) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut signature) = Signature::from_der(signature) else {
        return false;
    };
    signature.normalize_s();
    secp256k1_verify()
        .verify_ecdsa(&Message::from_digest(*digest), &signature, &pubkey)
        .is_ok()
}
