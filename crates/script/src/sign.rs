//! Producing `scriptSig`s for pay-to-pubkey and pay-to-pubkey-hash outputs.

use beand_primitives::hash::hash160;
use beand_primitives::transaction::Transaction;
use secp256k1::{Message, PublicKey, SecretKey};

use crate::secp::secp256k1_sign;
use crate::sighash::{signature_hash, SighashError, SighashType};
use crate::standard::{classify_script_pubkey, push_data, ScriptType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignError {
    InvalidSecretKey,
    /// The output is not paid to this key.
    KeyMismatch,
    UnsupportedScript,
    Sighash(SighashError),
}

impl std::fmt::Display for SignError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignError::InvalidSecretKey => write!(f, "invalid secret key"),
            SignError::KeyMismatch => write!(f, "output is not paid to the signing key"),
            SignError::UnsupportedScript => write!(f, "cannot sign for this script type"),
            SignError::Sighash(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for SignError {}

impl From<SighashError> for SignError {
    fn from(err: SighashError) -> Self {
        SignError::Sighash(err)
    }
}

/// Fills `tx.vin[input_index].script_sig` so it satisfies `script_pubkey`.
pub fn sign_input(
    tx: &mut Transaction,
    input_index: usize,
    script_pubkey: &[u8],
    secret: &[u8; 32],
    sighash_type: SighashType,
) -> Result<(), SignError> {
    let secret = SecretKey::from_slice(secret).map_err(|_| SignError::InvalidSecretKey)?;
    let pubkey = PublicKey::from_secret_key(secp256k1_sign(), &secret);
    let compressed = pubkey.serialize();
    let uncompressed = pubkey.serialize_uncompressed();

    let script_type = classify_script_pubkey(script_pubkey);
    let key_bytes: &[u8] = match script_type {
        ScriptType::P2Pk => {
            let key = &script_pubkey[1..script_pubkey.len() - 1];
            if key != compressed.as_slice() && key != uncompressed.as_slice() {
                return Err(SignError::KeyMismatch);
            }
            key
        }
        ScriptType::P2Pkh => {
            let hash = &script_pubkey[3..23];
            if hash == hash160(&compressed).as_slice() {
                &compressed
            } else if hash == hash160(&uncompressed).as_slice() {
                &uncompressed
            } else {
                return Err(SignError::KeyMismatch);
            }
        }
        _ => return Err(SignError::UnsupportedScript),
    };

    let sighash = signature_hash(tx, input_index, script_pubkey, sighash_type)?;
    let signature = secp256k1_sign().sign_ecdsa(&Message::from_digest(sighash), &secret);
    let mut sig_bytes = signature.serialize_der().to_vec();
    sig_bytes.push(sighash_type.0 as u8);

    let mut script_sig = push_data(&sig_bytes);
    if script_type == ScriptType::P2Pkh {
        script_sig.extend_from_slice(&push_data(key_bytes));
    }
    tx.vin[input_index].script_sig = script_sig;
    Ok(())
}
