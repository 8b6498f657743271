use beand_primitives::outpoint::OutPoint;
use beand_primitives::{p2pk_script, Transaction, TxIn, TxOut};
use beand_primitives::address::pubkey_to_p2pkh_script;
use beand_script::interpreter::{
    verify_script, ScriptError, BLOCK_SCRIPT_VERIFY_FLAGS, STANDARD_SCRIPT_VERIFY_FLAGS,
};
use beand_script::sighash::{SighashType, SIGHASH_ALL};
use beand_script::sign::{sign_input, SignError};
use secp256k1::{PublicKey, Secp256k1, SecretKey};

const SECRET: [u8; 32] = [0x3c; 32];

fn compressed_pubkey(secret: &[u8; 32]) -> Vec<u8> {
    let secp = Secp256k1::new();
    let key = SecretKey::from_slice(secret).expect("secret");
    PublicKey::from_secret_key(&secp, &key).serialize().to_vec()
}

fn spending_tx() -> Transaction {
    Transaction {
        version: 1,
        time: 1_600_000_000,
        vin: vec![TxIn::new(OutPoint::new([0xaa; 32], 1), Vec::new())],
        vout: vec![TxOut {
            value: 10_000,
            script_pubkey: vec![0x51],
        }],
        lock_time: 0,
    }
}

#[test]
fn pay_to_pubkey_hash_spend_verifies() {
    let script_pubkey = pubkey_to_p2pkh_script(&compressed_pubkey(&SECRET));
    let mut tx = spending_tx();
    sign_input(&mut tx, 0, &script_pubkey, &SECRET, SighashType(SIGHASH_ALL)).expect("sign");
    let script_sig = tx.vin[0].script_sig.clone();
    verify_script(&script_sig, &script_pubkey, &tx, 0, STANDARD_SCRIPT_VERIFY_FLAGS)
        .expect("valid spend");

    let mut tampered = tx.clone();
    tampered.vout[0].value += 1;
    assert!(matches!(
        verify_script(&script_sig, &script_pubkey, &tampered, 0, BLOCK_SCRIPT_VERIFY_FLAGS),
        Err(ScriptError::EvalFalse)
    ));
}

#[test]
fn pay_to_pubkey_spend_commits_to_time() {
    let script_pubkey = p2pk_script(&compressed_pubkey(&SECRET));
    let mut tx = spending_tx();
    sign_input(&mut tx, 0, &script_pubkey, &SECRET, SighashType(SIGHASH_ALL)).expect("sign");
    let script_sig = tx.vin[0].script_sig.clone();
    verify_script(&script_sig, &script_pubkey, &tx, 0, BLOCK_SCRIPT_VERIFY_FLAGS)
        .expect("valid spend");

    let mut retimed = tx.clone();
    retimed.time += 60;
    assert!(verify_script(&script_sig, &script_pubkey, &retimed, 0, BLOCK_SCRIPT_VERIFY_FLAGS)
        .is_err());
}

#[test]
fn signing_for_someone_else_fails() {
    let script_pubkey = pubkey_to_p2pkh_script(&compressed_pubkey(&[0x4d; 32]));
    let mut tx = spending_tx();
    assert_eq!(
        sign_input(&mut tx, 0, &script_pubkey, &SECRET, SighashType(SIGHASH_ALL)),
        Err(SignError::KeyMismatch)
    );
}

#[test]
fn arithmetic_puzzle() {
    let tx = spending_tx();
    // 2 3 ADD 5 NUMEQUAL
    let script_pubkey = [0x93, 0x55, 0x9c];
    verify_script(&[0x52, 0x53], &script_pubkey, &tx, 0, BLOCK_SCRIPT_VERIFY_FLAGS)
        .expect("2 + 3 = 5");
    assert!(verify_script(&[0x52, 0x52], &script_pubkey, &tx, 0, BLOCK_SCRIPT_VERIFY_FLAGS)
        .is_err());
}
