use beand_primitives::outpoint::OutPoint;
use beand_primitives::transaction::Transaction;
use beand_primitives::{TxIn, TxOut};
use beand_script::sighash::{
    signature_hash, SighashType, SIGHASH_ALL, SIGHASH_ANYONECANPAY, SIGHASH_NONE, SIGHASH_SINGLE,
};

fn spend() -> Transaction {
    Transaction {
        version: 1,
        time: 1_420_000_000,
        vin: vec![
            TxIn::new(OutPoint::new([7u8; 32], 1), Vec::new()),
            TxIn::new(OutPoint::new([8u8; 32], 0), Vec::new()),
        ],
        vout: vec![
            TxOut {
                value: 10_000,
                script_pubkey: vec![0x51],
            },
            TxOut {
                value: 20_000,
                script_pubkey: vec![0x52],
            },
        ],
        lock_time: 0,
    }
}

#[test]
fn type_byte_splits_into_base_and_anyone_can_pay() {
    let single = SighashType(SIGHASH_SINGLE | SIGHASH_ANYONECANPAY);
    assert_eq!(single.base_type(), SIGHASH_SINGLE);
    assert!(single.has_anyone_can_pay());
    assert!(!SighashType(SIGHASH_NONE).has_anyone_can_pay());
}

#[test]
fn anyone_can_pay_ignores_other_inputs() {
    let tx = spend();
    let mut extra = tx.clone();
    extra.vin[1].prevout = OutPoint::new([9u8; 32], 4);
    let kind = SighashType(SIGHASH_ALL | SIGHASH_ANYONECANPAY);
    assert_eq!(
        signature_hash(&tx, 0, &[0x51], kind),
        signature_hash(&extra, 0, &[0x51], kind)
    );
    assert_ne!(
        signature_hash(&tx, 0, &[0x51], SighashType(SIGHASH_ALL)),
        signature_hash(&extra, 0, &[0x51], SighashType(SIGHASH_ALL))
    );
}

#[test]
fn none_leaves_outputs_open() {
    let tx = spend();
    let mut redirected = tx.clone();
    redirected.vout[1].value = 1;
    let kind = SighashType(SIGHASH_NONE);
    assert_eq!(
        signature_hash(&tx, 0, &[0x51], kind),
        signature_hash(&redirected, 0, &[0x51], kind)
    );
}

#[test]
fn single_commits_only_to_its_own_output() {
    let tx = spend();
    let mut changed = tx.clone();
    changed.vout[1].value = 1;
    let kind = SighashType(SIGHASH_SINGLE);
    assert_eq!(
        signature_hash(&tx, 0, &[0x51], kind),
        signature_hash(&changed, 0, &[0x51], kind)
    );
    assert_ne!(
        signature_hash(&tx, 1, &[0x51], kind),
        signature_hash(&changed, 1, &[0x51], kind)
    );
}
