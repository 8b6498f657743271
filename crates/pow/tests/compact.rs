use beand_consensus::{consensus_params, Network};
use beand_pow::difficulty::{compact_to_target, hash_meets_target, target_to_compact};
use beand_pow::validation::{check_proof_of_work, PowError};
use beand_primitives::genesis_block;

#[test]
fn compact_to_target_roundtrip() {
    for bits in [0x1d00_ffffu32, 0x1e0f_ffff, 0x1f00_ffff, 0x207f_ffff] {
        let target = compact_to_target(bits).expect("target");
        assert_eq!(target_to_compact(&target), bits);
    }
}

#[test]
fn compact_target_layout() {
    let target = compact_to_target(0x207f_ffff).expect("target");
    assert!(target[..29].iter().all(|b| *b == 0));
    assert_eq!(target[29..], [0xff, 0xff, 0x7f]);
}

#[test]
fn hash_meets_target_cmp() {
    let target = [0x10u8; 32];
    assert!(hash_meets_target(&[0x00u8; 32], &target));
    assert!(!hash_meets_target(&[0xffu8; 32], &target));
}

#[test]
fn mainnet_and_testnet_genesis_satisfy_their_work() {
    for network in [Network::Mainnet, Network::Testnet] {
        let params = consensus_params(network);
        let genesis = genesis_block(&params);
        check_proof_of_work(&genesis.hash(), genesis.header.bits, &params).expect("genesis pow");
    }
}

#[test]
fn rejects_target_easier_than_limit() {
    let params = consensus_params(Network::Mainnet);
    let err = check_proof_of_work(&[0u8; 32], 0x207f_ffff, &params).unwrap_err();
    assert_eq!(err, PowError::InvalidBits("pow target above limit"));

    let err = check_proof_of_work(&[0xffu8; 32], 0x1e0f_ffff, &params).unwrap_err();
    assert_eq!(err, PowError::HashAboveTarget);
}
