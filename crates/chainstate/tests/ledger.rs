mod common;

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use beand_chainstate::import::import_file;
use beand_chainstate::state::{ChainState, ChainStateConfig, ChainStateError};
use beand_chainstate::{Acceptance, RejectKind};
use beand_consensus::CheckpointMode;
use beand_primitives::{genesis_block, OutPoint};
use beand_storage::memory::MemoryStore;

use common::*;

#[test]
fn double_spends_are_rejected_in_every_arrangement() {
    let node = Node::regtest();
    let b1 = build_block(&node.params, node.genesis.hash(), 1, 1, Vec::new());
    node.submit(&b1).expect("b1");
    let coin = coinbase_outpoint(&b1);
    let time = block_time(&node.params, 2, 0);

    let twice_in_one_tx = spend(&[coin.clone(), coin.clone()], REWARD, time);
    let block = build_block(&node.params, b1.hash(), 2, 1, vec![twice_in_one_tx]);
    assert_eq!(
        node.submit(&block).expect_err("same input twice").kind,
        RejectKind::DuplicateOrMissingInput
    );

    let first = spend(&[coin.clone()], REWARD - 10, time);
    let second = spend(&[coin.clone()], REWARD - 20, time);
    let block = build_block(&node.params, b1.hash(), 2, 2, vec![first.clone(), second.clone()]);
    assert_eq!(
        node.submit(&block).expect_err("two spenders in one block").kind,
        RejectKind::DuplicateOrMissingInput
    );

    let creator = spend(&[coin.clone()], REWARD - 10, time);
    let premature = spend(&[OutPoint::new(creator.txid(), 0)], REWARD - 20, time);
    let block = build_block(&node.params, b1.hash(), 2, 3, vec![premature, creator]);
    assert_eq!(
        node.submit(&block).expect_err("spend before create").kind,
        RejectKind::DuplicateOrMissingInput
    );

    let b2 = build_block(&node.params, b1.hash(), 2, 4, vec![first.clone()]);
    node.submit(&b2).expect("single spend");
    let b3 = build_block(&node.params, b2.hash(), 3, 4, vec![second]);
    assert_eq!(
        node.submit(&b3).expect_err("spent in earlier block").kind,
        RejectKind::DuplicateOrMissingInput
    );
    assert_eq!(node.tip(), b2.hash());
    assert!(node.chain.utxo(&coin).expect("utxo").is_none());
    assert!(node
        .chain
        .utxo(&OutPoint::new(first.txid(), 0))
        .expect("utxo")
        .is_some());
}

#[test]
fn competing_branches_each_spend_once() {
    let node = Node::regtest();
    let b1 = build_block(&node.params, node.genesis.hash(), 1, 1, Vec::new());
    node.submit(&b1).expect("b1");
    let coin = coinbase_outpoint(&b1);
    let left = spend(&[coin.clone()], REWARD - 10, block_time(&node.params, 2, 0));
    let right = spend(&[coin.clone()], REWARD - 30, block_time(&node.params, 2, 0));

    let l2 = build_block(&node.params, b1.hash(), 2, 1, vec![left.clone()]);
    let r2 = build_block(&node.params, b1.hash(), 2, 2, vec![right.clone()]);
    let r3 = build_block(&node.params, r2.hash(), 3, 2, Vec::new());
    node.submit(&l2).expect("left");
    node.submit(&r2).expect("right, inactive");
    node.submit(&r3).expect("right wins");

    assert_eq!(node.tip(), r3.hash());
    assert!(node.chain.utxo(&OutPoint::new(left.txid(), 0)).expect("utxo").is_none());
    assert!(node.chain.utxo(&OutPoint::new(right.txid(), 0)).expect("utxo").is_some());
    assert!(node.chain.utxo(&coin).expect("utxo").is_none());
}

#[test]
fn immature_coinbase_cannot_be_spent() {
    let mut params = regtest_params();
    params.consensus.coinbase_maturity = 3;
    let node = Node::start(params, CheckpointMode::Strict);
    let b1 = build_block(&node.params, node.genesis.hash(), 1, 1, Vec::new());
    node.submit(&b1).expect("b1");
    let early = spend(&[coinbase_outpoint(&b1)], REWARD, block_time(&node.params, 2, 0));
    let b2 = build_block(&node.params, b1.hash(), 2, 1, vec![early]);
    assert_eq!(
        node.submit(&b2).expect_err("immature").kind,
        RejectKind::ImmatureSpend
    );
}

#[test]
fn mempool_admits_evicts_and_readmits() {
    let node = Node::regtest();
    let recorder = Arc::new(Recorder::default());
    node.chain.add_listener(recorder.clone());
    let b1 = build_block(&node.params, node.genesis.hash(), 1, 1, Vec::new());
    node.submit(&b1).expect("b1");
    recorder.take();

    let coin = coinbase_outpoint(&b1);
    let pay = spend(&[coin.clone()], REWARD - 5_000, block_time(&node.params, 2, 0));
    let txid = pay.txid();
    let bytes = pay.consensus_encode_vec();
    assert_eq!(node.chain.submit_transaction(&bytes), Ok(Acceptance::Accepted(txid)));
    assert_eq!(node.chain.submit_transaction(&bytes), Ok(Acceptance::AlreadyKnown(txid)));
    assert_eq!(recorder.take(), vec![Seen::Tx(txid)]);

    let conflict = spend(&[coin.clone()], REWARD - 9_000, block_time(&node.params, 2, 0));
    assert_eq!(
        node.chain
            .submit_transaction(&conflict.consensus_encode_vec())
            .expect_err("conflict")
            .kind,
        RejectKind::DuplicateOrMissingInput
    );
    let unknown = spend(&[OutPoint::new([9u8; 32], 0)], 1, block_time(&node.params, 2, 0));
    assert_eq!(
        node.chain
            .submit_transaction(&unknown.consensus_encode_vec())
            .expect_err("missing")
            .kind,
        RejectKind::DuplicateOrMissingInput
    );
    assert_eq!(
        node.chain
            .submit_transaction(&b1.transactions[0].consensus_encode_vec())
            .expect_err("coinbase")
            .kind,
        RejectKind::MalformedEncoding
    );
    let pooled = node.chain.mempool_transactions().expect("pool");
    assert_eq!(pooled.len(), 1);
    assert_eq!(pooled[0].1, 5_000);

    let b2 = build_block(&node.params, b1.hash(), 2, 1, vec![pay.clone()]);
    node.submit(&b2).expect("b2");
    assert!(!node.chain.mempool_contains(&txid).expect("pool"));
    // Confirmed now; resubmitting it is still a no-op.
    assert_eq!(node.chain.submit_transaction(&bytes), Ok(Acceptance::AlreadyKnown(txid)));
    assert!(!node.chain.mempool_contains(&txid).expect("pool"));
    assert!(recorder.take().iter().all(|seen| !matches!(seen, Seen::Tx(_))));

    let fork = build_chain(&node.params, b1.hash(), 2, 2, 6);
    for block in &fork {
        node.submit(block).expect("fork");
    }
    assert_eq!(node.tip(), fork[1].hash());
    assert!(node.chain.mempool_contains(&txid).expect("pool"));
}

#[test]
fn state_survives_reopen() {
    let node = Node::regtest();
    let chain = build_chain(&node.params, node.genesis.hash(), 1, 3, 1);
    let side = build_block(&node.params, chain[0].hash(), 2, 8, Vec::new());
    for block in &chain {
        node.submit(block).expect("chain");
    }
    node.submit(&side).expect("side");
    let stats = node.chain.utxo_stats().expect("stats");

    let Node {
        chain: state,
        store,
        params,
        dir,
        ..
    } = node;
    drop(state);
    let reopened = ChainState::open(
        Arc::clone(&store),
        params.clone(),
        dir.path(),
        ChainStateConfig::default(),
    )
    .expect("reopen");
    let tip = reopened.best_tip().expect("tip");
    assert_eq!(tip.hash, chain[2].hash());
    assert_eq!(tip.height, 3);
    assert_eq!(reopened.utxo_stats().expect("stats"), stats);
    let info = reopened.block_info(&side.hash()).expect("info").expect("side");
    assert!(!info.is_active);
    assert_eq!(
        reopened.read_block_by_hash(&chain[1].hash()).expect("read"),
        Some(chain[1].clone())
    );
    reopened.verify_chain(4, 0).expect("verify");

    let next = build_block(&params, chain[2].hash(), 4, 1, Vec::new());
    assert_eq!(
        reopened.submit_block(&next.consensus_encode_vec()),
        Ok(Acceptance::Accepted(next.hash()))
    );
}

#[test]
fn genesis_mismatch_aborts_open() {
    let mut params = regtest_params();
    params.consensus.hash_genesis_block = [1u8; 32];
    let dir = tempfile::tempdir().expect("tempdir");
    let result = ChainState::open(
        Arc::new(MemoryStore::new()),
        params,
        dir.path(),
        ChainStateConfig::default(),
    );
    assert!(matches!(result, Err(ChainStateError::GenesisMismatch { .. })));

    let node = Node::regtest();
    let Node { chain, store, dir, .. } = node;
    drop(chain);
    let mut other = regtest_params();
    other.consensus.genesis_time += 1;
    other.consensus.hash_genesis_block = genesis_block(&other.consensus).hash();
    let result = ChainState::open(store, other, dir.path(), ChainStateConfig::default());
    assert!(matches!(result, Err(ChainStateError::GenesisMismatch { .. })));
}

#[test]
fn block_files_import_into_a_fresh_node() {
    let source = Node::regtest();
    let chain = build_chain(&source.params, source.genesis.hash(), 1, 4, 1);
    for block in chain.iter().rev() {
        let _ = source.submit(block);
    }
    assert_eq!(source.tip(), chain[3].hash());

    let target = Node::regtest();
    let path = source.dir.path().join("blk00000.dat");
    let stats = import_file(
        &path,
        target.params.message_start,
        &AtomicBool::new(false),
        |bytes| target.chain.submit_block(bytes),
    )
    .expect("import");
    assert_eq!(stats.records, 5);
    assert_eq!(stats.already_known, 1);
    assert_eq!(target.tip(), chain[3].hash());
}

#[test]
fn block_tree_lists_branches() {
    let node = Node::regtest();
    let main = build_chain(&node.params, node.genesis.hash(), 1, 2, 1);
    let side = build_block(&node.params, node.genesis.hash(), 1, 2, Vec::new());
    for block in main.iter().chain(std::iter::once(&side)) {
        node.submit(block).expect("submit");
    }
    let tree = node.chain.block_tree().expect("tree");
    assert_eq!(tree.lines().count(), 4);
    assert!(tree.contains("active"));
    assert!(tree.contains("valid"));

    let prefix = &beand_consensus::hash256_to_hex(&side.hash())[..12];
    assert_eq!(
        node.chain.find_blocks_by_prefix(prefix).expect("find"),
        vec![side.hash()]
    );
}
