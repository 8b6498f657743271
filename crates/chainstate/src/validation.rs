//! Block and transaction validation.
//!
//! Stateless checks look at a block in isolation. Contextual checks need the parent chain:
//! the expected difficulty, the median time past and the ledger the block spends from.

use std::collections::HashSet;
use std::fmt;

use beand_consensus::constants::{
    MAX_BLOCK_SIGOPS, MAX_BLOCK_SIZE, MAX_COINBASE_SCRIPT_LEN, MAX_FUTURE_BLOCK_TIME,
    MAX_SCRIPT_SIZE, MAX_TX_SIZE, MIN_BLOCK_VERSION, MIN_COINBASE_SCRIPT_LEN,
};
use beand_consensus::money::{checked_money_add, money_range, Amount};
use beand_consensus::{hash256_to_hex, ConsensusParams};
use beand_pow::validation::{check_proof_of_work, PowError};
use beand_primitives::block::Block;
use beand_primitives::encoding::DecodeError;
use beand_primitives::outpoint::OutPoint;
use beand_primitives::transaction::Transaction;
use beand_script::interpreter::{verify_script, ScriptError, ScriptFlags};
use beand_script::standard::sigop_count;
use beand_stake::signature::check_block_signature;
use beand_stake::StakeError;
use rayon::prelude::*;

use crate::checkpoints::CheckpointError;
use crate::utxo::UtxoEntry;

/// Why a block or transaction was refused.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RejectKind {
    MalformedEncoding,
    ProofOfWorkOrStakeInvalid,
    TimestampOutOfRange,
    OversizeBlockOrTx,
    DuplicateOrMissingInput,
    InsufficientInputValue,
    ImmatureSpend,
    CheckpointViolation,
    UnknownParent,
    StorageFailure,
}

impl RejectKind {
    pub fn as_str(self) -> &'static str {
        match self {
            RejectKind::MalformedEncoding => "malformed-encoding",
            RejectKind::ProofOfWorkOrStakeInvalid => "proof-of-work-or-stake-invalid",
            RejectKind::TimestampOutOfRange => "timestamp-out-of-range",
            RejectKind::OversizeBlockOrTx => "oversize-block-or-tx",
            RejectKind::DuplicateOrMissingInput => "duplicate-or-missing-input",
            RejectKind::InsufficientInputValue => "insufficient-input-value",
            RejectKind::ImmatureSpend => "immature-spend",
            RejectKind::CheckpointViolation => "checkpoint-violation",
            RejectKind::UnknownParent => "unknown-parent",
            RejectKind::StorageFailure => "storage-failure",
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            RejectKind::MalformedEncoding => 1,
            RejectKind::ProofOfWorkOrStakeInvalid => 2,
            RejectKind::TimestampOutOfRange => 3,
            RejectKind::OversizeBlockOrTx => 4,
            RejectKind::DuplicateOrMissingInput => 5,
            RejectKind::InsufficientInputValue => 6,
            RejectKind::ImmatureSpend => 7,
            RejectKind::CheckpointViolation => 8,
            RejectKind::UnknownParent => 9,
            RejectKind::StorageFailure => 10,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            1 => RejectKind::MalformedEncoding,
            2 => RejectKind::ProofOfWorkOrStakeInvalid,
            3 => RejectKind::TimestampOutOfRange,
            4 => RejectKind::OversizeBlockOrTx,
            5 => RejectKind::DuplicateOrMissingInput,
            6 => RejectKind::InsufficientInputValue,
            7 => RejectKind::ImmatureSpend,
            8 => RejectKind::CheckpointViolation,
            9 => RejectKind::UnknownParent,
            10 => RejectKind::StorageFailure,
            _ => return None,
        })
    }
}

impl fmt::Display for RejectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct ValidationFlags {
    pub check_pow: bool,
    pub check_scripts: bool,
}

impl Default for ValidationFlags {
    fn default() -> Self {
        Self {
            check_pow: true,
            check_scripts: true,
        }
    }
}

#[derive(Debug)]
pub enum ValidationError {
    Encoding(DecodeError),
    InvalidBlock(&'static str),
    InvalidTransaction(&'static str),
    ValueOutOfRange,
    MerkleMismatch,
    DuplicateTransaction,
    Oversize(&'static str),
    Pow(PowError),
    Stake(StakeError),
    BlockSignature(StakeError),
    UnexpectedBits { expected: u32, found: u32 },
    PowAfterLastPowBlock,
    Timestamp(&'static str),
    DuplicateInput,
    MissingInput(OutPoint),
    Script {
        tx_index: usize,
        input_index: usize,
        error: ScriptError,
    },
    InsufficientValue(&'static str),
    Immature(OutPoint),
    Checkpoint(CheckpointError),
}

impl ValidationError {
    pub fn kind(&self) -> RejectKind {
        match self {
            ValidationError::Encoding(_)
            | ValidationError::InvalidBlock(_)
            | ValidationError::InvalidTransaction(_)
            | ValidationError::ValueOutOfRange
            | ValidationError::MerkleMismatch
            | ValidationError::DuplicateTransaction => RejectKind::MalformedEncoding,
            ValidationError::Oversize(_) => RejectKind::OversizeBlockOrTx,
            ValidationError::Pow(_)
            | ValidationError::Stake(_)
            | ValidationError::BlockSignature(_)
            | ValidationError::UnexpectedBits { .. }
            | ValidationError::PowAfterLastPowBlock => RejectKind::ProofOfWorkOrStakeInvalid,
            ValidationError::Timestamp(_) => RejectKind::TimestampOutOfRange,
            ValidationError::DuplicateInput
            | ValidationError::MissingInput(_)
            | ValidationError::Script { .. } => RejectKind::DuplicateOrMissingInput,
            ValidationError::InsufficientValue(_) => RejectKind::InsufficientInputValue,
            ValidationError::Immature(_) => RejectKind::ImmatureSpend,
            ValidationError::Checkpoint(_) => RejectKind::CheckpointViolation,
        }
    }

    /// Failures a relay could produce from a valid block without changing its hash.
    /// These never mark the hash invalid.
    pub fn is_malleable(&self) -> bool {
        matches!(
            self,
            ValidationError::MerkleMismatch
                | ValidationError::DuplicateTransaction
                | ValidationError::BlockSignature(_)
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ValidationError::Encoding(err) => write!(f, "{err}"),
            ValidationError::InvalidBlock(message) => write!(f, "{message}"),
            ValidationError::InvalidTransaction(message) => write!(f, "{message}"),
            ValidationError::ValueOutOfRange => write!(f, "value out of range"),
            ValidationError::MerkleMismatch => write!(f, "merkle root mismatch"),
            ValidationError::DuplicateTransaction => write!(f, "duplicate transaction"),
            ValidationError::Oversize(message) => write!(f, "{message}"),
            ValidationError::Pow(err) => write!(f, "{err}"),
            ValidationError::Stake(err) => write!(f, "{err}"),
            ValidationError::BlockSignature(err) => write!(f, "{err}"),
            ValidationError::UnexpectedBits { expected, found } => {
                write!(f, "incorrect difficulty: expected {expected:08x}, got {found:08x}")
            }
            ValidationError::PowAfterLastPowBlock => {
                write!(f, "proof-of-work block after the last proof-of-work height")
            }
            ValidationError::Timestamp(message) => write!(f, "{message}"),
            ValidationError::DuplicateInput => write!(f, "duplicate input"),
            ValidationError::MissingInput(outpoint) => write!(
                f,
                "missing input {}:{}",
                hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            ValidationError::Script {
                tx_index,
                input_index,
                error,
            } => write!(
                f,
                "script verification failed (tx {tx_index} input {input_index}): {error}"
            ),
            ValidationError::InsufficientValue(message) => write!(f, "{message}"),
            ValidationError::Immature(outpoint) => write!(
                f,
                "premature spend of generated output {}:{}",
                hash256_to_hex(&outpoint.hash),
                outpoint.index
            ),
            ValidationError::Checkpoint(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ValidationError {}

impl From<DecodeError> for ValidationError {
    fn from(err: DecodeError) -> Self {
        ValidationError::Encoding(err)
    }
}

impl From<PowError> for ValidationError {
    fn from(err: PowError) -> Self {
        ValidationError::Pow(err)
    }
}

impl From<StakeError> for ValidationError {
    fn from(err: StakeError) -> Self {
        ValidationError::Stake(err)
    }
}

impl From<CheckpointError> for ValidationError {
    fn from(err: CheckpointError) -> Self {
        ValidationError::Checkpoint(err)
    }
}

/// Checks that need nothing but the block and the clock.
pub fn check_block(
    block: &Block,
    params: &ConsensusParams,
    now: u32,
    flags: &ValidationFlags,
) -> Result<(), ValidationError> {
    if block.transactions.is_empty() {
        return Err(ValidationError::InvalidBlock(
            "block must contain at least one transaction",
        ));
    }
    if block.serialized_size() > MAX_BLOCK_SIZE as usize {
        return Err(ValidationError::Oversize("block size too large"));
    }
    if block.header.version < MIN_BLOCK_VERSION {
        return Err(ValidationError::InvalidBlock("block version too low"));
    }
    if u64::from(block.header.time) > u64::from(now) + u64::from(MAX_FUTURE_BLOCK_TIME) {
        return Err(ValidationError::Timestamp(
            "block timestamp too far in the future",
        ));
    }

    if block.is_proof_of_work() && flags.check_pow {
        check_proof_of_work(&block.hash(), block.header.bits, params)?;
    }

    if !block.transactions[0].is_coinbase() {
        return Err(ValidationError::InvalidBlock("first transaction is not coinbase"));
    }
    if block.transactions[1..].iter().any(Transaction::is_coinbase) {
        return Err(ValidationError::InvalidBlock("more than one coinbase"));
    }
    if block.transactions.iter().skip(2).any(Transaction::is_coinstake) {
        return Err(ValidationError::InvalidBlock("coinstake in wrong position"));
    }
    if block.is_proof_of_stake() {
        if block.transactions[0].vout.iter().any(|out| !out.is_empty()) {
            return Err(ValidationError::InvalidBlock(
                "coinbase output not empty for proof-of-stake block",
            ));
        }
        if block.transactions[1].time != block.header.time {
            return Err(ValidationError::Timestamp("coinstake timestamp violation"));
        }
    }

    let txids = block.txids();
    let mut seen = HashSet::with_capacity(txids.len());
    if !txids.iter().all(|txid| seen.insert(*txid)) {
        return Err(ValidationError::DuplicateTransaction);
    }
    let (root, mutated) = block.compute_merkle_root();
    if mutated {
        return Err(ValidationError::DuplicateTransaction);
    }
    if root != block.header.merkle_root {
        return Err(ValidationError::MerkleMismatch);
    }

    for tx in &block.transactions {
        check_transaction(tx)?;
        if tx.time > block.header.time {
            return Err(ValidationError::Timestamp(
                "block timestamp earlier than transaction timestamp",
            ));
        }
    }

    if block_sigops(block) > MAX_BLOCK_SIGOPS as usize {
        return Err(ValidationError::Oversize("block sigops limit exceeded"));
    }

    check_block_signature(block).map_err(ValidationError::BlockSignature)?;
    Ok(())
}

/// Structural transaction rules.
pub fn check_transaction(tx: &Transaction) -> Result<(), ValidationError> {
    if tx.vin.is_empty() {
        return Err(ValidationError::InvalidTransaction("transaction has no inputs"));
    }
    if tx.vout.is_empty() {
        return Err(ValidationError::InvalidTransaction("transaction has no outputs"));
    }
    if tx.serialized_size() > MAX_TX_SIZE as usize {
        return Err(ValidationError::Oversize("transaction too large"));
    }

    let generated = tx.is_coinbase() || tx.is_coinstake();
    for output in &tx.vout {
        if !money_range(output.value) {
            return Err(ValidationError::ValueOutOfRange);
        }
        if output.is_empty() && !generated {
            return Err(ValidationError::InvalidTransaction(
                "empty output in user transaction",
            ));
        }
        if output.script_pubkey.len() > MAX_SCRIPT_SIZE {
            return Err(ValidationError::Oversize("output script too large"));
        }
    }
    if tx.value_out().is_none() {
        return Err(ValidationError::ValueOutOfRange);
    }

    let mut seen_inputs = HashSet::with_capacity(tx.vin.len());
    for input in &tx.vin {
        if !seen_inputs.insert(&input.prevout) {
            return Err(ValidationError::DuplicateInput);
        }
    }

    if tx.is_coinbase() {
        let script_len = tx.vin[0].script_sig.len();
        if !(MIN_COINBASE_SCRIPT_LEN..=MAX_COINBASE_SCRIPT_LEN).contains(&script_len) {
            return Err(ValidationError::InvalidTransaction(
                "coinbase scriptSig length out of range",
            ));
        }
    } else {
        for input in &tx.vin {
            if input.prevout.is_null() {
                return Err(ValidationError::InvalidTransaction(
                    "non-coinbase cannot contain null prevout",
                ));
            }
            if input.script_sig.len() > MAX_SCRIPT_SIZE {
                return Err(ValidationError::Oversize("input script too large"));
            }
        }
    }
    Ok(())
}

/// What the parent chain says about the next block.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct BlockContext {
    pub height: i32,
    pub expected_bits: u32,
    pub median_time_past: u32,
}

pub fn check_block_context(
    block: &Block,
    context: &BlockContext,
    params: &ConsensusParams,
) -> Result<(), ValidationError> {
    if block.is_proof_of_work() && context.height > params.last_pow_block {
        return Err(ValidationError::PowAfterLastPowBlock);
    }
    if block.header.bits != context.expected_bits {
        return Err(ValidationError::UnexpectedBits {
            expected: context.expected_bits,
            found: block.header.bits,
        });
    }
    if block.header.time <= context.median_time_past {
        return Err(ValidationError::Timestamp("block timestamp too early"));
    }
    if !block
        .transactions
        .iter()
        .all(|tx| tx.is_final(context.height, block.header.time))
    {
        return Err(ValidationError::Timestamp("contains a non-final transaction"));
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct InputTotals {
    pub value_in: Amount,
    pub fee: Amount,
}

/// Value and maturity rules for the resolved inputs of a non-coinbase transaction.
///
/// For a coinstake the fee is left at zero; the minted amount is checked by the caller.
pub fn check_tx_inputs(
    tx: &Transaction,
    spent: &[UtxoEntry],
    spend_height: i32,
    params: &ConsensusParams,
) -> Result<InputTotals, ValidationError> {
    let mut value_in: Amount = 0;
    for (input, entry) in tx.vin.iter().zip(spent) {
        if !entry.is_mature(spend_height, params.coinbase_maturity) {
            return Err(ValidationError::Immature(input.prevout.clone()));
        }
        if entry.tx_time > tx.time {
            return Err(ValidationError::Timestamp(
                "transaction timestamp earlier than input transaction",
            ));
        }
        value_in = checked_money_add(value_in, entry.value).ok_or(ValidationError::ValueOutOfRange)?;
    }
    if tx.is_coinstake() {
        return Ok(InputTotals { value_in, fee: 0 });
    }
    let value_out = tx.value_out().ok_or(ValidationError::ValueOutOfRange)?;
    if value_in < value_out {
        return Err(ValidationError::InsufficientValue("value in below value out"));
    }
    Ok(InputTotals {
        value_in,
        fee: value_in - value_out,
    })
}

/// One input whose script still has to run.
pub struct ScriptCheck<'a> {
    pub tx: &'a Transaction,
    pub tx_index: usize,
    pub input_index: usize,
    pub script_pubkey: &'a [u8],
}

pub fn verify_scripts(checks: &[ScriptCheck<'_>], flags: ScriptFlags) -> Result<(), ValidationError> {
    checks.par_iter().try_for_each(|check| {
        let script_sig = &check.tx.vin[check.input_index].script_sig;
        verify_script(
            script_sig,
            check.script_pubkey,
            check.tx,
            check.input_index,
            flags,
        )
        .map_err(|error| ValidationError::Script {
            tx_index: check.tx_index,
            input_index: check.input_index,
            error,
        })
    })
}

pub fn block_sigops(block: &Block) -> usize {
    block.transactions.iter().map(legacy_sigops).sum()
}

pub fn legacy_sigops(tx: &Transaction) -> usize {
    let inputs: usize = tx
        .vin
        .iter()
        .map(|input| sigop_count(&input.script_sig, false))
        .sum();
    let outputs: usize = tx
        .vout
        .iter()
        .map(|output| sigop_count(&output.script_pubkey, false))
        .sum();
    inputs + outputs
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_consensus::{consensus_params, Network};
    use beand_primitives::block::{BlockHeader, CURRENT_VERSION};
    use beand_primitives::transaction::{TxIn, TxOut};

    fn coinbase(time: u32) -> Transaction {
        Transaction {
            version: 1,
            time,
            vin: vec![TxIn::new(OutPoint::null(), vec![0x01, 0x01, 0x2a])],
            vout: vec![TxOut {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    fn block_with(transactions: Vec<Transaction>, time: u32) -> Block {
        let mut block = Block {
            header: BlockHeader {
                version: CURRENT_VERSION,
                prev_block: [1u8; 32],
                merkle_root: [0u8; 32],
                time,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        };
        block.header.merkle_root = block.compute_merkle_root().0;
        block
    }

    fn unchecked_pow() -> ValidationFlags {
        ValidationFlags {
            check_pow: false,
            check_scripts: true,
        }
    }

    #[test]
    fn every_error_maps_to_one_kind() {
        assert_eq!(
            ValidationError::Pow(PowError::HashAboveTarget).kind(),
            RejectKind::ProofOfWorkOrStakeInvalid
        );
        assert_eq!(
            ValidationError::Immature(OutPoint::null()).kind(),
            RejectKind::ImmatureSpend
        );
        assert_eq!(
            ValidationError::Timestamp("x").kind(),
            RejectKind::TimestampOutOfRange
        );
        for code in 1..=10u8 {
            let kind = RejectKind::from_u8(code).expect("kind");
            assert_eq!(kind.to_u8(), code);
        }
        assert_eq!(RejectKind::from_u8(0), None);
    }

    #[test]
    fn future_block_is_rejected() {
        let params = consensus_params(Network::Regtest);
        let now = 1_500_000_000;
        let block = block_with(vec![coinbase(now)], now + MAX_FUTURE_BLOCK_TIME + 1);
        let err = check_block(&block, &params, now, &unchecked_pow()).expect_err("future");
        assert_eq!(err.kind(), RejectKind::TimestampOutOfRange);
    }

    #[test]
    fn merkle_mismatch_is_malleable() {
        let params = consensus_params(Network::Regtest);
        let mut block = block_with(vec![coinbase(100)], 100);
        block.header.merkle_root[0] ^= 1;
        let err = check_block(&block, &params, 100, &unchecked_pow()).expect_err("merkle");
        assert!(matches!(err, ValidationError::MerkleMismatch));
        assert!(err.is_malleable());
        assert_eq!(err.kind(), RejectKind::MalformedEncoding);
    }

    #[test]
    fn second_coinbase_is_rejected() {
        let params = consensus_params(Network::Regtest);
        let mut second = coinbase(100);
        second.vin[0].script_sig = vec![0x01, 0x02, 0x2b];
        let block = block_with(vec![coinbase(100), second], 100);
        let err = check_block(&block, &params, 100, &unchecked_pow()).expect_err("coinbase");
        assert!(matches!(err, ValidationError::InvalidBlock(_)));
    }

    #[test]
    fn transaction_structure_rules() {
        let mut tx = coinbase(5);
        tx.vin[0].script_sig = vec![0x01];
        assert!(check_transaction(&tx).is_err());

        let spend = Transaction {
            version: 1,
            time: 5,
            vin: vec![
                TxIn::new(OutPoint::new([3u8; 32], 0), vec![]),
                TxIn::new(OutPoint::new([3u8; 32], 0), vec![]),
            ],
            vout: vec![TxOut {
                value: 1,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        assert!(matches!(
            check_transaction(&spend),
            Err(ValidationError::DuplicateInput)
        ));

        let mut negative = spend.clone();
        negative.vin.pop();
        negative.vout[0].value = -1;
        assert_eq!(
            check_transaction(&negative).expect_err("negative").kind(),
            RejectKind::MalformedEncoding
        );

        let mut empty = spend;
        empty.vin.pop();
        empty.vout[0] = TxOut::empty();
        assert!(check_transaction(&empty).is_err());
    }

    #[test]
    fn inputs_must_cover_outputs_and_mature() {
        let params = consensus_params(Network::Regtest);
        let tx = Transaction {
            version: 1,
            time: 10,
            vin: vec![TxIn::new(OutPoint::new([3u8; 32], 0), vec![])],
            vout: vec![TxOut {
                value: 40,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        };
        let mut entry = UtxoEntry {
            value: 50,
            script_pubkey: vec![0x51],
            height: 1,
            is_coinbase: true,
            is_coinstake: false,
            tx_time: 5,
        };
        let err = check_tx_inputs(&tx, &[entry.clone()], 2, &params).expect_err("immature");
        assert_eq!(err.kind(), RejectKind::ImmatureSpend);

        let totals = check_tx_inputs(&tx, &[entry.clone()], 1 + params.coinbase_maturity, &params)
            .expect("mature");
        assert_eq!(totals, InputTotals { value_in: 50, fee: 10 });

        entry.value = 30;
        entry.is_coinbase = false;
        let err = check_tx_inputs(&tx, &[entry], 2, &params).expect_err("short");
        assert_eq!(err.kind(), RejectKind::InsufficientInputValue);
    }

    #[test]
    fn context_rejects_wrong_bits_and_old_time() {
        let params = consensus_params(Network::Regtest);
        let block = block_with(vec![coinbase(100)], 100);
        let context = BlockContext {
            height: 1,
            expected_bits: 0x207f_ffff,
            median_time_past: 99,
        };
        check_block_context(&block, &context, &params).expect("valid");

        let err = check_block_context(
            &block,
            &BlockContext {
                expected_bits: 0x1f00_ffff,
                ..context
            },
            &params,
        )
        .expect_err("bits");
        assert_eq!(err.kind(), RejectKind::ProofOfWorkOrStakeInvalid);

        let err = check_block_context(
            &block,
            &BlockContext {
                median_time_past: 100,
                ..context
            },
            &params,
        )
        .expect_err("time");
        assert_eq!(err.kind(), RejectKind::TimestampOutOfRange);
    }
}
