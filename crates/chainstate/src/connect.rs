//! Contextual block validation against a ledger state.
//!
//! `connect_block` resolves every input, applies the value, maturity, stake and script
//! rules and produces the ledger delta plus the undo record for the block. It does not
//! mutate the ledger.

use std::collections::{HashMap, HashSet};
use std::fmt;

use beand_consensus::constants::MAX_BLOCK_SIGOPS;
use beand_consensus::money::{checked_money_add, Amount};
use beand_consensus::{ConsensusParams, Hash256};
use beand_primitives::{Block, OutPoint};
use beand_script::interpreter::BLOCK_SCRIPT_VERIFY_FLAGS;
use beand_script::standard::{is_p2sh, p2sh_sigop_count};
use beand_stake::kernel::{check_stake_kernel, KernelInput};
use beand_stake::reward::{coin_age, proof_of_stake_reward, proof_of_work_reward, AgedInput};
use beand_storage::StoreError;

use crate::undo::{BlockUndo, SpentOutput};
use crate::utxo::{block_created_outputs, UtxoDelta, UtxoEntry, UtxoLookup};
use crate::validation::{
    block_sigops, check_tx_inputs, verify_scripts, ScriptCheck, ValidationError, ValidationFlags,
};

#[derive(Debug)]
pub enum ConnectError {
    Validation(ValidationError),
    Store(StoreError),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Validation(err) => write!(f, "{err}"),
            ConnectError::Store(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for ConnectError {}

impl From<ValidationError> for ConnectError {
    fn from(err: ValidationError) -> Self {
        ConnectError::Validation(err)
    }
}

impl From<StoreError> for ConnectError {
    fn from(err: StoreError) -> Self {
        ConnectError::Store(err)
    }
}

pub struct ConnectedBlock {
    pub delta: UtxoDelta,
    pub undo: BlockUndo,
    pub fees: Amount,
}

struct StakeClaim {
    value_in: Amount,
    value_out: Amount,
    coin_age: u64,
}

/// Validates `block` at `height` on top of the ledger `view`.
///
/// `prev_modifier` is the stake modifier of the parent block.
pub fn connect_block<L: UtxoLookup>(
    block: &Block,
    height: i32,
    prev_modifier: &Hash256,
    view: &L,
    params: &ConsensusParams,
    flags: &ValidationFlags,
) -> Result<ConnectedBlock, ConnectError> {
    let mut in_block: HashMap<OutPoint, UtxoEntry> = HashMap::new();
    let mut spent_keys: HashSet<OutPoint> = HashSet::new();
    let mut undo = BlockUndo::default();
    let mut script_inputs: Vec<(usize, usize, Vec<u8>)> = Vec::new();
    let mut sigops = block_sigops(block);
    let mut fees: Amount = 0;
    let mut stake_claim = None;

    for (tx_index, tx) in block.transactions.iter().enumerate() {
        if !tx.is_coinbase() {
            let mut resolved = Vec::with_capacity(tx.vin.len());
            for (input_index, input) in tx.vin.iter().enumerate() {
                if !spent_keys.insert(input.prevout.clone()) {
                    return Err(ValidationError::DuplicateInput.into());
                }
                let entry = match in_block.get(&input.prevout) {
                    Some(entry) => entry.clone(),
                    None => {
                        let entry = view
                            .lookup(&input.prevout)?
                            .ok_or_else(|| ValidationError::MissingInput(input.prevout.clone()))?;
                        undo.spent.push(SpentOutput {
                            outpoint: input.prevout.clone(),
                            entry: entry.clone(),
                        });
                        entry
                    }
                };
                if is_p2sh(&entry.script_pubkey) {
                    sigops += p2sh_sigop_count(&input.script_sig);
                }
                script_inputs.push((tx_index, input_index, entry.script_pubkey.clone()));
                resolved.push(entry);
            }

            let totals = check_tx_inputs(tx, &resolved, height, params)?;
            if tx.is_coinstake() {
                let stake = &resolved[0];
                let kernel = KernelInput {
                    modifier: *prev_modifier,
                    prev_tx_time: stake.tx_time,
                    prevout: tx.vin[0].prevout.clone(),
                    value: stake.value,
                    tx_time: tx.time,
                };
                check_stake_kernel(&kernel, block.header.bits, params)
                    .map_err(ValidationError::from)?;
                let aged: Vec<AgedInput> = resolved
                    .iter()
                    .map(|entry| AgedInput {
                        value: entry.value,
                        prev_tx_time: entry.tx_time,
                    })
                    .collect();
                stake_claim = Some(StakeClaim {
                    value_in: totals.value_in,
                    value_out: tx.value_out().ok_or(ValidationError::ValueOutOfRange)?,
                    coin_age: coin_age(&aged, tx.time, params)
                        .ok_or(ValidationError::Timestamp("coinstake predates its inputs"))?,
                });
            } else {
                fees = checked_money_add(fees, totals.fee).ok_or(ValidationError::ValueOutOfRange)?;
            }
        }

        let txid = tx.txid();
        for (index, output) in tx.vout.iter().enumerate() {
            if output.is_empty() {
                continue;
            }
            in_block.insert(
                OutPoint::new(txid, index as u32),
                UtxoEntry {
                    value: output.value,
                    script_pubkey: output.script_pubkey.clone(),
                    height,
                    is_coinbase: tx.is_coinbase(),
                    is_coinstake: tx.is_coinstake(),
                    tx_time: tx.time,
                },
            );
        }
    }

    if sigops > MAX_BLOCK_SIGOPS as usize {
        return Err(ValidationError::Oversize("block sigops limit exceeded").into());
    }

    let coinbase_out = block.transactions[0]
        .value_out()
        .ok_or(ValidationError::ValueOutOfRange)?;
    match stake_claim {
        Some(claim) => {
            let allowed = proof_of_stake_reward(claim.coin_age, fees, params);
            if claim.value_out > claim.value_in.saturating_add(allowed) {
                return Err(ValidationError::InsufficientValue("coinstake pays too much").into());
            }
        }
        None => {
            if coinbase_out > proof_of_work_reward(height, fees, params) {
                return Err(ValidationError::InsufficientValue("coinbase pays too much").into());
            }
        }
    }

    if flags.check_scripts {
        let checks: Vec<ScriptCheck<'_>> = script_inputs
            .iter()
            .map(|(tx_index, input_index, script_pubkey)| ScriptCheck {
                tx: &block.transactions[*tx_index],
                tx_index: *tx_index,
                input_index: *input_index,
                script_pubkey,
            })
            .collect();
        verify_scripts(&checks, BLOCK_SCRIPT_VERIFY_FLAGS)?;
    }

    Ok(ConnectedBlock {
        delta: UtxoDelta {
            spent: undo.spent.clone(),
            created: block_created_outputs(block, height),
        },
        undo,
        fees,
    })
}
