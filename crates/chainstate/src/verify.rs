//! Startup consistency check of the most recent active blocks (`-checkblocks`,
//! `-checklevel`).
//!
//! Levels are cumulative:
//! 0. block data readable and hashing to the indexed hash
//! 1. stateless block checks
//! 2. undo data readable
//! 3. undo data matches the outputs the block spends
//! 4. disconnect then reconnect every checked block on a ledger overlay

use std::collections::HashSet;
use std::fmt;

use beand_consensus::{hash256_to_hex, Hash256};
use beand_primitives::{Block, OutPoint};
use beand_storage::KeyValueStore;

use crate::connect::connect_block;
use crate::index::IndexHandle;
use crate::state::{unix_now, ChainState, ChainStateError};
use crate::utxo::{UtxoDelta, UtxoView};
use crate::validation::check_block;

pub const DEFAULT_CHECK_LEVEL: u32 = 1;
pub const DEFAULT_CHECK_BLOCKS: u32 = 600;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct VerifyReport {
    pub blocks: u32,
    pub level: u32,
}

#[derive(Debug)]
pub enum VerifyError {
    Chain(ChainStateError),
    Block {
        height: i32,
        hash: Hash256,
        reason: String,
    },
}

impl fmt::Display for VerifyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyError::Chain(err) => write!(f, "{err}"),
            VerifyError::Block {
                height,
                hash,
                reason,
            } => write!(
                f,
                "block {} at height {height} failed verification: {reason}",
                hash256_to_hex(hash)
            ),
        }
    }
}

impl std::error::Error for VerifyError {}

impl From<ChainStateError> for VerifyError {
    fn from(err: ChainStateError) -> Self {
        VerifyError::Chain(err)
    }
}

/// Outpoints a block takes from the ledger, in spend order.
fn ledger_spends(block: &Block) -> Vec<OutPoint> {
    let mut created: HashSet<OutPoint> = HashSet::new();
    let mut spends = Vec::new();
    for tx in &block.transactions {
        if !tx.is_coinbase() {
            for input in &tx.vin {
                if !created.contains(&input.prevout) {
                    spends.push(input.prevout.clone());
                }
            }
        }
        let txid = tx.txid();
        for index in 0..tx.vout.len() {
            created.insert(OutPoint::new(txid, index as u32));
        }
    }
    spends
}

impl<S: KeyValueStore> ChainState<S> {
    /// Checks the top `depth` active blocks (all of them when `depth` is 0) at `level`.
    pub fn verify_chain(&self, level: u32, depth: u32) -> Result<VerifyReport, VerifyError> {
        let inner = self.read_inner()?;
        let tip_height = inner.active.len() - 1;
        let count = if depth == 0 {
            tip_height
        } else {
            tip_height.min(depth as usize)
        };
        let checked: Vec<IndexHandle> = inner.active[(tip_height + 1 - count)..]
            .iter()
            .rev()
            .copied()
            .collect();
        beand_log::log_info!("verifying last {count} blocks at level {level}");

        let now = unix_now();
        let mut view = UtxoView::new(&self.utxos);
        let mut blocks = Vec::with_capacity(checked.len());
        for handle in &checked {
            let entry = inner.index.entry(*handle);
            let fail = |reason: String| VerifyError::Block {
                height: entry.height,
                hash: entry.hash,
                reason,
            };

            let block = self.read_block(entry.location)?;
            if block.hash() != entry.hash {
                return Err(fail("stored block hashes differently".to_string()));
            }
            if level >= 1 {
                check_block(&block, &self.params.consensus, now, &self.config.flags)
                    .map_err(|err| fail(err.to_string()))?;
            }
            if level >= 2 {
                let undo = self.read_undo(entry.undo)?;
                if level >= 3 {
                    let recorded: Vec<OutPoint> =
                        undo.spent.iter().map(|spent| spent.outpoint.clone()).collect();
                    if recorded != ledger_spends(&block) {
                        return Err(fail("undo data does not match block spends".to_string()));
                    }
                }
                if level >= 4 {
                    let delta = UtxoDelta::from_undo(&block, entry.height, undo.spent);
                    view.revert(&delta).map_err(|err| fail(err.to_string()))?;
                }
            }
            blocks.push(block);
        }

        if level >= 4 {
            for (handle, block) in checked.iter().zip(&blocks).rev() {
                let entry = inner.index.entry(*handle);
                let fail = |reason: String| VerifyError::Block {
                    height: entry.height,
                    hash: entry.hash,
                    reason,
                };
                let parent = entry
                    .parent
                    .ok_or(ChainStateError::CorruptIndex("verified block has no parent"))?;
                let connected = connect_block(
                    block,
                    entry.height,
                    &inner.index.entry(parent).stake_modifier,
                    &view,
                    &self.params.consensus,
                    &self.config.flags,
                )
                .map_err(|err| fail(err.to_string()))?;
                view.apply(&connected.delta)
                    .map_err(|err| fail(err.to_string()))?;
            }
            if view.pending_changes() != 0 {
                return Err(VerifyError::Chain(ChainStateError::CorruptIndex(
                    "ledger differs after disconnect and reconnect",
                )));
            }
        }

        beand_log::log_info!("verified {count} blocks");
        Ok(VerifyReport {
            blocks: count as u32,
            level,
        })
    }
}
