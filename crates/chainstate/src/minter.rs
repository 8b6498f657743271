//! Proof-of-stake block production.
//!
//! The minter owns one key. Each round it searches the outputs paying that key for a
//! kernel under the stake target, builds a block around the winning output and hands the
//! serialized block to [`ChainState::submit_block`] like any other producer.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use beand_consensus::constants::MAX_BLOCK_SIZE;
use beand_consensus::money::{checked_money_add, Amount};
use beand_consensus::{hash256_to_hex, Hash256};
use beand_primitives::block::{BlockHeader, CURRENT_VERSION};
use beand_primitives::hash::hash160;
use beand_primitives::{Block, OutPoint, Transaction, TxIn, TxOut};
use beand_script::sighash::{SighashType, SIGHASH_ALL};
use beand_script::sign::{sign_input, SignError};
use beand_script::standard::push_data;
use beand_stake::kernel::{check_stake_kernel, KernelInput};
use beand_stake::reward::{coin_age, proof_of_stake_reward, AgedInput};
use beand_stake::signature::{public_key, sign_block};
use beand_stake::StakeError;
use beand_storage::KeyValueStore;

use crate::state::{unix_now, ChainState, ChainStateError, MintContext, Rejection};
use crate::utxo::UtxoEntry;

const OP_DUP: u8 = 0x76;
const OP_HASH160: u8 = 0xa9;
const OP_EQUALVERIFY: u8 = 0x88;
const OP_CHECKSIG: u8 = 0xac;

/// Room left for the coinbase, coinstake and signature when filling a block from the pool.
const BLOCK_FILL_LIMIT: usize = MAX_BLOCK_SIZE as usize / 2;

#[derive(Clone, Debug, Default)]
pub struct MinterConfig {
    /// Value kept out of staking.
    pub reserve_balance: Amount,
    /// Stake the smallest eligible outputs first instead of the largest.
    pub minimize_bean_age: bool,
}

#[derive(Debug)]
pub enum MintError {
    Chain(ChainStateError),
    Stake(StakeError),
    Sign(SignError),
    Rejected(Rejection),
}

impl fmt::Display for MintError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MintError::Chain(err) => write!(f, "{err}"),
            MintError::Stake(err) => write!(f, "{err}"),
            MintError::Sign(err) => write!(f, "{err}"),
            MintError::Rejected(rejection) => write!(f, "minted block rejected: {rejection}"),
        }
    }
}

impl std::error::Error for MintError {}

impl From<ChainStateError> for MintError {
    fn from(err: ChainStateError) -> Self {
        MintError::Chain(err)
    }
}

impl From<StakeError> for MintError {
    fn from(err: StakeError) -> Self {
        MintError::Stake(err)
    }
}

impl From<SignError> for MintError {
    fn from(err: SignError) -> Self {
        MintError::Sign(err)
    }
}

/// `<pubkey> OP_CHECKSIG`.
pub fn pay_to_pubkey_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = push_data(pubkey);
    script.push(OP_CHECKSIG);
    script
}

pub fn pay_to_pubkey_hash_script(pubkey: &[u8]) -> Vec<u8> {
    let mut script = vec![OP_DUP, OP_HASH160];
    script.extend(push_data(&hash160(pubkey)));
    script.extend([OP_EQUALVERIFY, OP_CHECKSIG]);
    script
}

pub struct StakeMinter<S> {
    chain: Arc<ChainState<S>>,
    secret: [u8; 32],
    stake_script: Vec<u8>,
    owned_scripts: Vec<Vec<u8>>,
    config: MinterConfig,
}

impl<S: KeyValueStore> StakeMinter<S> {
    pub fn new(
        chain: Arc<ChainState<S>>,
        secret: [u8; 32],
        config: MinterConfig,
    ) -> Result<Self, MintError> {
        let pubkey = public_key(&secret)?;
        let stake_script = pay_to_pubkey_script(&pubkey);
        let owned_scripts = vec![stake_script.clone(), pay_to_pubkey_hash_script(&pubkey)];
        Ok(Self {
            chain,
            secret,
            stake_script,
            owned_scripts,
            config,
        })
    }

    /// Script every minted coinstake pays to.
    pub fn stake_script(&self) -> &[u8] {
        &self.stake_script
    }

    /// Mints until `shutdown` is set, one attempt every `interval`.
    pub fn run(&self, shutdown: &AtomicBool, interval: Duration) {
        beand_log::log_info!("stake minter started");
        while !shutdown.load(Ordering::SeqCst) {
            if self.chain.is_halted() {
                break;
            }
            match self.try_mint(unix_now()) {
                Ok(Some(hash)) => {
                    beand_log::log_info!("minted proof-of-stake block {}", hash256_to_hex(&hash))
                }
                Ok(None) => {}
                Err(err) => beand_log::log_warn!("stake minting failed: {err}"),
            }
            sleep_unless_shutdown(shutdown, interval);
        }
        beand_log::log_info!("stake minter stopped");
    }

    /// One minting attempt with block time `now`. Returns the hash of an accepted block,
    /// or `None` when no output produced a kernel under the target.
    pub fn try_mint(&self, now: u32) -> Result<Option<Hash256>, MintError> {
        let context = self.chain.mint_context()?;
        let time = now.max(context.median_time_past.saturating_add(1));
        let params = &self.chain.params().consensus;

        for (outpoint, entry) in self.candidates(&context, time)? {
            let kernel = KernelInput {
                modifier: context.prev_modifier,
                prev_tx_time: entry.tx_time,
                prevout: outpoint.clone(),
                value: entry.value,
                tx_time: time,
            };
            match check_stake_kernel(&kernel, context.bits, params) {
                Ok(_) => {}
                Err(StakeError::KernelAboveTarget) | Err(StakeError::StakeTooYoung) => continue,
                Err(err) => return Err(err.into()),
            }
            beand_log::log_debug!(
                "kernel found for {}:{} at height {}",
                hash256_to_hex(&outpoint.hash),
                outpoint.index,
                context.height
            );
            let block = self.assemble(&context, time, outpoint, &entry)?;
            let accepted = self
                .chain
                .submit_block(&block.consensus_encode_vec())
                .map_err(MintError::Rejected)?;
            return Ok(Some(accepted.hash()));
        }
        Ok(None)
    }

    /// Mature outputs old enough to stake, in staking preference order, after the reserve
    /// balance is set aside.
    fn candidates(
        &self,
        context: &MintContext,
        time: u32,
    ) -> Result<Vec<(OutPoint, UtxoEntry)>, MintError> {
        let params = &self.chain.params().consensus;
        let mut outputs = self.chain.spendable_outputs(&self.owned_scripts)?;
        let balance = outputs
            .iter()
            .fold(0 as Amount, |total, (_, entry)| total.saturating_add(entry.value));
        let mut stakeable = balance.saturating_sub(self.config.reserve_balance);

        outputs.retain(|(_, entry)| {
            entry.is_mature(context.height, params.coinbase_maturity)
                && u64::from(entry.tx_time) + u64::from(params.stake_min_age) <= u64::from(time)
        });
        if self.config.minimize_bean_age {
            outputs.sort_by_key(|(_, entry)| entry.value);
        } else {
            outputs.sort_by_key(|(_, entry)| std::cmp::Reverse(entry.value));
        }
        outputs.retain(|(_, entry)| {
            if entry.value > stakeable {
                return false;
            }
            stakeable -= entry.value;
            true
        });
        Ok(outputs)
    }

    fn assemble(
        &self,
        context: &MintContext,
        time: u32,
        stake: OutPoint,
        entry: &UtxoEntry,
    ) -> Result<Block, MintError> {
        let params = &self.chain.params().consensus;
        let (pooled, fees) = self.pooled_transactions(context, time, &stake)?;

        let coinbase = Transaction {
            version: 1,
            time,
            vin: vec![TxIn::new(
                OutPoint::null(),
                push_data(&context.height.to_le_bytes()),
            )],
            vout: vec![TxOut::empty()],
            lock_time: 0,
        };

        let age = coin_age(
            &[AgedInput {
                value: entry.value,
                prev_tx_time: entry.tx_time,
            }],
            time,
            params,
        )
        .ok_or(StakeError::TimestampViolation)?;
        let reward = proof_of_stake_reward(age, fees, params);
        let mut coinstake = Transaction {
            version: 1,
            time,
            vin: vec![TxIn::new(stake, Vec::new())],
            vout: vec![
                TxOut::empty(),
                TxOut {
                    value: entry.value.saturating_add(reward),
                    script_pubkey: self.stake_script.clone(),
                },
            ],
            lock_time: 0,
        };
        sign_input(
            &mut coinstake,
            0,
            &entry.script_pubkey,
            &self.secret,
            SighashType(SIGHASH_ALL),
        )?;

        let mut transactions = Vec::with_capacity(pooled.len() + 2);
        transactions.push(coinbase);
        transactions.push(coinstake);
        transactions.extend(pooled);
        let mut block = Block {
            header: BlockHeader {
                version: CURRENT_VERSION,
                prev_block: context.prev_hash,
                merkle_root: [0u8; 32],
                time,
                bits: context.bits,
                nonce: 0,
            },
            transactions,
            signature: Vec::new(),
        };
        block.header.merkle_root = block.compute_merkle_root().0;
        sign_block(&mut block, &self.secret)?;
        Ok(block)
    }

    /// Pool transactions that fit the block, oldest first, with their total fee.
    fn pooled_transactions(
        &self,
        context: &MintContext,
        time: u32,
        stake: &OutPoint,
    ) -> Result<(Vec<Transaction>, Amount), MintError> {
        let mut selected = Vec::new();
        let mut fees: Amount = 0;
        let mut size = 0usize;
        for (tx, fee) in self.chain.mempool_transactions()? {
            if tx.time > time || !tx.is_final(context.height, time) {
                continue;
            }
            if tx.vin.iter().any(|input| &input.prevout == stake) {
                continue;
            }
            let tx_size = tx.serialized_size();
            if size + tx_size > BLOCK_FILL_LIMIT {
                break;
            }
            let Some(total) = checked_money_add(fees, fee) else {
                break;
            };
            fees = total;
            size += tx_size;
            selected.push(tx);
        }
        Ok((selected, fees))
    }
}

/// Sleeps for `interval` in short naps, returning early once `shutdown` is set.
pub fn sleep_unless_shutdown(shutdown: &AtomicBool, interval: Duration) {
    let step = Duration::from_millis(100);
    let mut waited = Duration::ZERO;
    while waited < interval && !shutdown.load(Ordering::SeqCst) {
        let nap = step.min(interval - waited);
        std::thread::sleep(nap);
        waited += nap;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sleep_returns_at_once_after_shutdown() {
        let shutdown = AtomicBool::new(true);
        let started = std::time::Instant::now();
        sleep_unless_shutdown(&shutdown, Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn owned_scripts_have_standard_shapes() {
        let pubkey = public_key(&[7u8; 32]).expect("pubkey");
        let p2pk = pay_to_pubkey_script(&pubkey);
        assert_eq!(p2pk.len(), 35);
        assert_eq!(p2pk[0], 33);
        assert_eq!(p2pk[34], OP_CHECKSIG);
        assert_eq!(
            beand_stake::signature::pay_to_pubkey_key(&p2pk),
            Some(pubkey.as_slice())
        );
        let p2pkh = pay_to_pubkey_hash_script(&pubkey);
        assert!(beand_script::standard::is_p2pkh(&p2pkh));
    }
}
