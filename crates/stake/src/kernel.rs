//! Stake kernel.
//!
//! A staker proves ownership of aged coins by finding a coinstake timestamp for which
//!
//! ```text
//! sha256d(modifier ++ prev_tx_time ++ prevout.hash ++ prevout.n ++ tx_time)
//!     <= target(bits) * coin_day_weight
//! ```
//!
//! where the coin-day weight grows with the value and age of the staked output, capped at
//! the maximum stake age.

use beand_consensus::constants::SECONDS_PER_DAY;
use beand_consensus::money::{Amount, COIN};
use beand_consensus::{ConsensusParams, Hash256};
use beand_pow::difficulty::compact_to_u256;
use beand_primitives::encoding::{Encodable, Encoder};
use beand_primitives::hash::sha256d;
use beand_primitives::outpoint::OutPoint;
use primitive_types::U256;

use crate::StakeError;

/// Everything the kernel hash commits to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelInput {
    /// Stake modifier of the block being built upon.
    pub modifier: Hash256,
    /// Timestamp of the transaction that created the staked output.
    pub prev_tx_time: u32,
    pub prevout: OutPoint,
    pub value: Amount,
    /// Coinstake timestamp, equal to the block time.
    pub tx_time: u32,
}

pub fn kernel_hash(input: &KernelInput) -> Hash256 {
    let mut encoder = Encoder::with_capacity(76);
    encoder.write_hash_le(&input.modifier);
    encoder.write_u32_le(input.prev_tx_time);
    input.prevout.consensus_encode(&mut encoder);
    encoder.write_u32_le(input.tx_time);
    sha256d(&encoder.into_inner())
}

/// Coin-days the staked output contributes, after the minimum age is subtracted.
pub fn coin_day_weight(
    value: Amount,
    prev_tx_time: u32,
    tx_time: u32,
    params: &ConsensusParams,
) -> U256 {
    let age = i64::from(tx_time) - i64::from(prev_tx_time) - i64::from(params.stake_min_age);
    let age = age.clamp(0, i64::from(params.stake_max_age));
    let value = u128::try_from(value).unwrap_or(0);
    let weight = value * age as u128 / COIN as u128 / SECONDS_PER_DAY as u128;
    U256::from(weight)
}

/// Validates the kernel and returns its hash (the proof-of-stake hash).
pub fn check_stake_kernel(
    input: &KernelInput,
    bits: u32,
    params: &ConsensusParams,
) -> Result<Hash256, StakeError> {
    if input.tx_time < input.prev_tx_time {
        return Err(StakeError::TimestampViolation);
    }
    if u64::from(input.prev_tx_time) + u64::from(params.stake_min_age) > u64::from(input.tx_time)
    {
        return Err(StakeError::StakeTooYoung);
    }

    let target = compact_to_u256(bits).map_err(|_| StakeError::InvalidTarget)?;
    if target.is_zero() {
        return Err(StakeError::InvalidTarget);
    }
    let weight = coin_day_weight(input.value, input.prev_tx_time, input.tx_time, params);
    let weighted = target.checked_mul(weight).unwrap_or(U256::MAX);

    let hash = kernel_hash(input);
    if U256::from_little_endian(&hash) > weighted {
        return Err(StakeError::KernelAboveTarget);
    }
    Ok(hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_consensus::{consensus_params, Network};

    fn input(tx_time: u32) -> KernelInput {
        KernelInput {
            modifier: [3u8; 32],
            prev_tx_time: 1_000_000,
            prevout: OutPoint::new([9u8; 32], 1),
            value: 5_000 * COIN,
            tx_time,
        }
    }

    #[test]
    fn kernel_hash_depends_on_every_field() {
        let base = input(2_000_000);
        let hash = kernel_hash(&base);
        assert_eq!(hash, kernel_hash(&base.clone()));

        let mut other = base.clone();
        other.modifier[0] ^= 1;
        assert_ne!(kernel_hash(&other), hash);

        let mut other = base.clone();
        other.prevout.index = 2;
        assert_ne!(kernel_hash(&other), hash);

        let mut other = base.clone();
        other.tx_time += 1;
        assert_ne!(kernel_hash(&other), hash);

        // value is not committed to, only weighted
        let mut other = base;
        other.value += 1;
        assert_eq!(kernel_hash(&other), hash);
    }

    #[test]
    fn weight_is_capped_at_max_age() {
        let params = consensus_params(Network::Mainnet);
        let start = 1_000_000u32;
        let capped_end = start + params.stake_min_age + params.stake_max_age;
        let capped = coin_day_weight(COIN, start, capped_end, &params);
        let beyond = coin_day_weight(COIN, start, capped_end + 86_400 * 30, &params);
        assert_eq!(capped, beyond);
        assert_eq!(capped, U256::from(90u64));
        assert!(coin_day_weight(COIN, start, start + 10, &params).is_zero());
    }

    #[test]
    fn young_stake_is_rejected() {
        let params = consensus_params(Network::Mainnet);
        let young = input(1_000_000 + params.stake_min_age - 1);
        assert_eq!(
            check_stake_kernel(&young, 0x1e0f_ffff, &params),
            Err(StakeError::StakeTooYoung)
        );
        let backwards = input(999_999);
        assert_eq!(
            check_stake_kernel(&backwards, 0x1e0f_ffff, &params),
            Err(StakeError::TimestampViolation)
        );
    }

    #[test]
    fn heavy_weight_at_easy_target_passes() {
        let params = consensus_params(Network::Regtest);
        // 5000 coins aged 90 days against a ~2^255 target covers the whole hash space.
        let aged = input(1_000_000 + params.stake_min_age + 90 * 86_400);
        let hash = check_stake_kernel(&aged, 0x207f_ffff, &params).expect("kernel");
        assert_eq!(hash, kernel_hash(&aged));
    }

    #[test]
    fn zero_weight_never_passes() {
        let params = consensus_params(Network::Regtest);
        let mut dust = input(1_000_000 + params.stake_min_age + 10);
        dust.value = 1;
        assert_eq!(
            check_stake_kernel(&dust, 0x207f_ffff, &params),
            Err(StakeError::KernelAboveTarget)
        );
    }
}
