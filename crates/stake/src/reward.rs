//! Coin age and block rewards.

use beand_consensus::constants::{DAYS_PER_YEAR, SECONDS_PER_DAY};
use beand_consensus::money::{Amount, CENT, COIN, MAX_MONEY};
use beand_consensus::ConsensusParams;

/// A spent output as seen by coin-age accounting.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AgedInput {
    pub value: Amount,
    /// Timestamp of the transaction that created the output.
    pub prev_tx_time: u32,
}

/// Coin-days consumed by a transaction stamped `tx_time`.
///
/// Inputs younger than the minimum stake age contribute nothing. Returns `None` when an
/// input claims to be newer than the spending transaction.
pub fn coin_age(inputs: &[AgedInput], tx_time: u32, params: &ConsensusParams) -> Option<u64> {
    let mut cent_seconds: u128 = 0;
    for input in inputs {
        if tx_time < input.prev_tx_time {
            return None;
        }
        if u64::from(input.prev_tx_time) + u64::from(params.stake_min_age) > u64::from(tx_time) {
            continue;
        }
        let value = u128::try_from(input.value).ok()?;
        let age = u128::from(tx_time - input.prev_tx_time);
        cent_seconds = cent_seconds.saturating_add(value * age / CENT as u128);
    }
    let coin_days = cent_seconds * CENT as u128 / COIN as u128 / SECONDS_PER_DAY as u128;
    Some(u64::try_from(coin_days).unwrap_or(u64::MAX))
}

/// Proof-of-work subsidy plus fees; zero subsidy past the last work block.
pub fn proof_of_work_reward(height: i32, fees: Amount, params: &ConsensusParams) -> Amount {
    let subsidy = if height <= params.last_pow_block {
        params.pow_subsidy
    } else {
        0
    };
    subsidy.saturating_add(fees).min(MAX_MONEY)
}

/// Base reward plus coin-year interest on the consumed coin age, plus fees.
pub fn proof_of_stake_reward(coin_age: u64, fees: Amount, params: &ConsensusParams) -> Amount {
    let days_per_year = DAYS_PER_YEAR as i128;
    let interest = i128::from(coin_age) * i128::from(params.coin_year_reward) * 33
        / (days_per_year * 33 + 8);
    let total = i128::from(params.stake_base_reward) + interest + i128::from(fees);
    total.clamp(0, i128::from(MAX_MONEY)) as Amount
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_consensus::{consensus_params, Network};

    #[test]
    fn coin_age_skips_young_inputs() {
        let params = consensus_params(Network::Mainnet);
        let now = 10_000_000;
        let inputs = [
            AgedInput {
                value: 100 * COIN,
                prev_tx_time: now - 10 * 86_400,
            },
            AgedInput {
                value: 1_000 * COIN,
                prev_tx_time: now - 60,
            },
        ];
        assert_eq!(coin_age(&inputs, now, &params), Some(1_000));
        assert_eq!(coin_age(&inputs, now - 10 * 86_400 - 1, &params), None);
    }

    #[test]
    fn stake_reward_pays_interest() {
        let params = consensus_params(Network::Mainnet);
        let no_age = proof_of_stake_reward(0, 0, &params);
        assert_eq!(no_age, params.stake_base_reward);
        // One coin-year at 10% per year yields ~0.1 coin of interest.
        let year = proof_of_stake_reward(365, 0, &params) - params.stake_base_reward;
        assert!(year > 9 * CENT && year <= 10 * CENT, "interest {year}");
        assert_eq!(proof_of_stake_reward(0, 7, &params), params.stake_base_reward + 7);
    }

    #[test]
    fn work_subsidy_ends_after_last_pow_block() {
        let params = consensus_params(Network::Mainnet);
        assert_eq!(proof_of_work_reward(1, 5, &params), params.pow_subsidy + 5);
        assert_eq!(proof_of_work_reward(params.last_pow_block + 1, 5, &params), 5);
    }
}
