//! Difficulty and compact target utilities.

use beand_consensus::{ConsensusParams, Hash256};
use primitive_types::{U256, U512};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactError {
    Negative,
    Overflow,
}

impl std::fmt::Display for CompactError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompactError::Negative => write!(f, "compact target has negative sign bit"),
            CompactError::Overflow => write!(f, "compact target overflows 256-bit range"),
        }
    }
}

impl std::error::Error for CompactError {}

pub fn compact_to_u256(bits: u32) -> Result<U256, CompactError> {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;
    if bits & 0x0080_0000 != 0 && word != 0 {
        return Err(CompactError::Negative);
    }

    let value = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        if word != 0
            && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32))
        {
            return Err(CompactError::Overflow);
        }
        U256::from(word) << (8 * (size - 3))
    };
    Ok(value)
}

pub fn u256_to_compact(value: U256) -> u32 {
    if value.is_zero() {
        return 0;
    }
    let mut size = value.bits().div_ceil(8) as u32;
    let mut compact = if size <= 3 {
        value.low_u32() << (8 * (3 - size))
    } else {
        (value >> (8 * (size - 3))).low_u32()
    };
    // Keep the sign bit clear.
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    (size << 24) | (compact & 0x007f_ffff)
}

pub fn compact_to_target(bits: u32) -> Result<Hash256, CompactError> {
    Ok(u256_to_hash(compact_to_u256(bits)?))
}

pub fn target_to_compact(target: &Hash256) -> u32 {
    u256_to_compact(U256::from_little_endian(target))
}

pub fn hash_meets_target(hash: &Hash256, target: &Hash256) -> bool {
    U256::from_little_endian(hash) <= U256::from_little_endian(target)
}

/// Expected number of hashes to find a block at `bits`; the per-block chain weight.
pub fn block_proof(bits: u32) -> Result<U256, CompactError> {
    let target = compact_to_u256(bits)?;
    if target.is_zero() {
        return Ok(U256::zero());
    }
    let one = U256::one();
    Ok((!target / (target + one)) + one)
}

pub fn u256_to_hash(value: U256) -> Hash256 {
    value.to_little_endian()
}

/// Median of up to the last eleven timestamps, oldest first.
pub fn median_time_past(times: &[u32]) -> u32 {
    if times.is_empty() {
        return 0;
    }
    let mut sorted = times.to_vec();
    sorted.sort_unstable();
    sorted[sorted.len() / 2]
}

/// Timing of a previous block of the same kind (work or stake).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct TargetPoint {
    pub bits: u32,
    pub time: u32,
}

/// Next compact target for a block of one kind.
///
/// `last` is the most recent block of that kind on the parent chain and `before_last` the
/// one before it (genesis stands in when no earlier block of the kind exists). The target
/// moves toward one block per `target_spacing`, damped over `target_timespan`.
pub fn next_target_required(
    last: Option<TargetPoint>,
    before_last: Option<TargetPoint>,
    limit: &Hash256,
    params: &ConsensusParams,
) -> Result<u32, CompactError> {
    let limit_value = U256::from_little_endian(limit);
    let limit_bits = u256_to_compact(limit_value);
    if params.no_retargeting {
        return Ok(limit_bits);
    }
    let (Some(last), Some(before_last)) = (last, before_last) else {
        return Ok(limit_bits);
    };

    let spacing = params.target_spacing;
    let interval = params.retarget_interval();
    let actual = (i64::from(last.time) - i64::from(before_last.time)).max(0);

    let numerator = (interval - 1) * spacing + 2 * actual;
    let denominator = (interval + 1) * spacing;
    let previous = U512::from(compact_to_u256(last.bits)?);
    let scaled = previous * U512::from(numerator as u64) / U512::from(denominator as u64);

    let next = U256::try_from(scaled).unwrap_or(U256::MAX);
    if next.is_zero() {
        return Ok(u256_to_compact(U256::one()));
    }
    Ok(u256_to_compact(next.min(limit_value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_consensus::{consensus_params, Network};

    #[test]
    fn block_proof_of_easiest_regtest_target() {
        // target = 0x7fffff << 232, so proof is ~2.
        let proof = block_proof(0x207f_ffff).expect("proof");
        assert_eq!(proof, U256::from(2u64));
    }

    #[test]
    fn harder_bits_weigh_more() {
        let easy = block_proof(0x1e0f_ffff).expect("easy");
        let hard = block_proof(0x1d00_ffff).expect("hard");
        assert!(hard > easy);
    }

    #[test]
    fn median_time_past_is_order_independent() {
        assert_eq!(median_time_past(&[5, 1, 3]), 3);
        assert_eq!(median_time_past(&[1, 3, 5]), 3);
        assert_eq!(median_time_past(&[]), 0);
    }

    #[test]
    fn regtest_never_retargets() {
        let params = consensus_params(Network::Regtest);
        let last = TargetPoint {
            bits: 0x1d00_ffff,
            time: 1_000,
        };
        let bits = next_target_required(Some(last), Some(last), &params.pow_limit, &params)
            .expect("bits");
        assert_eq!(bits, target_to_compact(&params.pow_limit));
    }

    #[test]
    fn fast_blocks_raise_difficulty() {
        let params = consensus_params(Network::Mainnet);
        let prev_bits = 0x1d00_ffff;
        let on_time = next_target_required(
            Some(TargetPoint {
                bits: prev_bits,
                time: 1_060,
            }),
            Some(TargetPoint {
                bits: prev_bits,
                time: 1_000,
            }),
            &params.pow_limit,
            &params,
        )
        .expect("on time");
        assert_eq!(on_time, prev_bits);

        let fast = next_target_required(
            Some(TargetPoint {
                bits: prev_bits,
                time: 1_001,
            }),
            Some(TargetPoint {
                bits: prev_bits,
                time: 1_000,
            }),
            &params.pow_limit,
            &params,
        )
        .expect("fast");
        assert!(compact_to_u256(fast).unwrap() < compact_to_u256(prev_bits).unwrap());
    }

    #[test]
    fn slow_blocks_are_capped_at_limit() {
        let params = consensus_params(Network::Mainnet);
        let limit_bits = target_to_compact(&params.pow_limit);
        let bits = next_target_required(
            Some(TargetPoint {
                bits: limit_bits,
                time: 100_000,
            }),
            Some(TargetPoint {
                bits: limit_bits,
                time: 0,
            }),
            &params.pow_limit,
            &params,
        )
        .expect("bits");
        assert_eq!(bits, limit_bits);
        assert_eq!(next_target_required(None, None, &params.pow_limit, &params), Ok(limit_bits));
    }
}
