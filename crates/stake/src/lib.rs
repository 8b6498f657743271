//! Proof-of-stake rules: kernel hash, stake modifier, coin age, rewards and block signatures.

pub mod kernel;
pub mod modifier;
pub mod reward;
pub mod signature;

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StakeError {
    /// The coinstake is older than the output it spends.
    TimestampViolation,
    /// The staked output has not reached the minimum stake age.
    StakeTooYoung,
    KernelAboveTarget,
    InvalidTarget,
    Signature(&'static str),
}

impl fmt::Display for StakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StakeError::TimestampViolation => write!(f, "coinstake predates its stake input"),
            StakeError::StakeTooYoung => write!(f, "stake input below minimum age"),
            StakeError::KernelAboveTarget => write!(f, "kernel hash does not meet stake target"),
            StakeError::InvalidTarget => write!(f, "invalid stake target"),
            StakeError::Signature(message) => write!(f, "{message}"),
        }
    }
}

impl std::error::Error for StakeError {}
