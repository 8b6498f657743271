//! Checkpoint records and enforcement policy.

use std::fmt;

use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Checkpoint {
    pub height: i32,
    pub hash: Hash256,
}

/// How a checkpoint conflict affects acceptance of a competing chain.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum CheckpointMode {
    /// Reject any reorganization that disconnects a checkpointed block.
    #[default]
    Strict,
    /// Warn and accept.
    Advisory,
    /// Ignore checkpoints for acceptance decisions.
    Permissive,
}

impl CheckpointMode {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(Self::Strict),
            "advisory" => Some(Self::Advisory),
            "permissive" => Some(Self::Permissive),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Strict => "strict",
            Self::Advisory => "advisory",
            Self::Permissive => "permissive",
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_policy_names() {
        assert_eq!(CheckpointMode::parse("strict"), Some(CheckpointMode::Strict));
        assert_eq!(CheckpointMode::parse("ADVISORY"), Some(CheckpointMode::Advisory));
        assert_eq!(
            CheckpointMode::parse(" permissive "),
            Some(CheckpointMode::Permissive)
        );
        assert_eq!(CheckpointMode::parse("lenient"), None);
        assert_eq!(CheckpointMode::default(), CheckpointMode::Strict);
    }
}
