//! Checkpoint enforcement: hard-coded checkpoints from the network parameters plus the
//! latest signed checkpoint received from the network key holder.

use std::fmt;

use beand_consensus::{hash256_to_hex, Checkpoint, CheckpointMode, ConsensusParams, Hash256};
use beand_primitives::encoding::{DecodeError, Decoder, Encoder};
use beand_primitives::sha256d;
use beand_stake::signature::{sign_digest, verify_digest};
use beand_stake::StakeError;
use beand_storage::{Column, KeyValueStore, StoreError, WriteBatch};

const SIGNED_CHECKPOINT_KEY: &[u8] = b"latest";

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum CheckpointError {
    HashMismatch {
        height: i32,
        expected: Hash256,
        found: Hash256,
    },
    ReorgBelowCheckpoint {
        checkpoint_height: i32,
        fork_height: i32,
    },
    BadSignature,
    Malformed,
}

impl fmt::Display for CheckpointError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckpointError::HashMismatch {
                height,
                expected,
                found,
            } => write!(
                f,
                "block {} at height {height} conflicts with checkpoint {}",
                hash256_to_hex(found),
                hash256_to_hex(expected)
            ),
            CheckpointError::ReorgBelowCheckpoint {
                checkpoint_height,
                fork_height,
            } => write!(
                f,
                "reorganization from height {fork_height} would disconnect checkpoint at height {checkpoint_height}"
            ),
            CheckpointError::BadSignature => write!(f, "checkpoint signature invalid"),
            CheckpointError::Malformed => write!(f, "malformed checkpoint message"),
        }
    }
}

impl std::error::Error for CheckpointError {}

/// A checkpoint authenticated by the network checkpoint key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SignedCheckpoint {
    pub height: i32,
    pub hash: Hash256,
    pub signature: Vec<u8>,
}

impl SignedCheckpoint {
    pub fn digest(height: i32, hash: &Hash256) -> Hash256 {
        let mut message = Vec::with_capacity(36);
        message.extend_from_slice(&(height as u32).to_le_bytes());
        message.extend_from_slice(hash);
        sha256d(&message)
    }

    pub fn sign(height: i32, hash: Hash256, secret: &[u8; 32]) -> Result<Self, StakeError> {
        let signature = sign_digest(&Self::digest(height, &hash), secret)?;
        Ok(Self {
            height,
            hash,
            signature,
        })
    }

    pub fn verify(&self, pubkey: &[u8]) -> bool {
        self.height >= 0
            && verify_digest(&Self::digest(self.height, &self.hash), &self.signature, pubkey)
    }

    pub fn checkpoint(&self) -> Checkpoint {
        Checkpoint {
            height: self.height,
            hash: self.hash,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(40 + self.signature.len());
        encoder.write_i32_le(self.height);
        encoder.write_bytes(&self.hash);
        encoder.write_var_bytes(&self.signature);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let mut decoder = Decoder::new(bytes);
        let height = decoder.read_i32_le()?;
        let hash = decoder.read_fixed::<32>()?;
        let signature = decoder.read_var_bytes()?;
        if !decoder.is_empty() {
            return Err(DecodeError::TrailingBytes);
        }
        Ok(Self {
            height,
            hash,
            signature,
        })
    }
}

pub struct CheckpointEnforcer {
    mode: CheckpointMode,
    hard: Vec<Checkpoint>,
    pubkey: Vec<u8>,
    signed: Option<SignedCheckpoint>,
}

impl CheckpointEnforcer {
    pub fn new(mode: CheckpointMode, mut hard: Vec<Checkpoint>, pubkey: Vec<u8>) -> Self {
        hard.sort_by_key(|checkpoint| checkpoint.height);
        Self {
            mode,
            hard,
            pubkey,
            signed: None,
        }
    }

    pub fn from_params(mode: CheckpointMode, params: &ConsensusParams) -> Self {
        Self::new(mode, params.checkpoints.clone(), params.checkpoint_pubkey.clone())
    }

    pub fn mode(&self) -> CheckpointMode {
        self.mode
    }

    pub fn signed(&self) -> Option<&SignedCheckpoint> {
        self.signed.as_ref()
    }

    fn all(&self) -> impl Iterator<Item = Checkpoint> + '_ {
        self.hard
            .iter()
            .copied()
            .chain(self.signed.iter().map(SignedCheckpoint::checkpoint))
    }

    /// Highest checkpoint at or below `height`.
    pub fn latest_at_or_below(&self, height: i32) -> Option<Checkpoint> {
        self.all()
            .filter(|checkpoint| checkpoint.height <= height)
            .max_by_key(|checkpoint| checkpoint.height)
    }

    /// Checks a block's hash against any checkpoint at its height.
    pub fn check_block(&self, height: i32, hash: &Hash256) -> Result<(), CheckpointError> {
        let conflict = self
            .all()
            .find(|checkpoint| checkpoint.height == height && checkpoint.hash != *hash);
        match conflict {
            Some(checkpoint) => self.enforce(CheckpointError::HashMismatch {
                height,
                expected: checkpoint.hash,
                found: *hash,
            }),
            None => Ok(()),
        }
    }

    /// Checks a plan that disconnects every active block above `fork_height` and connects
    /// a candidate branch. `active_at` and `candidate_at` give the hash each chain holds at
    /// a height, or `None` when it does not reach it.
    ///
    /// The plan conflicts when it disconnects a checkpointed block or when the candidate
    /// holds a different block at a checkpoint height.
    pub fn check_reorg(
        &self,
        fork_height: i32,
        active_at: impl Fn(i32) -> Option<Hash256>,
        candidate_at: impl Fn(i32) -> Option<Hash256>,
    ) -> Result<(), CheckpointError> {
        for checkpoint in self.all().filter(|checkpoint| checkpoint.height > fork_height) {
            if active_at(checkpoint.height) == Some(checkpoint.hash) {
                self.enforce(CheckpointError::ReorgBelowCheckpoint {
                    checkpoint_height: checkpoint.height,
                    fork_height,
                })?;
                continue;
            }
            if let Some(found) = candidate_at(checkpoint.height) {
                if found != checkpoint.hash {
                    self.enforce(CheckpointError::HashMismatch {
                        height: checkpoint.height,
                        expected: checkpoint.hash,
                        found,
                    })?;
                }
            }
        }
        Ok(())
    }

    fn enforce(&self, err: CheckpointError) -> Result<(), CheckpointError> {
        match self.mode {
            CheckpointMode::Strict => Err(err),
            CheckpointMode::Advisory => {
                beand_log::log_warn!("checkpoint advisory: {err}");
                Ok(())
            }
            CheckpointMode::Permissive => Ok(()),
        }
    }

    /// Whether `checkpoint` is authentic and newer than the current one.
    pub fn supersedes(&self, checkpoint: &SignedCheckpoint) -> Result<bool, CheckpointError> {
        if !checkpoint.verify(&self.pubkey) {
            return Err(CheckpointError::BadSignature);
        }
        Ok(self
            .signed
            .as_ref()
            .map_or(true, |current| current.height < checkpoint.height))
    }

    /// Accepts `checkpoint` if it is authentic and newer than the current one.
    /// Returns whether it replaced the current checkpoint.
    pub fn accept_signed(&mut self, checkpoint: SignedCheckpoint) -> Result<bool, CheckpointError> {
        if !self.supersedes(&checkpoint)? {
            return Ok(false);
        }
        self.signed = Some(checkpoint);
        Ok(true)
    }
}

pub fn load_signed_checkpoint<S: KeyValueStore>(
    store: &S,
) -> Result<Option<SignedCheckpoint>, StoreError> {
    match store.get(Column::Checkpoint, SIGNED_CHECKPOINT_KEY)? {
        Some(bytes) => SignedCheckpoint::decode(&bytes)
            .map(Some)
            .map_err(|err| StoreError::Backend(format!("invalid signed checkpoint: {err}"))),
        None => Ok(None),
    }
}

pub fn put_signed_checkpoint(batch: &mut WriteBatch, checkpoint: &SignedCheckpoint) {
    batch.put(Column::Checkpoint, SIGNED_CHECKPOINT_KEY, checkpoint.encode());
}

#[cfg(test)]
mod tests {
    use super::*;
    use beand_stake::signature::public_key;

    const SECRET: [u8; 32] = [0x42; 32];

    fn enforcer(mode: CheckpointMode) -> CheckpointEnforcer {
        let pubkey = public_key(&SECRET).expect("pubkey").to_vec();
        CheckpointEnforcer::new(
            mode,
            vec![Checkpoint {
                height: 10,
                hash: [0xaa; 32],
            }],
            pubkey,
        )
    }

    #[test]
    fn strict_mode_rejects_conflicts() {
        let strict = enforcer(CheckpointMode::Strict);
        assert!(strict.check_block(10, &[0xaa; 32]).is_ok());
        assert!(strict.check_block(11, &[0xbb; 32]).is_ok());
        assert!(matches!(
            strict.check_block(10, &[0xbb; 32]),
            Err(CheckpointError::HashMismatch { height: 10, .. })
        ));
    }

    /// A chain of identical hashes up to height 20.
    fn chain(tag: u8) -> impl Fn(i32) -> Option<Hash256> {
        move |height| (0..=20).contains(&height).then_some([tag; 32])
    }

    #[test]
    fn strict_mode_guards_the_checkpointed_block() {
        let strict = enforcer(CheckpointMode::Strict);
        // Fork above the checkpoint.
        assert!(strict.check_reorg(10, chain(0xaa), chain(0xbb)).is_ok());
        assert!(matches!(
            strict.check_reorg(9, chain(0xaa), chain(0xbb)),
            Err(CheckpointError::ReorgBelowCheckpoint {
                checkpoint_height: 10,
                fork_height: 9
            })
        ));
        // Active chain does not reach the checkpoint and the candidate stops short of it.
        let short = |height: i32| (height <= 9).then_some([0xbb; 32]);
        assert!(strict.check_reorg(5, |_| None, short).is_ok());
        // Active chain holds a conflicting block; the candidate carries the checkpoint.
        assert!(strict.check_reorg(5, chain(0xcc), chain(0xaa)).is_ok());
        assert!(matches!(
            strict.check_reorg(5, chain(0xcc), chain(0xdd)),
            Err(CheckpointError::HashMismatch { height: 10, .. })
        ));
    }

    #[test]
    fn advisory_and_permissive_accept() {
        for mode in [CheckpointMode::Advisory, CheckpointMode::Permissive] {
            let relaxed = enforcer(mode);
            assert!(relaxed.check_block(10, &[0xbb; 32]).is_ok());
            assert!(relaxed.check_reorg(0, chain(0xaa), chain(0xbb)).is_ok());
        }
    }

    #[test]
    fn signed_checkpoints_need_the_network_key() {
        let mut strict = enforcer(CheckpointMode::Strict);
        let forged = SignedCheckpoint::sign(20, [0xcc; 32], &[0x07; 32]).expect("sign");
        assert_eq!(strict.accept_signed(forged), Err(CheckpointError::BadSignature));

        let genuine = SignedCheckpoint::sign(20, [0xcc; 32], &SECRET).expect("sign");
        assert_eq!(strict.accept_signed(genuine.clone()), Ok(true));
        assert_eq!(strict.latest_at_or_below(25).map(|c| c.height), Some(20));
        assert!(strict.check_block(20, &[0xdd; 32]).is_err());

        let older = SignedCheckpoint::sign(15, [0xee; 32], &SECRET).expect("sign");
        assert_eq!(strict.accept_signed(older), Ok(false));
        assert_eq!(strict.signed(), Some(&genuine));
        assert_eq!(SignedCheckpoint::decode(&genuine.encode()), Ok(genuine));
    }

    #[test]
    fn signed_checkpoint_persists() {
        let store = beand_storage::memory::MemoryStore::new();
        assert_eq!(load_signed_checkpoint(&store).expect("load"), None);
        let checkpoint = SignedCheckpoint::sign(3, [0x11; 32], &SECRET).expect("sign");
        let mut batch = WriteBatch::new();
        put_signed_checkpoint(&mut batch, &checkpoint);
        store.write_batch(&batch).expect("commit");
        assert_eq!(load_signed_checkpoint(&store).expect("load"), Some(checkpoint));
    }
}
