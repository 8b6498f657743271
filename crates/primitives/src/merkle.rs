//! Transaction merkle tree.

use beand_consensus::Hash256;

use crate::hash::sha256d;

/// Computes the merkle root of `leaves`.
///
/// The second value reports whether two identical siblings were hashed together at any
/// level, which lets a different transaction list produce the same root.
pub fn merkle_root(leaves: &[Hash256]) -> (Hash256, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut level: Vec<Hash256> = leaves.to_vec();
    let mut mutated = false;
    let mut buf = [0u8; 64];
    while level.len() > 1 {
        for pair in level.chunks(2) {
            if pair.len() == 2 && pair[0] == pair[1] {
                mutated = true;
            }
        }
        if level.len() % 2 == 1 {
            if let Some(last) = level.last().copied() {
                level.push(last);
            }
        }
        level = level
            .chunks(2)
            .map(|pair| {
                buf[..32].copy_from_slice(&pair[0]);
                buf[32..].copy_from_slice(&pair[1]);
                sha256d(&buf)
            })
            .collect();
    }
    (level[0], mutated)
}
