//! Key/value persistence contract used by the chain-state engine.
//!
//! Everything the engine persists goes through [`KeyValueStore`]. Multi-key updates are
//! expressed as a [`WriteBatch`] that a backend must apply all-or-nothing.

use std::fmt;
use std::sync::Arc;

use smallvec::SmallVec;

pub mod memory;

#[cfg(feature = "fjall")]
pub mod fjall;

/// Failure reported by a backend. The chain state treats any of these as fatal.
#[derive(Debug)]
pub enum StoreError {
    Backend(String),
    /// Raised by [`memory::MemoryStore`] when write failure injection is on.
    Injected,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(message) => f.write_str(message),
            StoreError::Injected => f.write_str("injected storage failure"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Logical key spaces. Each maps to one fjall partition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
#[repr(u8)]
pub enum Column {
    /// hash -> encoded block index record
    BlockIndex = 0,
    /// height (BE) -> hash, active chain only
    HeightIndex = 1,
    /// txid ++ vout (LE) -> encoded UTXO entry
    Utxo = 2,
    Meta = 3,
    /// `latest` -> most recent accepted signed checkpoint
    Checkpoint = 4,
    /// flat-file bookkeeping
    FileMeta = 5,
}

impl Column {
    pub const ALL: [Column; 6] = [
        Column::BlockIndex,
        Column::HeightIndex,
        Column::Utxo,
        Column::Meta,
        Column::Checkpoint,
        Column::FileMeta,
    ];

    pub const fn index(self) -> usize {
        self as usize
    }

    pub fn name(self) -> &'static str {
        match self {
            Column::BlockIndex => "blkindex",
            Column::HeightIndex => "heights",
            Column::Utxo => "coins",
            Column::Meta => "meta",
            Column::Checkpoint => "sync_checkpoints",
            Column::FileMeta => "blockfiles",
        }
    }
}

/// Byte string kept inline up to `N` bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InlineBytes<const N: usize>(SmallVec<[u8; N]>);

impl<const N: usize> InlineBytes<N> {
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }
}

impl<const N: usize> From<Vec<u8>> for InlineBytes<N> {
    fn from(bytes: Vec<u8>) -> Self {
        Self(SmallVec::from_vec(bytes))
    }
}

impl<const N: usize> From<&[u8]> for InlineBytes<N> {
    fn from(bytes: &[u8]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }
}

impl<const N: usize, const M: usize> From<[u8; M]> for InlineBytes<N> {
    fn from(bytes: [u8; M]) -> Self {
        Self(SmallVec::from_slice(&bytes))
    }
}

impl<const N: usize, const M: usize> From<&[u8; M]> for InlineBytes<N> {
    fn from(bytes: &[u8; M]) -> Self {
        Self(SmallVec::from_slice(bytes))
    }
}

/// Keys fit a txid plus a vout index inline.
pub type WriteKey = InlineBytes<40>;
pub type WriteValue = InlineBytes<64>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteOp {
    Put {
        column: Column,
        key: WriteKey,
        value: WriteValue,
    },
    Delete {
        column: Column,
        key: WriteKey,
    },
}

/// Ordered list of mutations applied atomically by [`KeyValueStore::write_batch`].
#[derive(Clone, Debug, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, column: Column, key: impl Into<WriteKey>, value: impl Into<WriteValue>) {
        let (key, value) = (key.into(), value.into());
        self.ops.push(WriteOp::Put { column, key, value });
    }

    pub fn delete(&mut self, column: Column, key: impl Into<WriteKey>) {
        let key = key.into();
        self.ops.push(WriteOp::Delete { column, key });
    }

    /// Appends every op of `other`, preserving order.
    pub fn extend(&mut self, other: WriteBatch) {
        self.ops.extend(other.ops);
    }

    pub fn iter(&self) -> std::slice::Iter<'_, WriteOp> {
        self.ops.iter()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

pub type ScanResult = Vec<(Vec<u8>, Vec<u8>)>;
pub type PrefixVisitor<'a> = dyn FnMut(&[u8], &[u8]) -> Result<(), StoreError> + 'a;

pub trait KeyValueStore: Send + Sync {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError>;

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError>;

    /// Visits every entry of `column` whose key starts with `prefix`, in key order.
    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError>;

    /// Applies the whole batch or nothing.
    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError>;

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        let mut entries = Vec::new();
        self.for_each_prefix(column, prefix, &mut |key, value| {
            entries.push((key.to_vec(), value.to_vec()));
            Ok(())
        })?;
        Ok(entries)
    }
}

impl<T: KeyValueStore + ?Sized> KeyValueStore for Arc<T> {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        (**self).get(column, key)
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        (**self).put(column, key, value)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        (**self).delete(column, key)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        (**self).for_each_prefix(column, prefix, visitor)
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        (**self).write_batch(batch)
    }

    fn scan_prefix(&self, column: Column, prefix: &[u8]) -> Result<ScanResult, StoreError> {
        (**self).scan_prefix(column, prefix)
    }
}
