//! Durable backend: one fjall partition per [`Column`].

use std::path::Path;
use std::time::{Duration, Instant};

use fjall::{Batch, Config, Keyspace, PartitionCreateOptions, PartitionHandle, PersistMode};

use crate::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch, WriteOp};

const SLOW_COMMIT: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct FjallOptions {
    pub cache_bytes: Option<u64>,
    pub memtable_bytes: Option<u32>,
    /// Fsync on every batch commit.
    pub sync_batches: bool,
}

impl Default for FjallOptions {
    fn default() -> Self {
        Self {
            cache_bytes: None,
            memtable_bytes: None,
            sync_batches: true,
        }
    }
}

pub struct FjallStore {
    keyspace: Keyspace,
    partitions: [PartitionHandle; Column::ALL.len()],
    persist: PersistMode,
}

impl FjallStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::open_with_options(path, FjallOptions::default())
    }

    pub fn open_with_options(
        path: impl AsRef<Path>,
        options: FjallOptions,
    ) -> Result<Self, StoreError> {
        let config = match options.cache_bytes {
            Some(bytes) => Config::new(path).cache_size(bytes),
            None => Config::new(path),
        };
        let partition_options = match options.memtable_bytes {
            Some(bytes) => PartitionCreateOptions::default().max_memtable_size(bytes),
            None => PartitionCreateOptions::default(),
        };
        let keyspace = config.open().map_err(backend)?;

        let mut opened = Vec::with_capacity(Column::ALL.len());
        for column in Column::ALL {
            opened.push(
                keyspace
                    .open_partition(column.name(), partition_options.clone())
                    .map_err(backend)?,
            );
        }
        let partitions = opened
            .try_into()
            .map_err(|_| StoreError::Backend("partition count mismatch".to_string()))?;

        let persist = if options.sync_batches {
            PersistMode::SyncAll
        } else {
            PersistMode::Buffer
        };
        Ok(Self {
            keyspace,
            partitions,
            persist,
        })
    }

    fn partition(&self, column: Column) -> &PartitionHandle {
        &self.partitions[column.index()]
    }
}

impl KeyValueStore for FjallStore {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        let slice = self.partition(column).get(key).map_err(backend)?;
        Ok(slice.map(|value| value.to_vec()))
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.partition(column).insert(key, value).map_err(backend)
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        self.partition(column).remove(key).map_err(backend)
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        for item in self.partition(column).prefix(prefix) {
            let (key, value) = item.map_err(backend)?;
            visitor(key.as_ref(), value.as_ref())?;
        }
        Ok(())
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut pending = Batch::with_capacity(self.keyspace.clone(), batch.len())
            .durability(Some(self.persist));
        for op in batch.iter() {
            match op {
                WriteOp::Put { column, key, value } => {
                    pending.insert(self.partition(*column), key.as_slice(), value.as_slice())
                }
                WriteOp::Delete { column, key } => {
                    pending.remove(self.partition(*column), key.as_slice())
                }
            }
        }
        let started = Instant::now();
        pending.commit().map_err(backend)?;
        let took = started.elapsed();
        if took >= SLOW_COMMIT {
            beand_log::log_warn!(
                "slow fjall commit: {}ms for {} ops",
                took.as_millis(),
                batch.len()
            );
        }
        Ok(())
    }
}

fn backend(err: fjall::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
