use std::path::Path;

use beand_storage::fjall::{FjallOptions, FjallStore};
use beand_storage::memory::MemoryStore;
use beand_storage::{Column, KeyValueStore, PrefixVisitor, StoreError, WriteBatch};

use crate::config::Backend;

/// The backend picked by `-backend`, behind one concrete type for the chain state.
pub enum Store {
    Memory(MemoryStore),
    Fjall(FjallStore),
}

impl Store {
    pub fn open(backend: Backend, path: &Path) -> Result<Self, StoreError> {
        match backend {
            Backend::Memory => Ok(Store::Memory(MemoryStore::new())),
            Backend::Fjall => Ok(Store::Fjall(FjallStore::open_with_options(
                path,
                FjallOptions::default(),
            )?)),
        }
    }
}

impl KeyValueStore for Store {
    fn get(&self, column: Column, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        match self {
            Store::Memory(store) => store.get(column, key),
            Store::Fjall(store) => store.get(column, key),
        }
    }

    fn put(&self, column: Column, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.put(column, key, value),
            Store::Fjall(store) => store.put(column, key, value),
        }
    }

    fn delete(&self, column: Column, key: &[u8]) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.delete(column, key),
            Store::Fjall(store) => store.delete(column, key),
        }
    }

    fn for_each_prefix<'a>(
        &self,
        column: Column,
        prefix: &[u8],
        visitor: &mut PrefixVisitor<'a>,
    ) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.for_each_prefix(column, prefix, visitor),
            Store::Fjall(store) => store.for_each_prefix(column, prefix, visitor),
        }
    }

    fn write_batch(&self, batch: &WriteBatch) -> Result<(), StoreError> {
        match self {
            Store::Memory(store) => store.write_batch(batch),
            Store::Fjall(store) => store.write_batch(batch),
        }
    }
}
