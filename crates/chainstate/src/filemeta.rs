//! Per-file statistics for block and undo flat files, kept in `Column::FileMeta`.

use beand_primitives::encoding::{Decoder, Encoder};
use beand_storage::{Column, KeyValueStore, StoreError, WriteBatch};

use crate::flatfiles::FileLocation;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum FileKind {
    Blocks,
    Undo,
}

impl FileKind {
    fn tag(self) -> u8 {
        match self {
            FileKind::Blocks => b'b',
            FileKind::Undo => b'u',
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FlatFileInfo {
    pub records: u32,
    pub size: u64,
    pub height_first: i32,
    pub height_last: i32,
    pub time_first: u32,
    pub time_last: u32,
}

impl FlatFileInfo {
    /// Accounts for a record written at `location` for a block at `height`.
    pub fn add_record(&mut self, location: FileLocation, height: i32, time: u32) {
        if self.records == 0 {
            self.height_first = height;
            self.height_last = height;
            self.time_first = time;
            self.time_last = time;
        } else {
            self.height_first = self.height_first.min(height);
            self.height_last = self.height_last.max(height);
            self.time_first = self.time_first.min(time);
            self.time_last = self.time_last.max(time);
        }
        self.records += 1;
        self.size = self.size.max(location.offset + 8 + u64::from(location.len));
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut encoder = Encoder::with_capacity(32);
        encoder.write_u32_le(self.records);
        encoder.write_u64_le(self.size);
        encoder.write_i32_le(self.height_first);
        encoder.write_i32_le(self.height_last);
        encoder.write_u32_le(self.time_first);
        encoder.write_u32_le(self.time_last);
        encoder.into_inner()
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let mut decoder = Decoder::new(bytes);
        let info = Self {
            records: decoder.read_u32_le().ok()?,
            size: decoder.read_u64_le().ok()?,
            height_first: decoder.read_i32_le().ok()?,
            height_last: decoder.read_i32_le().ok()?,
            time_first: decoder.read_u32_le().ok()?,
            time_last: decoder.read_u32_le().ok()?,
        };
        decoder.is_empty().then_some(info)
    }
}

pub fn file_info_key(kind: FileKind, file_id: u32) -> [u8; 5] {
    let mut key = [0u8; 5];
    key[0] = kind.tag();
    key[1..].copy_from_slice(&file_id.to_be_bytes());
    key
}

pub fn load_file_info<S: KeyValueStore>(
    store: &S,
    kind: FileKind,
    file_id: u32,
) -> Result<FlatFileInfo, StoreError> {
    match store.get(Column::FileMeta, &file_info_key(kind, file_id))? {
        Some(bytes) => FlatFileInfo::decode(&bytes)
            .ok_or_else(|| StoreError::Backend("invalid flat file info".to_string())),
        None => Ok(FlatFileInfo::default()),
    }
}

pub fn put_file_info(batch: &mut WriteBatch, kind: FileKind, file_id: u32, info: &FlatFileInfo) {
    batch.put(Column::FileMeta, file_info_key(kind, file_id), info.encode());
}

/// Every recorded file of `kind`, ordered by id.
pub fn scan_file_info<S: KeyValueStore>(
    store: &S,
    kind: FileKind,
) -> Result<Vec<(u32, FlatFileInfo)>, StoreError> {
    let mut out = Vec::new();
    for (key, value) in store.scan_prefix(Column::FileMeta, &[kind.tag()])? {
        let id_bytes: [u8; 4] = key
            .get(1..)
            .and_then(|bytes| bytes.try_into().ok())
            .ok_or_else(|| StoreError::Backend("invalid flat file info key".to_string()))?;
        let info = FlatFileInfo::decode(&value)
            .ok_or_else(|| StoreError::Backend("invalid flat file info".to_string()))?;
        out.push((u32::from_be_bytes(id_bytes), info));
    }
    Ok(out)
}
