//! Append-only record files (`blk00000.dat`, `rev00000.dat`, ...).
//!
//! Every record is `magic[4] ++ len u32 LE ++ payload`, the same framing the import
//! scanner reads, so block files can be fed back through `-loadblock`.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use beand_primitives::encoding::{Decodable, DecodeError, Decoder, Encodable, Encoder};

const FRAME_LEN: u64 = 8;

/// Position of a record: the offset of its magic bytes and the payload length.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FileLocation {
    pub file_id: u32,
    pub offset: u64,
    pub len: u32,
}

impl Encodable for FileLocation {
    fn consensus_encode(&self, encoder: &mut Encoder) {
        encoder.write_u32_le(self.file_id);
        encoder.write_u64_le(self.offset);
        encoder.write_u32_le(self.len);
    }
}

impl Decodable for FileLocation {
    fn consensus_decode(decoder: &mut Decoder) -> Result<Self, DecodeError> {
        Ok(Self {
            file_id: decoder.read_u32_le()?,
            offset: decoder.read_u64_le()?,
            len: decoder.read_u32_le()?,
        })
    }
}

#[derive(Debug)]
pub enum FlatFileError {
    Io(io::Error),
    InvalidLocation,
    LengthMismatch,
    BadMagic,
    Poisoned,
}

impl fmt::Display for FlatFileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlatFileError::Io(err) => write!(f, "block file: {err}"),
            FlatFileError::InvalidLocation => f.write_str("record location out of range"),
            FlatFileError::LengthMismatch => f.write_str("record length differs from index"),
            FlatFileError::BadMagic => f.write_str("record framed with another network's magic"),
            FlatFileError::Poisoned => f.write_str("block file writer lock poisoned"),
        }
    }
}

impl std::error::Error for FlatFileError {}

impl From<io::Error> for FlatFileError {
    fn from(err: io::Error) -> Self {
        FlatFileError::Io(err)
    }
}

/// One family of numbered record files sharing a name prefix.
pub struct FlatFileStore {
    dir: PathBuf,
    prefix: &'static str,
    magic: [u8; 4],
    max_file_size: u64,
    /// file being appended to and its length
    tail: Mutex<(u32, u64)>,
}

impl FlatFileStore {
    pub fn new(
        dir: impl Into<PathBuf>,
        prefix: &'static str,
        magic: [u8; 4],
        max_file_size: u64,
    ) -> Result<Self, FlatFileError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut store = Self {
            dir,
            prefix,
            magic,
            max_file_size,
            tail: Mutex::new((0, 0)),
        };
        store.tail = Mutex::new(store.find_tail()?);
        Ok(store)
    }

    pub fn append(&self, payload: &[u8]) -> Result<FileLocation, FlatFileError> {
        let len = u32::try_from(payload.len()).map_err(|_| FlatFileError::InvalidLocation)?;
        let framed = FRAME_LEN + u64::from(len);
        let mut tail = self.tail.lock().map_err(|_| FlatFileError::Poisoned)?;
        let (mut file_id, mut offset) = *tail;
        if offset > 0 && offset + framed > self.max_file_size {
            file_id += 1;
            offset = 0;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path(file_id))?;
        file.write_all(&self.magic)?;
        file.write_all(&len.to_le_bytes())?;
        file.write_all(payload)?;
        file.flush()?;

        *tail = (file_id, offset + framed);
        Ok(FileLocation {
            file_id,
            offset,
            len,
        })
    }

    pub fn read(&self, location: FileLocation) -> Result<Vec<u8>, FlatFileError> {
        if location.len == 0 {
            return Err(FlatFileError::InvalidLocation);
        }
        let mut file = File::open(self.file_path(location.file_id))?;
        file.seek(SeekFrom::Start(location.offset))?;
        let mut frame = [0u8; FRAME_LEN as usize];
        file.read_exact(&mut frame)?;
        let (magic, len) = frame.split_at(4);
        if magic != self.magic {
            return Err(FlatFileError::BadMagic);
        }
        if len != location.len.to_le_bytes() {
            return Err(FlatFileError::LengthMismatch);
        }
        let mut payload = vec![0u8; location.len as usize];
        file.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Paths of every file written so far, in order.
    pub fn file_paths(&self) -> Vec<PathBuf> {
        (0u32..)
            .map(|file_id| self.file_path(file_id))
            .take_while(|path| path.exists())
            .collect()
    }

    pub fn file_path(&self, file_id: u32) -> PathBuf {
        file_path(&self.dir, self.prefix, file_id)
    }

    fn find_tail(&self) -> Result<(u32, u64), FlatFileError> {
        let Some(last) = self.file_paths().len().checked_sub(1) else {
            return Ok((0, 0));
        };
        let last = u32::try_from(last).map_err(|_| FlatFileError::InvalidLocation)?;
        let len = fs::metadata(self.file_path(last))?.len();
        if len >= self.max_file_size {
            Ok((last + 1, 0))
        } else {
            Ok((last, len))
        }
    }
}

fn file_path(dir: &Path, prefix: &str, file_id: u32) -> PathBuf {
    dir.join(format!("{prefix}{file_id:05}.dat"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAGIC: [u8; 4] = [0xfa, 0xbf, 0xb5, 0xda];

    #[test]
    fn records_are_framed_with_magic_and_length() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path(), "blk", MAGIC, 1 << 20).expect("store");
        let first = store.append(b"hello").expect("append");
        let second = store.append(b"world!").expect("append");
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 13);
        assert_eq!(store.read(second).expect("read"), b"world!".to_vec());

        let raw = fs::read(store.file_path(0)).expect("raw");
        assert_eq!(raw[..4], MAGIC);
        assert_eq!(raw[4..8], 5u32.to_le_bytes());
        assert_eq!(&raw[8..13], b"hello");
    }

    #[test]
    fn rolls_to_next_file_and_resumes() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path(), "rev", MAGIC, 20).expect("store");
        let first = store.append(&[1u8; 10]).expect("append");
        let second = store.append(&[2u8; 10]).expect("append");
        assert_eq!((first.file_id, second.file_id), (0, 1));
        drop(store);

        let reopened = FlatFileStore::new(dir.path(), "rev", MAGIC, 20).expect("reopen");
        assert_eq!(reopened.read(first).expect("read"), vec![1u8; 10]);
        let third = reopened.append(&[3u8; 2]).expect("append");
        assert_eq!(third.file_id, 2);
        assert_eq!(reopened.file_paths().len(), 3);
    }

    #[test]
    fn foreign_magic_and_wrong_length_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = FlatFileStore::new(dir.path(), "blk", MAGIC, 1 << 20).expect("store");
        let location = store.append(b"payload").expect("append");
        let testnet = FlatFileStore::new(dir.path(), "blk", [0xa4, 0xd2, 0xf8, 0xa6], 1 << 20)
            .expect("store");
        assert!(matches!(testnet.read(location), Err(FlatFileError::BadMagic)));
        let short = FileLocation {
            len: 3,
            ..location
        };
        assert!(matches!(store.read(short), Err(FlatFileError::LengthMismatch)));
    }
}
