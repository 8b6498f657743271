//! Block import from `bootstrap.dat` and `-loadblock` files.
//!
//! Files hold `magic ++ size u32 LE ++ block` records, possibly separated by junk. The
//! scanner resynchronizes on the network magic, so a truncated or corrupt record costs
//! only that record.

use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use beand_consensus::constants::MAX_BLOCK_SIZE;

use crate::state::{Acceptance, AcceptanceResult};
use crate::validation::RejectKind;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ImportStats {
    pub records: u64,
    pub accepted: u64,
    pub already_known: u64,
    pub rejected: u64,
    /// Bytes passed over while searching for the magic.
    pub skipped_bytes: u64,
    pub interrupted: bool,
}

#[derive(Debug)]
pub enum ImportError {
    Io(std::io::Error),
    /// The chain state stopped accepting blocks.
    Halted(String),
}

impl std::fmt::Display for ImportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImportError::Io(err) => write!(f, "{err}"),
            ImportError::Halted(reason) => write!(f, "import stopped: {reason}"),
        }
    }
}

impl std::error::Error for ImportError {}

impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        ImportError::Io(err)
    }
}

pub fn import_file(
    path: &Path,
    magic: [u8; 4],
    shutdown: &AtomicBool,
    submit: impl FnMut(&[u8]) -> AcceptanceResult,
) -> Result<ImportStats, ImportError> {
    beand_log::log_info!("importing blocks from {}", path.display());
    let file = File::open(path)?;
    let stats = import_blocks(BufReader::new(file), magic, shutdown, submit)?;
    beand_log::log_info!(
        "imported {} of {} blocks from {} ({} known, {} rejected)",
        stats.accepted,
        stats.records,
        path.display(),
        stats.already_known,
        stats.rejected
    );
    Ok(stats)
}

/// Feeds every record in `reader` to `submit`, checking `shutdown` between records.
pub fn import_blocks<R: Read>(
    mut reader: R,
    magic: [u8; 4],
    shutdown: &AtomicBool,
    mut submit: impl FnMut(&[u8]) -> AcceptanceResult,
) -> Result<ImportStats, ImportError> {
    let mut stats = ImportStats::default();
    let mut window = [0u8; 4];
    let mut filled = 0usize;

    loop {
        if shutdown.load(Ordering::SeqCst) {
            stats.interrupted = true;
            return Ok(stats);
        }

        let Some(byte) = read_byte(&mut reader)? else {
            stats.skipped_bytes += filled as u64;
            return Ok(stats);
        };
        window.rotate_left(1);
        window[3] = byte;
        filled += 1;
        if filled < 4 || window != magic {
            continue;
        }
        stats.skipped_bytes += (filled - 4) as u64;
        filled = 0;

        let mut size_bytes = [0u8; 4];
        if !read_exact_or_eof(&mut reader, &mut size_bytes)? {
            return Ok(stats);
        }
        let size = u32::from_le_bytes(size_bytes);
        if size == 0 || size > MAX_BLOCK_SIZE {
            beand_log::log_debug!("skipping record with size {size}");
            continue;
        }
        let mut payload = vec![0u8; size as usize];
        if !read_exact_or_eof(&mut reader, &mut payload)? {
            beand_log::log_warn!("truncated block record at end of import file");
            return Ok(stats);
        }

        stats.records += 1;
        match submit(&payload) {
            Ok(Acceptance::Accepted(_)) => stats.accepted += 1,
            Ok(Acceptance::AlreadyKnown(_)) => stats.already_known += 1,
            Err(rejection) if rejection.kind == RejectKind::StorageFailure => {
                return Err(ImportError::Halted(rejection.reason));
            }
            Err(rejection) => {
                if rejection.kind != RejectKind::UnknownParent {
                    beand_log::log_debug!("import rejected block: {rejection}");
                }
                stats.rejected += 1;
            }
        }
    }
}

fn read_byte<R: Read>(reader: &mut R) -> Result<Option<u8>, std::io::Error> {
    let mut byte = [0u8; 1];
    Ok(read_exact_or_eof(reader, &mut byte)?.then_some(byte[0]))
}

/// `false` when the reader ends before `buf` is full.
fn read_exact_or_eof<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<bool, std::io::Error> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Rejection;

    const MAGIC: [u8; 4] = [0x70, 0x35, 0x22, 0x05];

    fn record(payload: &[u8]) -> Vec<u8> {
        let mut out = MAGIC.to_vec();
        out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn scanner_resyncs_past_junk_and_bad_sizes() {
        let mut data = vec![0xde, 0xad, 0x70, 0x35];
        data.extend(record(b"first"));
        data.extend(MAGIC);
        data.extend(0u32.to_le_bytes());
        data.extend([1, 2, 3]);
        data.extend(record(b"second"));
        data.extend(MAGIC);
        data.extend(10u32.to_le_bytes());
        data.extend(b"short");

        let mut seen = Vec::new();
        let stats = import_blocks(data.as_slice(), MAGIC, &AtomicBool::new(false), |bytes| {
            seen.push(bytes.to_vec());
            Ok(Acceptance::Accepted([seen.len() as u8; 32]))
        })
        .expect("import");
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.accepted, 2);
        assert_eq!(stats.skipped_bytes, 7);
    }

    #[test]
    fn storage_failure_stops_import() {
        let mut data = record(b"a");
        data.extend(record(b"b"));
        let mut calls = 0;
        let err = import_blocks(data.as_slice(), MAGIC, &AtomicBool::new(false), |_| {
            calls += 1;
            Err(Rejection::new(RejectKind::StorageFailure, "disk gone"))
        })
        .expect_err("halted");
        assert!(matches!(err, ImportError::Halted(_)));
        assert_eq!(calls, 1);
    }

    #[test]
    fn shutdown_is_observed_between_records() {
        let data = record(b"a");
        let stats = import_blocks(data.as_slice(), MAGIC, &AtomicBool::new(true), |_| {
            panic!("nothing should be submitted after shutdown")
        })
        .expect("import");
        assert!(stats.interrupted);
        assert_eq!(stats.records, 0);
    }
}
