//! Consensus-wide constants shared across validation.

/// The maximum allowed size for a serialized block, in bytes (network rule).
pub const MAX_BLOCK_SIZE: u32 = 1_000_000;
/// The maximum allowed number of signature check operations in a block (network rule).
pub const MAX_BLOCK_SIGOPS: u32 = MAX_BLOCK_SIZE / 50;
/// The maximum size of a single transaction.
pub const MAX_TX_SIZE: u32 = MAX_BLOCK_SIZE;
/// Maximum script size (consensus).
pub const MAX_SCRIPT_SIZE: usize = 10_000;
/// The minimum allowed block version.
pub const MIN_BLOCK_VERSION: i32 = 1;
/// Blocks may not be timestamped further than this into the future, in seconds.
pub const MAX_FUTURE_BLOCK_TIME: u32 = 2 * 60 * 60;
/// Number of ancestors used for the median time past.
pub const MEDIAN_TIME_SPAN: usize = 11;
/// Lock times below this value are heights, above it unix timestamps.
pub const LOCKTIME_THRESHOLD: u32 = 500_000_000;
/// Upper bound on blocks held while their parent is unknown.
pub const MAX_ORPHAN_BLOCKS: usize = 750;
/// Coinbase scriptSig length bounds.
pub const MIN_COINBASE_SCRIPT_LEN: usize = 2;
pub const MAX_COINBASE_SCRIPT_LEN: usize = 100;
pub const SECONDS_PER_DAY: i64 = 24 * 60 * 60;
pub const DAYS_PER_YEAR: i64 = 365;
