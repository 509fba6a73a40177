//! Ledger-wide constants.

use crate::Hash256;

/// `prev_hash` carried by a genesis block.
pub const GENESIS_PREV_HASH: Hash256 = [0u8; 32];

/// Coinbase outputs can only be spent after this many blocks on mainnet.
pub const COINBASE_MATURITY: u32 = 100;

pub const DEFAULT_ORPHAN_RETENTION_SECS: u64 = 20 * 60;
pub const DEFAULT_MAX_ORPHANS: usize = 10_000;
pub const DEFAULT_MAX_PENDING: usize = 5_000;
/// Pending transactions older than this are dropped by the idle sweep.
pub const DEFAULT_PENDING_RETENTION_SECS: u64 = 14 * 24 * 60 * 60;
pub const DEFAULT_COMMIT_RETRIES: u32 = 3;
pub const COMMIT_RETRY_BACKOFF_MS: u64 = 50;

/// Upper bound on transactions carried by a single block.
pub const MAX_BLOCK_TRANSACTIONS: usize = 100_000;
/// Upper bound on inputs or outputs of a single transaction.
pub const MAX_TX_IO: usize = 10_000;
/// Longest accepted destination address string, in bytes.
pub const MAX_ADDRESS_LEN: usize = 128;
