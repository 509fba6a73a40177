//! Ledger parameter definitions and per-network presets.

use std::fmt;
use std::time::Duration;

use crate::constants::{
    COINBASE_MATURITY, DEFAULT_COMMIT_RETRIES, DEFAULT_MAX_ORPHANS, DEFAULT_MAX_PENDING,
    DEFAULT_ORPHAN_RETENTION_SECS, DEFAULT_PENDING_RETENTION_SECS,
};
use crate::Hash256;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
}

impl Network {
    pub fn as_str(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Testnet => "testnet",
            Network::Regtest => "regtest",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Network::Mainnet),
            "testnet" | "test" => Some(Network::Testnet),
            "regtest" => Some(Network::Regtest),
            _ => None,
        }
    }
}

/// Rule used to decide whether a competing branch replaces the canonical one.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForkChoice {
    /// Highest accumulated difficulty wins.
    CumulativeDifficulty,
    /// Longest chain wins.
    Height,
}

impl ForkChoice {
    pub fn as_str(self) -> &'static str {
        match self {
            ForkChoice::CumulativeDifficulty => "work",
            ForkChoice::Height => "height",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "work" | "chainwork" | "difficulty" => Some(ForkChoice::CumulativeDifficulty),
            "height" | "length" => Some(ForkChoice::Height),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LedgerParams {
    pub network: Network,
    pub coinbase_maturity: u32,
    pub fork_choice: ForkChoice,
    pub orphan_retention: Duration,
    pub max_orphans: usize,
    /// Pending pool capacity; submissions beyond it are refused.
    pub max_pending: usize,
    pub pending_retention: Duration,
    /// `None` allows reorganizations of any depth.
    pub max_reorg_depth: Option<u32>,
    pub commit_retries: u32,
    pub reconcile_after_reorg: bool,
}

pub fn ledger_params(network: Network) -> LedgerParams {
    match network {
        Network::Mainnet => LedgerParams {
            network,
            coinbase_maturity: COINBASE_MATURITY,
            fork_choice: ForkChoice::CumulativeDifficulty,
            orphan_retention: Duration::from_secs(DEFAULT_ORPHAN_RETENTION_SECS),
            max_orphans: DEFAULT_MAX_ORPHANS,
            max_pending: DEFAULT_MAX_PENDING,
            pending_retention: Duration::from_secs(DEFAULT_PENDING_RETENTION_SECS),
            max_reorg_depth: None,
            commit_retries: DEFAULT_COMMIT_RETRIES,
            reconcile_after_reorg: true,
        },
        Network::Testnet => LedgerParams {
            network,
            coinbase_maturity: COINBASE_MATURITY,
            fork_choice: ForkChoice::CumulativeDifficulty,
            orphan_retention: Duration::from_secs(DEFAULT_ORPHAN_RETENTION_SECS),
            max_orphans: DEFAULT_MAX_ORPHANS,
            max_pending: DEFAULT_MAX_PENDING,
            pending_retention: Duration::from_secs(DEFAULT_PENDING_RETENTION_SECS),
            max_reorg_depth: None,
            commit_retries: DEFAULT_COMMIT_RETRIES,
            reconcile_after_reorg: true,
        },
        Network::Regtest => LedgerParams {
            network,
            coinbase_maturity: 1,
            fork_choice: ForkChoice::CumulativeDifficulty,
            orphan_retention: Duration::from_secs(60),
            max_orphans: 1_000,
            max_pending: 1_000,
            pending_retention: Duration::from_secs(60 * 60),
            max_reorg_depth: None,
            commit_retries: 1,
            reconcile_after_reorg: true,
        },
    }
}

#[derive(Debug, Eq, PartialEq)]
pub enum HexError {
    InvalidLength,
    InvalidHex,
}

impl fmt::Display for HexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HexError::InvalidLength => write!(f, "hash must be 64 hex characters"),
            HexError::InvalidHex => write!(f, "invalid hex digit"),
        }
    }
}

impl std::error::Error for HexError {}

/// Parses a display-order (byte reversed) hex hash.
pub fn hash256_from_hex(input: &str) -> Result<Hash256, HexError> {
    let mut hex = input.trim();
    if let Some(stripped) = hex.strip_prefix("0x").or_else(|| hex.strip_prefix("0X")) {
        hex = stripped;
    }
    if hex.len() != 64 {
        return Err(HexError::InvalidLength);
    }
    if !hex.is_ascii() {
        return Err(HexError::InvalidHex);
    }

    let mut bytes = [0u8; 32];
    for (i, byte_out) in bytes.iter_mut().enumerate() {
        let start = i * 2;
        *byte_out =
            u8::from_str_radix(&hex[start..start + 2], 16).map_err(|_| HexError::InvalidHex)?;
    }
    bytes.reverse();
    Ok(bytes)
}

pub fn hash256_to_hex(hash: &Hash256) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(64);
    for byte in hash.iter().rev() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
