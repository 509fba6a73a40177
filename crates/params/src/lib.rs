//! Ledger parameters, network presets and monetary rules.

pub mod constants;
pub mod money;
pub mod params;

pub use params::{
    hash256_from_hex, hash256_to_hex, ledger_params, ForkChoice, HexError, LedgerParams, Network,
};

pub type Hash256 = [u8; 32];
