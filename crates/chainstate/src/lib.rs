//! Ledger chain state: block index, UTXO set, undo records, wallets and the
//! chain linker that drives them.

pub mod address_index;
pub mod balance;
pub mod blockstore;
pub mod confirmations;
pub mod error;
pub mod index;
pub mod linker;
pub mod orphans;
pub mod pending;
pub mod spentindex;
pub mod state;
pub mod txindex;
pub mod undo;
pub mod utxo;
pub mod validation;
pub mod wallet;

pub use error::ChainStateError;
pub use linker::{BlockSubmission, ChainLinker, LinkerStatus, SubmitOutcome};
pub use state::{ChainState, TxAdmission};
