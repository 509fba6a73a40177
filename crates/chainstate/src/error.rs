use std::fmt;

use ledgerd_params::{hash256_to_hex, Hash256};
use ledgerd_primitives::encoding::DecodeError;
use ledgerd_primitives::OutPoint;
use ledgerd_storage::StoreError;

use crate::wallet::WalletId;

#[derive(Debug)]
pub enum ChainStateError {
    /// Input references an output that does not exist or is already spent.
    DanglingInput {
        outpoint: OutPoint,
        spent_by: Option<Hash256>,
    },
    ChainDiscontinuity(&'static str),
    ReorgFailure {
        message: String,
        /// A branch block failed validation during replay. The branch is
        /// marked failed and the canonical tip is untouched.
        branch_rejected: bool,
    },
    /// A block was rejected because its transactions could not be applied.
    LedgerInconsistency {
        block: Hash256,
        source: Box<ChainStateError>,
    },
    ImmatureSpend {
        outpoint: OutPoint,
        created_height: u32,
        spend_height: u32,
    },
    ValueOutOfRange,
    DuplicateTxid(Hash256),
    Store(StoreError),
    Decode(DecodeError),
    CorruptIndex(&'static str),
    UnknownWallet(WalletId),
    InvalidAddress(String),
    AddressInUse {
        address: String,
        wallet: WalletId,
    },
    PendingConflict {
        outpoint: OutPoint,
        claimed_by: Hash256,
    },
    PendingPoolFull {
        limit: usize,
    },
    InvalidBlock(&'static str),
    InvalidTransaction(&'static str),
    Halted(String),
}

impl ChainStateError {
    /// Errors that describe a bad block or transaction rather than a broken ledger.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            ChainStateError::DanglingInput { .. }
                | ChainStateError::ImmatureSpend { .. }
                | ChainStateError::ValueOutOfRange
                | ChainStateError::DuplicateTxid(_)
                | ChainStateError::InvalidBlock(_)
                | ChainStateError::InvalidTransaction(_)
                | ChainStateError::LedgerInconsistency { .. }
                | ChainStateError::ChainDiscontinuity(_)
                | ChainStateError::ReorgFailure {
                    branch_rejected: true,
                    ..
                }
        )
    }

    /// Errors after which the linker stops accepting mutations.
    pub fn halts_service(&self) -> bool {
        match self {
            ChainStateError::ReorgFailure {
                branch_rejected, ..
            } => !branch_rejected,
            ChainStateError::CorruptIndex(_) | ChainStateError::Store(_) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ChainStateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStateError::DanglingInput {
                outpoint,
                spent_by: Some(spender),
            } => write!(
                f,
                "input {outpoint} already spent by {}",
                hash256_to_hex(spender)
            ),
            ChainStateError::DanglingInput {
                outpoint,
                spent_by: None,
            } => write!(f, "input {outpoint} references a missing output"),
            ChainStateError::ChainDiscontinuity(message) => {
                write!(f, "chain discontinuity: {message}")
            }
            ChainStateError::ReorgFailure { message, .. } => write!(f, "reorg failed: {message}"),
            ChainStateError::LedgerInconsistency { block, source } => {
                write!(f, "block {} rejected: {source}", hash256_to_hex(block))
            }
            ChainStateError::ImmatureSpend {
                outpoint,
                created_height,
                spend_height,
            } => write!(
                f,
                "coinbase output {outpoint} from height {created_height} is immature at height {spend_height}"
            ),
            ChainStateError::ValueOutOfRange => write!(f, "value out of range"),
            ChainStateError::DuplicateTxid(txid) => {
                write!(f, "duplicate txid {}", hash256_to_hex(txid))
            }
            ChainStateError::Store(err) => write!(f, "{err}"),
            ChainStateError::Decode(err) => write!(f, "{err}"),
            ChainStateError::CorruptIndex(message) => write!(f, "{message}"),
            ChainStateError::UnknownWallet(wallet) => write!(f, "unknown wallet {wallet}"),
            ChainStateError::InvalidAddress(address) => write!(f, "invalid address {address:?}"),
            ChainStateError::AddressInUse { address, wallet } => {
                write!(f, "address {address} already belongs to wallet {wallet}")
            }
            ChainStateError::PendingConflict {
                outpoint,
                claimed_by,
            } => write!(
                f,
                "input {outpoint} already claimed by pending {}",
                hash256_to_hex(claimed_by)
            ),
            ChainStateError::PendingPoolFull { limit } => {
                write!(f, "pending pool is full ({limit} transactions)")
            }
            ChainStateError::InvalidBlock(message) => write!(f, "invalid block: {message}"),
            ChainStateError::InvalidTransaction(message) => {
                write!(f, "invalid transaction: {message}")
            }
            ChainStateError::Halted(reason) => write!(f, "ledger halted: {reason}"),
        }
    }
}

impl std::error::Error for ChainStateError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChainStateError::LedgerInconsistency { source, .. } => Some(source.as_ref()),
            ChainStateError::Store(err) => Some(err),
            ChainStateError::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ChainStateError {
    fn from(err: StoreError) -> Self {
        ChainStateError::Store(err)
    }
}

impl From<DecodeError> for ChainStateError {
    fn from(err: DecodeError) -> Self {
        ChainStateError::Decode(err)
    }
}
