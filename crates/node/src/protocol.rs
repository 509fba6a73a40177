//! Newline-delimited JSON requests and responses.
//!
//! Each request line is `{"id": .., "method": .., "params": {..}}` and gets
//! exactly one response line carrying either `result` or `error`. Hashes are
//! display-order hex strings and amounts are integers.

use std::fmt;

use ledgerd_chainstate::state::WalletUtxo;
use ledgerd_chainstate::wallet::WalletId;
use ledgerd_chainstate::{ChainStateError, SubmitOutcome};
use ledgerd_params::money::Amount;
use ledgerd_params::{hash256_from_hex, hash256_to_hex, Hash256, HexError};
use ledgerd_primitives::{merkle_root, Block, BlockHeader, OutPoint, Transaction, TxIn, TxOut};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RPC_PARSE_ERROR: i32 = -32700;
pub const RPC_METHOD_NOT_FOUND: i32 = -32601;
pub const RPC_INVALID_PARAMS: i32 = -32602;
pub const RPC_INTERNAL_ERROR: i32 = -32603;
pub const RPC_REORG_FAILED: i32 = -32001;
pub const RPC_HALTED: i32 = -32002;
pub const RPC_WALLET_ERROR: i32 = -4;
pub const RPC_INVALID_ADDRESS: i32 = -5;
pub const RPC_WALLET_NOT_FOUND: i32 = -18;
pub const RPC_VERIFY_ERROR: i32 = -25;
pub const RPC_VERIFY_REJECTED: i32 = -26;

#[derive(Debug, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct Response {
    pub id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Response {
    pub fn ok(id: Value, result: Value) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
        }
    }

    pub fn err(id: Value, code: i32, message: impl Into<String>) -> Self {
        Self {
            id,
            result: None,
            error: Some(ErrorBody {
                code,
                message: message.into(),
            }),
        }
    }

    pub fn to_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|err| {
            format!(
                "{{\"id\":null,\"error\":{{\"code\":{RPC_INTERNAL_ERROR},\"message\":\"encode failed: {err}\"}}}}"
            )
        })
    }
}

#[derive(Debug)]
pub enum ProtocolError {
    Parse(String),
    UnknownMethod(String),
    InvalidParams(String),
    InvalidHex { field: &'static str, err: HexError },
}

impl ProtocolError {
    pub fn code(&self) -> i32 {
        match self {
            ProtocolError::Parse(_) => RPC_PARSE_ERROR,
            ProtocolError::UnknownMethod(_) => RPC_METHOD_NOT_FOUND,
            ProtocolError::InvalidParams(_) | ProtocolError::InvalidHex { .. } => {
                RPC_INVALID_PARAMS
            }
        }
    }
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Parse(message) => write!(f, "parse error: {message}"),
            ProtocolError::UnknownMethod(method) => write!(f, "method not found: {method}"),
            ProtocolError::InvalidParams(message) => write!(f, "invalid params: {message}"),
            ProtocolError::InvalidHex { field, err } => write!(f, "invalid {field}: {err}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Error code reported for a failed ledger operation.
pub fn chain_error_code(err: &ChainStateError) -> i32 {
    match err {
        ChainStateError::PendingConflict { .. } | ChainStateError::PendingPoolFull { .. } => {
            RPC_VERIFY_REJECTED
        }
        ChainStateError::UnknownWallet(_) => RPC_WALLET_NOT_FOUND,
        ChainStateError::InvalidAddress(_) => RPC_INVALID_ADDRESS,
        ChainStateError::AddressInUse { .. } => RPC_WALLET_ERROR,
        ChainStateError::ReorgFailure { .. } => RPC_REORG_FAILED,
        ChainStateError::Halted(_) => RPC_HALTED,
        ChainStateError::Store(_) | ChainStateError::Decode(_) | ChainStateError::CorruptIndex(_) => {
            RPC_INTERNAL_ERROR
        }
        _ => RPC_VERIFY_ERROR,
    }
}

fn parse_hash(field: &'static str, raw: &str) -> Result<Hash256, ProtocolError> {
    hash256_from_hex(raw).map_err(|err| ProtocolError::InvalidHex { field, err })
}

fn hex_bytes(bytes: &[u8]) -> String {
    use std::fmt::Write;

    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{byte:02x}");
    }
    out
}

#[derive(Clone, Debug, Deserialize)]
pub struct OutPointDto {
    pub txid: String,
    pub index: u32,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TxOutDto {
    pub address: String,
    pub value: Amount,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TransactionDto {
    #[serde(default)]
    pub inputs: Vec<OutPointDto>,
    pub outputs: Vec<TxOutDto>,
    #[serde(default)]
    pub fee: Amount,
    #[serde(default)]
    pub timestamp: u64,
}

impl TryFrom<TransactionDto> for Transaction {
    type Error = ProtocolError;

    fn try_from(dto: TransactionDto) -> Result<Self, Self::Error> {
        let inputs = dto
            .inputs
            .into_iter()
            .map(|input| {
                Ok(TxIn {
                    prevout: OutPoint::new(parse_hash("input txid", &input.txid)?, input.index),
                })
            })
            .collect::<Result<Vec<_>, ProtocolError>>()?;
        Ok(Transaction {
            inputs,
            outputs: dto
                .outputs
                .into_iter()
                .map(|output| TxOut {
                    value: output.value,
                    address: output.address,
                })
                .collect(),
            fee: dto.fee,
            timestamp: dto.timestamp,
            height: 0,
        })
    }
}

#[derive(Clone, Debug, Deserialize)]
pub struct BlockDto {
    pub prev_hash: String,
    pub height: u32,
    #[serde(default)]
    pub timestamp: u64,
    #[serde(default)]
    pub nonce: u64,
    pub difficulty: u64,
    /// Computed from the transactions when omitted.
    #[serde(default)]
    pub merkle_root: Option<String>,
    pub miner: String,
    pub reward: Amount,
    pub transactions: Vec<TransactionDto>,
}

impl TryFrom<BlockDto> for Block {
    type Error = ProtocolError;

    fn try_from(dto: BlockDto) -> Result<Self, Self::Error> {
        let mut transactions = dto
            .transactions
            .into_iter()
            .map(Transaction::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(coinbase) = transactions.first_mut().filter(|tx| tx.is_coinbase()) {
            coinbase.height = dto.height;
        }
        let merkle_root = match dto.merkle_root {
            Some(raw) => parse_hash("merkle_root", &raw)?,
            None => {
                let txids: Vec<Hash256> = transactions.iter().map(Transaction::txid).collect();
                merkle_root(&txids)
            }
        };
        Ok(Block {
            header: BlockHeader {
                prev_hash: parse_hash("prev_hash", &dto.prev_hash)?,
                height: dto.height,
                timestamp: dto.timestamp,
                nonce: dto.nonce,
                difficulty: dto.difficulty,
                merkle_root,
                miner: dto.miner,
                reward: dto.reward,
            },
            transactions,
        })
    }
}

#[derive(Deserialize)]
struct NameParams {
    name: String,
}

#[derive(Deserialize)]
struct WalletParams {
    wallet: WalletId,
}

#[derive(Deserialize)]
struct RegisterAddressParams {
    wallet: WalletId,
    address: String,
    #[serde(default)]
    is_change: bool,
}

#[derive(Deserialize)]
struct TxidParams {
    txid: String,
}

fn params<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(value).map_err(|err| ProtocolError::InvalidParams(err.to_string()))
}

#[derive(Clone, Debug)]
pub enum Command {
    SubmitBlock(Block),
    SubmitTx(Transaction),
    CreateWallet {
        name: String,
    },
    RegisterAddress {
        wallet: WalletId,
        address: String,
        is_change: bool,
    },
    GetBalance {
        wallet: WalletId,
    },
    ListUtxos {
        wallet: WalletId,
    },
    GetConfirmations {
        txid: Hash256,
    },
    GetChainTip,
    GetStatus,
    Reconcile,
    Resume,
}

impl Command {
    pub fn parse(method: &str, raw: Value) -> Result<Self, ProtocolError> {
        match method {
            "submitblock" => Ok(Command::SubmitBlock(params::<BlockDto>(raw)?.try_into()?)),
            "submittx" => Ok(Command::SubmitTx(params::<TransactionDto>(raw)?.try_into()?)),
            "createwallet" => {
                let NameParams { name } = params(raw)?;
                Ok(Command::CreateWallet { name })
            }
            "registeraddress" => {
                let RegisterAddressParams {
                    wallet,
                    address,
                    is_change,
                } = params(raw)?;
                Ok(Command::RegisterAddress {
                    wallet,
                    address,
                    is_change,
                })
            }
            "getbalance" => Ok(Command::GetBalance {
                wallet: params::<WalletParams>(raw)?.wallet,
            }),
            "listutxos" => Ok(Command::ListUtxos {
                wallet: params::<WalletParams>(raw)?.wallet,
            }),
            "getconfirmations" => {
                let TxidParams { txid } = params(raw)?;
                Ok(Command::GetConfirmations {
                    txid: parse_hash("txid", &txid)?,
                })
            }
            "getchaintip" => Ok(Command::GetChainTip),
            "getstatus" => Ok(Command::GetStatus),
            "reconcile" => Ok(Command::Reconcile),
            "resume" => Ok(Command::Resume),
            other => Err(ProtocolError::UnknownMethod(other.to_string())),
        }
    }
}

/// Parses one request line. On failure returns the id (when readable) with
/// the error.
pub fn parse_line(line: &str) -> Result<(Value, Command), (Value, ProtocolError)> {
    let request: Request = serde_json::from_str(line)
        .map_err(|err| (Value::Null, ProtocolError::Parse(err.to_string())))?;
    let id = request.id;
    match Command::parse(&request.method, request.params) {
        Ok(command) => Ok((id, command)),
        Err(err) => Err((id, err)),
    }
}

#[derive(Debug, Serialize)]
pub struct OutcomeView {
    pub hash: String,
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fork_height: Option<u32>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub disconnected: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub connected: Vec<String>,
}

impl OutcomeView {
    pub fn new(hash: &Hash256, outcome: &SubmitOutcome) -> Self {
        let mut view = OutcomeView {
            hash: hash256_to_hex(hash),
            outcome: "",
            height: None,
            fork_height: None,
            disconnected: Vec::new(),
            connected: Vec::new(),
        };
        match outcome {
            SubmitOutcome::Connected { height } => {
                view.outcome = "connected";
                view.height = Some(*height);
            }
            SubmitOutcome::SideBranch { height } => {
                view.outcome = "sidebranch";
                view.height = Some(*height);
            }
            SubmitOutcome::Reorganized {
                fork_height,
                disconnected,
                connected,
            } => {
                view.outcome = "reorganized";
                view.fork_height = Some(*fork_height);
                view.disconnected = disconnected.iter().map(hash256_to_hex).collect();
                view.connected = connected.iter().map(hash256_to_hex).collect();
            }
            SubmitOutcome::Orphaned => view.outcome = "orphaned",
            SubmitOutcome::Duplicate => view.outcome = "duplicate",
        }
        view
    }
}

#[derive(Debug, Serialize)]
pub struct SubmitBlockView {
    #[serde(flatten)]
    pub block: OutcomeView,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub adopted: Vec<OutcomeView>,
}

#[derive(Debug, Serialize)]
pub struct UtxoView {
    pub txid: String,
    pub index: u32,
    pub address: String,
    pub value: Amount,
    pub height: u32,
    pub coinbase: bool,
    pub mature: bool,
    pub confirmations: u32,
}

impl From<WalletUtxo> for UtxoView {
    fn from(utxo: WalletUtxo) -> Self {
        Self {
            txid: hash256_to_hex(&utxo.outpoint.txid),
            index: utxo.outpoint.index,
            address: utxo.address,
            value: utxo.value,
            height: utxo.height,
            coinbase: utxo.is_coinbase,
            mature: utxo.mature,
            confirmations: utxo.confirmations,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ChainTipView {
    pub hash: String,
    pub height: u32,
    pub chainwork: String,
}

impl ChainTipView {
    pub fn new(hash: &Hash256, height: u32, chainwork: &[u8; 32]) -> Self {
        Self {
            hash: hash256_to_hex(hash),
            height,
            chainwork: hex_bytes(chainwork),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StatusView {
    pub network: &'static str,
    pub tip_height: Option<u32>,
    pub tip_hash: Option<String>,
    pub orphans: usize,
    pub pending: usize,
    pub utxo_count: u64,
    pub utxo_value: Amount,
    pub halted: Option<String>,
    pub recent_warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn block_without_merkle_root_gets_computed_one() {
        let raw = json!({
            "prev_hash": "00".repeat(32),
            "height": 4,
            "difficulty": 1,
            "miner": "miner",
            "reward": 50,
            "transactions": [{"outputs": [{"address": "alice", "value": 50}]}]
        });
        let Command::SubmitBlock(block) = Command::parse("submitblock", raw).expect("parse") else {
            panic!("expected submitblock");
        };
        let txid = block.transactions[0].txid();
        assert_eq!(block.header.merkle_root, merkle_root(&[txid]));
        assert!(block.transactions[0].is_coinbase());
        assert_eq!(block.transactions[0].height, 4);
    }

    #[test]
    fn bad_requests_report_codes() {
        let (id, err) = parse_line("{not json").expect_err("parse error");
        assert_eq!(id, Value::Null);
        assert_eq!(err.code(), RPC_PARSE_ERROR);

        let (id, err) = parse_line(r#"{"id":7,"method":"mine"}"#).expect_err("unknown");
        assert_eq!(id, json!(7));
        assert_eq!(err.code(), RPC_METHOD_NOT_FOUND);

        let (_, err) =
            parse_line(r#"{"id":8,"method":"getconfirmations","params":{"txid":"zz"}}"#)
                .expect_err("bad hex");
        assert_eq!(err.code(), RPC_INVALID_PARAMS);

        let (_, err) = parse_line(r#"{"id":9,"method":"getbalance","params":{}}"#)
            .expect_err("missing wallet");
        assert_eq!(err.code(), RPC_INVALID_PARAMS);
    }

    #[test]
    fn reorg_outcome_lists_hashes() {
        let view = OutcomeView::new(
            &[1u8; 32],
            &SubmitOutcome::Reorganized {
                fork_height: 3,
                disconnected: vec![[2u8; 32]],
                connected: vec![[3u8; 32], [4u8; 32]],
            },
        );
        let value = serde_json::to_value(&view).expect("encode");
        assert_eq!(value["outcome"], "reorganized");
        assert_eq!(value["fork_height"], 3);
        assert_eq!(value["connected"].as_array().map(Vec::len), Some(2));
        assert!(value.get("height").is_none());
    }
}
