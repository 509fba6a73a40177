//! Request execution on a dedicated ledger worker thread.
//!
//! Commands are queued over a crossbeam channel and answered over a tokio
//! oneshot, so async callers never block on store I/O. The worker also
//! sweeps expired orphans whenever the queue stays idle.

use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use ledgerd_chainstate::{ChainLinker, ChainStateError, TxAdmission};
use ledgerd_params::hash256_to_hex;
use ledgerd_storage::KeyValueStore;
use serde_json::{json, Value};
use tokio::sync::oneshot;

use crate::protocol::{
    chain_error_code, parse_line, ChainTipView, Command, OutcomeView, ProtocolError, Response,
    StatusView, SubmitBlockView, UtxoView, RPC_INTERNAL_ERROR,
};

const SWEEP_INTERVAL: Duration = Duration::from_secs(5);
const STATUS_WARNING_LIMIT: usize = 8;

#[derive(Debug)]
pub enum ServiceError {
    Chain(ChainStateError),
    Protocol(ProtocolError),
    Encode(String),
    Stopped,
}

impl ServiceError {
    pub fn code(&self) -> i32 {
        match self {
            ServiceError::Chain(err) => chain_error_code(err),
            ServiceError::Protocol(err) => err.code(),
            ServiceError::Encode(_) | ServiceError::Stopped => RPC_INTERNAL_ERROR,
        }
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceError::Chain(err) => write!(f, "{err}"),
            ServiceError::Protocol(err) => write!(f, "{err}"),
            ServiceError::Encode(message) => write!(f, "failed to encode result: {message}"),
            ServiceError::Stopped => write!(f, "ledger worker stopped"),
        }
    }
}

impl std::error::Error for ServiceError {}

impl From<ChainStateError> for ServiceError {
    fn from(err: ChainStateError) -> Self {
        ServiceError::Chain(err)
    }
}

impl From<ProtocolError> for ServiceError {
    fn from(err: ProtocolError) -> Self {
        ServiceError::Protocol(err)
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        ServiceError::Encode(err.to_string())
    }
}

/// Runs one command against the linker and renders its result.
pub fn execute<S: KeyValueStore>(
    linker: &ChainLinker<S>,
    command: Command,
) -> Result<Value, ServiceError> {
    let state = linker.state();
    match command {
        Command::SubmitBlock(block) => {
            let submission = linker.submit_block(block)?;
            let view = SubmitBlockView {
                block: OutcomeView::new(&submission.hash, &submission.outcome),
                adopted: submission
                    .adopted
                    .iter()
                    .map(|(hash, outcome)| OutcomeView::new(hash, outcome))
                    .collect(),
            };
            Ok(serde_json::to_value(view)?)
        }
        Command::SubmitTx(tx) => {
            let (txid, status) = match linker.submit_transaction(&tx)? {
                TxAdmission::Accepted(txid) => (txid, "accepted"),
                TxAdmission::Duplicate(txid) => (txid, "duplicate"),
            };
            Ok(json!({ "txid": hash256_to_hex(&txid), "status": status }))
        }
        Command::CreateWallet { name } => {
            let wallet = linker.create_wallet(&name)?;
            Ok(json!({ "wallet": wallet, "name": name }))
        }
        Command::RegisterAddress {
            wallet,
            address,
            is_change,
        } => {
            let added = linker.register_address(wallet, &address, is_change)?;
            Ok(json!({
                "wallet": wallet,
                "address": address,
                "change": is_change,
                "added": added,
            }))
        }
        Command::GetBalance { wallet } => {
            let balance = state.balance(wallet)?;
            Ok(json!({ "wallet": wallet, "balance": balance }))
        }
        Command::ListUtxos { wallet } => {
            let utxos: Vec<UtxoView> = state
                .list_utxos(wallet)?
                .into_iter()
                .map(UtxoView::from)
                .collect();
            Ok(serde_json::to_value(utxos)?)
        }
        Command::GetConfirmations { txid } => {
            let confirmations = state.confirmations(&txid)?;
            Ok(json!({
                "txid": hash256_to_hex(&txid),
                "confirmations": confirmations,
            }))
        }
        Command::GetChainTip => match state.chain_tip()? {
            Some(tip) => Ok(serde_json::to_value(ChainTipView::new(
                &tip.hash,
                tip.height,
                &tip.chainwork,
            ))?),
            None => Ok(Value::Null),
        },
        Command::GetStatus => {
            let status = linker.status()?;
            let stats = state.utxo_stats()?;
            let view = StatusView {
                network: state.params().network.as_str(),
                tip_height: status.tip.as_ref().map(|tip| tip.height),
                tip_hash: status.tip.as_ref().map(|tip| hash256_to_hex(&tip.hash)),
                orphans: status.orphan_count,
                pending: status.pending_count,
                utxo_count: stats.count,
                utxo_value: stats.total_value,
                halted: status.halted,
                recent_warnings: ledgerd_log::recent(STATUS_WARNING_LIMIT)
                    .iter()
                    .map(ToString::to_string)
                    .collect(),
            };
            Ok(serde_json::to_value(view)?)
        }
        Command::Reconcile => {
            let corrections: Vec<Value> = linker
                .reconcile()?
                .into_iter()
                .map(|correction| {
                    json!({
                        "wallet": correction.wallet,
                        "cached": correction.cached,
                        "actual": correction.actual,
                    })
                })
                .collect();
            Ok(json!({ "corrections": corrections }))
        }
        Command::Resume => {
            let cleared = linker.resume()?;
            Ok(json!({ "resumed": cleared.is_some(), "reason": cleared }))
        }
    }
}

struct Job {
    command: Command,
    reply: oneshot::Sender<Result<Value, ServiceError>>,
}

pub struct Service {
    sender: Option<Sender<Job>>,
    worker: Option<JoinHandle<()>>,
}

impl Service {
    pub fn spawn<S>(linker: Arc<ChainLinker<S>>) -> Result<Self, String>
    where
        S: KeyValueStore + Send + Sync + 'static,
    {
        let (sender, receiver) = unbounded::<Job>();
        let worker = std::thread::Builder::new()
            .name("ledger-worker".to_string())
            .spawn(move || {
                let mut last_sweep = Instant::now();
                loop {
                    match receiver.recv_timeout(SWEEP_INTERVAL) {
                        Ok(job) => {
                            let result = execute(&linker, job.command);
                            let _ = job.reply.send(result);
                        }
                        Err(RecvTimeoutError::Timeout) => {}
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                    if last_sweep.elapsed() >= SWEEP_INTERVAL {
                        last_sweep = Instant::now();
                        if let Err(err) = linker.expire_orphans() {
                            log_warn!("orphan sweep failed: {err}");
                        }
                        match linker.expire_pending() {
                            Ok(_) | Err(ChainStateError::Halted(_)) => {}
                            Err(err) => log_warn!("pending sweep failed: {err}"),
                        }
                    }
                }
                log_debug!("ledger worker exiting");
            })
            .map_err(|err| format!("failed to spawn ledger worker: {err}"))?;
        Ok(Self {
            sender: Some(sender),
            worker: Some(worker),
        })
    }

    pub async fn call(&self, command: Command) -> Result<Value, ServiceError> {
        let sender = self.sender.as_ref().ok_or(ServiceError::Stopped)?;
        let (reply, response) = oneshot::channel();
        sender
            .send(Job { command, reply })
            .map_err(|_| ServiceError::Stopped)?;
        response.await.map_err(|_| ServiceError::Stopped)?
    }

    /// Answers one NDJSON request line. Blank lines produce no response.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let response = match parse_line(line) {
            Ok((id, command)) => match self.call(command).await {
                Ok(result) => Response::ok(id, result),
                Err(err) => {
                    if matches!(&err, ServiceError::Chain(chain) if chain.halts_service()) {
                        log_error!("request failed: {err}");
                    } else {
                        log_debug!("request rejected: {err}");
                    }
                    Response::err(id, err.code(), err.to_string())
                }
            },
            Err((id, err)) => Response::err(id, err.code(), err.to_string()),
        };
        Some(response.to_line())
    }

    /// Stops accepting work and waits for queued commands to finish.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log_error!("ledger worker panicked");
            }
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.stop();
    }
}
