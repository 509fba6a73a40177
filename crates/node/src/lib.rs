use ledgerd_log as logging;

macro_rules! log_at {
    ($level:expr, $($arg:tt)*) => {{
        if crate::logging::enabled($level) {
            crate::logging::log($level, module_path!(), file!(), line!(), format_args!($($arg)*));
        }
    }};
}

macro_rules! log_error {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Error, $($arg)*);
    }};
}

macro_rules! log_warn {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Warn, $($arg)*);
    }};
}

macro_rules! log_info {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Info, $($arg)*);
    }};
}

macro_rules! log_debug {
    ($($arg:tt)*) => {{
        log_at!(crate::logging::Level::Debug, $($arg)*);
    }};
}

pub mod config;
pub mod protocol;
pub mod service;
pub mod store;

use std::path::Path;
use std::sync::Arc;

use ledgerd_chainstate::{ChainLinker, ChainState};
use ledgerd_primitives::Block;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::config::{Backend, CliAction, Config};
use crate::protocol::{BlockDto, Command};
use crate::service::{Service, ServiceError};
use crate::store::{lock_data_dir, Store};

const LOG_RING_CAPACITY: usize = 64;

pub async fn run_entry() -> Result<(), String> {
    let config = match config::parse_args().map_err(|err| err.to_string())? {
        CliAction::Run(config) => config,
        CliAction::PrintHelp => {
            println!("{}", config::usage());
            return Ok(());
        }
        CliAction::PrintVersion => {
            println!("ledgerd {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
    };
    run(config).await
}

pub async fn run(config: Config) -> Result<(), String> {
    logging::init(logging::LogConfig {
        level: config.log_level,
        format: config.log_format,
        timestamps: config.log_timestamps,
    });
    logging::enable_ring(LOG_RING_CAPACITY, logging::Level::Warn);

    let _lock = match config.backend {
        Backend::Fjall => Some(lock_data_dir(&config.data_dir)?),
        Backend::Memory => None,
    };
    let store = Arc::new(Store::open(&config)?);
    log_info!(
        "opened {} store (network {}, data dir {})",
        config.backend.as_str(),
        config.network.as_str(),
        config.data_dir.display()
    );

    let state = Arc::new(ChainState::new(Arc::clone(&store), config.params.clone()));
    let linker = Arc::new(ChainLinker::new(state));
    match linker.status() {
        Ok(status) => match status.tip {
            Some(tip) => log_info!(
                "chain tip {} at height {}",
                ledgerd_params::hash256_to_hex(&tip.hash),
                tip.height
            ),
            None => log_info!("ledger is empty; waiting for genesis"),
        },
        Err(err) => log_warn!("failed to read chain status: {err}"),
    }

    let service = Service::spawn(Arc::clone(&linker))?;
    let served = async {
        if let Some(path) = &config.import {
            import_blocks(&service, path).await?;
        }
        serve_stdio(&service).await
    }
    .await;

    service.shutdown();
    if let Err(err) = store.flush() {
        log_error!("failed to flush store: {err}");
        if served.is_ok() {
            return Err(format!("failed to flush store: {err}"));
        }
    }
    served
}

async fn import_blocks(service: &Service, path: &Path) -> Result<(), String> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| format!("failed to read {}: {err}", path.display()))?;
    let blocks: Vec<BlockDto> = serde_json::from_str(&raw)
        .map_err(|err| format!("invalid block file {}: {err}", path.display()))?;
    let total = blocks.len();
    let mut accepted = 0usize;
    for (position, dto) in blocks.into_iter().enumerate() {
        let block = Block::try_from(dto)
            .map_err(|err| format!("block {position} in {}: {err}", path.display()))?;
        match service.call(Command::SubmitBlock(block)).await {
            Ok(_) => accepted += 1,
            Err(ServiceError::Chain(err)) if err.is_rejection() => {
                log_warn!("import: block {position} rejected: {err}");
            }
            Err(err) => return Err(format!("import stopped at block {position}: {err}")),
        }
    }
    log_info!("imported {accepted}/{total} blocks from {}", path.display());
    Ok(())
}

async fn serve_stdio(service: &Service) -> Result<(), String> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.map_err(|err| format!("stdin read failed: {err}"))?,
            _ = tokio::signal::ctrl_c() => {
                log_info!("interrupt received; shutting down");
                return Ok(());
            }
        };
        let Some(line) = line else {
            log_debug!("stdin closed");
            return Ok(());
        };
        if let Some(mut response) = service.handle_line(&line).await {
            response.push('\n');
            stdout
                .write_all(response.as_bytes())
                .await
                .map_err(|err| format!("stdout write failed: {err}"))?;
            stdout
                .flush()
                .await
                .map_err(|err| format!("stdout write failed: {err}"))?;
        }
    }
}
