//! Command-line flags and the `ledgerd.conf` file.
//!
//! Both sources use the same key names. The conf file is read first and any
//! key given on the command line replaces it.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ledgerd_log::{Format, Level};
use ledgerd_params::{ledger_params, ForkChoice, LedgerParams, Network};

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "ledgerd.conf";

const BOOL_KEYS: &[&str] = &["reconcile-after-reorg", "log-timestamps", "sync-commits"];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Fjall => "fjall",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub network: Network,
    pub params: LedgerParams,
    pub log_level: Level,
    pub log_format: Format,
    pub log_timestamps: bool,
    /// JSON array of blocks submitted before serving requests.
    pub import: Option<PathBuf>,
    pub db_cache_bytes: Option<u64>,
    pub sync_commits: bool,
}

#[derive(Debug)]
pub enum CliAction {
    Run(Config),
    PrintHelp,
    PrintVersion,
}

#[derive(Debug)]
pub enum ConfigError {
    MissingValue(String),
    UnknownOption { option: String, origin: String },
    InvalidValue {
        key: String,
        value: String,
        origin: String,
    },
    Io { path: PathBuf, message: String },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::MissingValue(key) => {
                write!(f, "missing value for --{key}\n{}", usage())
            }
            ConfigError::UnknownOption { option, origin } => {
                write!(f, "unknown option '{option}' in {origin}\n{}", usage())
            }
            ConfigError::InvalidValue { key, value, origin } => {
                write!(f, "invalid {key} '{value}' in {origin}")
            }
            ConfigError::Io { path, message } => {
                write!(f, "failed to read {}: {message}", path.display())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn usage() -> String {
    [
        "Usage: ledgerd [OPTIONS]",
        "",
        "Options:",
        "  --network <mainnet|testnet|regtest>   Parameter preset (default: mainnet)",
        "  --backend <fjall|memory>              Storage backend (default: fjall)",
        "  --datadir <path>                      Data directory (default: ./data)",
        "  --conf <path>                         Config file (default: <datadir>/ledgerd.conf)",
        "  --coinbase-maturity <blocks>          Blocks before a coinbase output is spendable",
        "  --fork-choice <work|height>           Rule for competing branches",
        "  --orphan-retention-secs <secs>        How long to buffer blocks with unknown parents",
        "  --max-orphans <n>                     Orphan buffer capacity",
        "  --max-pending <n>                     Pending transaction pool capacity",
        "  --pending-retention-secs <secs>       How long an unconfirmed transaction stays pending",
        "  --max-reorg-depth <n|none>            Deepest reorganization allowed",
        "  --commit-retries <n>                  Retries for transient store failures",
        "  --reconcile-after-reorg [bool]        Recompute wallet balances after each reorg",
        "  --log-level <level>                   error|warn|info|debug|trace",
        "  --log-format <text|json>              Log line format",
        "  --log-timestamps [bool]               Prefix text log lines with a timestamp",
        "  --import <file>                       Submit a JSON array of blocks at startup",
        "  --db-cache-mb <mb>                    fjall block cache size",
        "  --sync-commits [bool]                 fsync the journal on every commit",
        "  -h, --help                            Print help",
        "  -V, --version                         Print version",
        "",
        "Requests are read from stdin as one JSON object per line.",
    ]
    .join("\n")
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

/// Reads `key=value` lines; `#` and `;` start comments and a bare key means
/// `1`. Returns `None` when the file does not exist.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, ConfigError> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(ConfigError::Io {
                path: path.to_path_buf(),
                message: err.to_string(),
            })
        }
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

#[derive(Default)]
struct Settings {
    network: Option<Network>,
    backend: Option<Backend>,
    data_dir: Option<PathBuf>,
    coinbase_maturity: Option<u32>,
    fork_choice: Option<ForkChoice>,
    orphan_retention_secs: Option<u64>,
    max_orphans: Option<usize>,
    max_pending: Option<usize>,
    pending_retention_secs: Option<u64>,
    max_reorg_depth: Option<Option<u32>>,
    commit_retries: Option<u32>,
    reconcile_after_reorg: Option<bool>,
    log_level: Option<Level>,
    log_format: Option<Format>,
    log_timestamps: Option<bool>,
    import: Option<PathBuf>,
    db_cache_mb: Option<u64>,
    sync_commits: Option<bool>,
}

impl Settings {
    fn apply(&mut self, key: &str, value: &str, origin: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
            origin: origin.to_string(),
        };
        match key {
            "network" => self.network = Some(Network::parse(value).ok_or_else(invalid)?),
            "backend" => self.backend = Some(Backend::parse(value).ok_or_else(invalid)?),
            "datadir" => self.data_dir = Some(PathBuf::from(value)),
            "coinbase-maturity" => {
                self.coinbase_maturity = Some(value.parse().map_err(|_| invalid())?)
            }
            "fork-choice" => self.fork_choice = Some(ForkChoice::parse(value).ok_or_else(invalid)?),
            "orphan-retention-secs" => {
                self.orphan_retention_secs = Some(value.parse().map_err(|_| invalid())?)
            }
            "max-orphans" => self.max_orphans = Some(value.parse().map_err(|_| invalid())?),
            "max-pending" => self.max_pending = Some(value.parse().map_err(|_| invalid())?),
            "pending-retention-secs" => {
                self.pending_retention_secs = Some(value.parse().map_err(|_| invalid())?)
            }
            "max-reorg-depth" => {
                self.max_reorg_depth = Some(match value.to_ascii_lowercase().as_str() {
                    "none" | "unlimited" => None,
                    raw => Some(raw.parse().map_err(|_| invalid())?),
                })
            }
            "commit-retries" => self.commit_retries = Some(value.parse().map_err(|_| invalid())?),
            "reconcile-after-reorg" => {
                self.reconcile_after_reorg = Some(parse_conf_bool(value).ok_or_else(invalid)?)
            }
            "log-level" => self.log_level = Some(Level::parse(value).ok_or_else(invalid)?),
            "log-format" => self.log_format = Some(Format::parse(value).ok_or_else(invalid)?),
            "log-timestamps" => {
                self.log_timestamps = Some(parse_conf_bool(value).ok_or_else(invalid)?)
            }
            "import" => self.import = Some(PathBuf::from(value)),
            "db-cache-mb" => self.db_cache_mb = Some(value.parse().map_err(|_| invalid())?),
            "sync-commits" => self.sync_commits = Some(parse_conf_bool(value).ok_or_else(invalid)?),
            _ => {
                return Err(ConfigError::UnknownOption {
                    option: key.to_string(),
                    origin: origin.to_string(),
                })
            }
        }
        Ok(())
    }

    fn into_config(self, data_dir: PathBuf, conf_path: PathBuf) -> Config {
        let network = self.network.unwrap_or(Network::Mainnet);
        let mut params = ledger_params(network);
        if let Some(maturity) = self.coinbase_maturity {
            params.coinbase_maturity = maturity;
        }
        if let Some(rule) = self.fork_choice {
            params.fork_choice = rule;
        }
        if let Some(secs) = self.orphan_retention_secs {
            params.orphan_retention = Duration::from_secs(secs);
        }
        if let Some(max) = self.max_orphans {
            params.max_orphans = max;
        }
        if let Some(max) = self.max_pending {
            params.max_pending = max;
        }
        if let Some(secs) = self.pending_retention_secs {
            params.pending_retention = Duration::from_secs(secs);
        }
        if let Some(depth) = self.max_reorg_depth {
            params.max_reorg_depth = depth;
        }
        if let Some(retries) = self.commit_retries {
            params.commit_retries = retries;
        }
        if let Some(reconcile) = self.reconcile_after_reorg {
            params.reconcile_after_reorg = reconcile;
        }
        Config {
            backend: self.backend.unwrap_or(Backend::Fjall),
            data_dir,
            conf_path,
            network,
            params,
            log_level: self.log_level.unwrap_or(Level::Info),
            log_format: self.log_format.unwrap_or(Format::Text),
            log_timestamps: self.log_timestamps.unwrap_or(true),
            import: self.import,
            db_cache_bytes: self.db_cache_mb.map(|mb| mb.saturating_mul(1024 * 1024)),
            sync_commits: self.sync_commits.unwrap_or(false),
        }
    }
}

pub fn parse_args() -> Result<CliAction, ConfigError> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, ConfigError>
where
    I: IntoIterator<Item = String>,
{
    let mut cli: Vec<(String, String)> = Vec::new();
    let mut conf_path: Option<PathBuf> = None;
    let mut args = raw_args.into_iter().peekable();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => return Ok(CliAction::PrintHelp),
            "-V" | "--version" => return Ok(CliAction::PrintVersion),
            _ => {}
        }
        let Some(flag) = arg.strip_prefix("--") else {
            return Err(ConfigError::UnknownOption {
                option: arg,
                origin: "command line".to_string(),
            });
        };
        let (key, inline) = match flag.split_once('=') {
            Some((key, value)) => (key.to_string(), Some(value.to_string())),
            None => (flag.to_string(), None),
        };
        let value = match inline {
            Some(value) => value,
            None if BOOL_KEYS.contains(&key.as_str()) => args
                .next_if(|next| !next.starts_with("--") && parse_conf_bool(next).is_some())
                .unwrap_or_else(|| "1".to_string()),
            None => args
                .next()
                .ok_or_else(|| ConfigError::MissingValue(key.clone()))?,
        };
        if key == "conf" {
            conf_path = Some(PathBuf::from(value));
        } else {
            cli.push((key, value));
        }
    }

    let mut settings = Settings::default();
    for (key, value) in &cli {
        settings.apply(key, value, "command line")?;
    }
    let cli_data_dir = settings.data_dir.take();
    let conf_path = conf_path.unwrap_or_else(|| {
        cli_data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
            .join(CONF_FILE_NAME)
    });

    let mut merged = Settings::default();
    if let Some(conf) = load_conf(&conf_path)? {
        let origin = conf_path.display().to_string();
        let mut keys: Vec<_> = conf.keys().cloned().collect();
        keys.sort();
        for key in keys {
            for value in &conf[&key] {
                merged.apply(&key, value, &origin)?;
            }
        }
    }
    for (key, value) in &cli {
        merged.apply(key, value, "command line")?;
    }
    let data_dir = merged
        .data_dir
        .take()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    Ok(CliAction::Run(merged.into_config(data_dir, conf_path)))
}
