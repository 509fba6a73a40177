use std::fs;
use std::time::Duration;

use ledgerd::config::{parse_args_from, Backend, CliAction, Config, ConfigError};
use ledgerd_log::{Format, Level};
use ledgerd_params::{ForkChoice, Network};

fn args(list: &[&str]) -> Vec<String> {
    list.iter().map(|arg| arg.to_string()).collect()
}

fn run_config(list: &[&str]) -> Config {
    match parse_args_from(args(list)).expect("parse") {
        CliAction::Run(config) => config,
        other => panic!("expected run, got {other:?}"),
    }
}

#[test]
fn defaults_follow_network_preset() {
    let dir = tempfile::tempdir().expect("tempdir");
    let datadir = dir.path().to_string_lossy().to_string();
    let config = run_config(&["--datadir", &datadir]);
    assert_eq!(config.backend, Backend::Fjall);
    assert_eq!(config.network, Network::Mainnet);
    assert_eq!(config.params.coinbase_maturity, 100);
    assert_eq!(config.params.fork_choice, ForkChoice::CumulativeDifficulty);
    assert_eq!(config.params.max_reorg_depth, None);
    assert_eq!(config.log_level, Level::Info);
    assert_eq!(config.conf_path, dir.path().join("ledgerd.conf"));
    assert!(config.import.is_none());

    let regtest = run_config(&["--datadir", &datadir, "--network=regtest"]);
    assert_eq!(regtest.params.coinbase_maturity, 1);
    assert_eq!(regtest.params.max_orphans, 1_000);
    assert_eq!(regtest.params.max_pending, 1_000);
    assert_eq!(config.params.max_pending, 5_000);
}

#[test]
fn flags_override_ledger_params() {
    let dir = tempfile::tempdir().expect("tempdir");
    let datadir = dir.path().to_string_lossy().to_string();
    let config = run_config(&[
        "--datadir",
        &datadir,
        "--backend",
        "memory",
        "--coinbase-maturity",
        "7",
        "--fork-choice=length",
        "--orphan-retention-secs",
        "30",
        "--max-orphans",
        "4",
        "--max-pending",
        "16",
        "--pending-retention-secs=90",
        "--max-reorg-depth",
        "12",
        "--commit-retries",
        "0",
        "--reconcile-after-reorg",
        "false",
        "--log-format",
        "json",
        "--log-timestamps",
        "--db-cache-mb",
        "2",
    ]);
    assert_eq!(config.backend, Backend::Memory);
    assert_eq!(config.params.coinbase_maturity, 7);
    assert_eq!(config.params.fork_choice, ForkChoice::Height);
    assert_eq!(config.params.orphan_retention, Duration::from_secs(30));
    assert_eq!(config.params.max_orphans, 4);
    assert_eq!(config.params.max_pending, 16);
    assert_eq!(config.params.pending_retention, Duration::from_secs(90));
    assert_eq!(config.params.max_reorg_depth, Some(12));
    assert_eq!(config.params.commit_retries, 0);
    assert!(!config.params.reconcile_after_reorg);
    assert_eq!(config.log_format, Format::Json);
    assert!(config.log_timestamps);
    assert_eq!(config.db_cache_bytes, Some(2 * 1024 * 1024));
}

#[test]
fn conf_file_is_overridden_by_command_line() {
    let dir = tempfile::tempdir().expect("tempdir");
    let datadir = dir.path().to_string_lossy().to_string();
    fs::write(
        dir.path().join("ledgerd.conf"),
        "# regtest node\nnetwork=regtest\ncoinbase-maturity = 9 ; overridden\nsync-commits\nlog-level=debug\n",
    )
    .expect("write conf");

    let config = run_config(&["--datadir", &datadir, "--coinbase-maturity", "3"]);
    assert_eq!(config.network, Network::Regtest);
    assert_eq!(config.params.coinbase_maturity, 3);
    assert!(config.sync_commits);
    assert_eq!(config.log_level, Level::Debug);
}

#[test]
fn explicit_conf_path_is_used() {
    let dir = tempfile::tempdir().expect("tempdir");
    let conf = dir.path().join("custom.conf");
    fs::write(&conf, "backend=memory\nmax-reorg-depth=none\n").expect("write conf");
    let datadir = dir.path().join("data").to_string_lossy().to_string();
    let conf_arg = conf.to_string_lossy().to_string();

    let config = run_config(&["--datadir", &datadir, "--conf", &conf_arg]);
    assert_eq!(config.backend, Backend::Memory);
    assert_eq!(config.conf_path, conf);
    assert_eq!(config.params.max_reorg_depth, None);
}

#[test]
fn invalid_input_is_reported() {
    let dir = tempfile::tempdir().expect("tempdir");
    let datadir = dir.path().to_string_lossy().to_string();

    match parse_args_from(args(&["--datadir", &datadir, "--bogus", "1"])) {
        Err(ConfigError::UnknownOption { option, .. }) => assert_eq!(option, "bogus"),
        other => panic!("expected unknown option, got {other:?}"),
    }
    match parse_args_from(args(&["--datadir", &datadir, "--fork-choice", "random"])) {
        Err(ConfigError::InvalidValue { key, value, .. }) => {
            assert_eq!(key, "fork-choice");
            assert_eq!(value, "random");
        }
        other => panic!("expected invalid value, got {other:?}"),
    }
    assert!(matches!(
        parse_args_from(args(&["--datadir", &datadir, "--max-orphans"])),
        Err(ConfigError::MissingValue(_))
    ));
    assert!(matches!(
        parse_args_from(args(&["positional"])),
        Err(ConfigError::UnknownOption { .. })
    ));

    fs::write(dir.path().join("ledgerd.conf"), "networkk=regtest\n").expect("write conf");
    match parse_args_from(args(&["--datadir", &datadir])) {
        Err(ConfigError::UnknownOption { origin, .. }) => assert!(origin.ends_with("ledgerd.conf")),
        other => panic!("expected conf error, got {other:?}"),
    }
}

#[test]
fn help_and_version_short_circuit() {
    assert!(matches!(
        parse_args_from(args(&["--bogus", "-h"])),
        Err(ConfigError::UnknownOption { .. })
    ));
    assert!(matches!(
        parse_args_from(args(&["--help"])),
        Ok(CliAction::PrintHelp)
    ));
    assert!(matches!(
        parse_args_from(args(&["-V"])),
        Ok(CliAction::PrintVersion)
    ));
}
