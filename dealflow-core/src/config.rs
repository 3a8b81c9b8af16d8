//! Configuration management for dealflow
//!
//! Handles CLI argument parsing, config file loading, and defaults.

use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::deal::TokenAmount;
use crate::devnet::{DevNetConfig, ProviderBehavior};
use crate::importer::DEFAULT_FANOUT;
use crate::scenario::ScenarioConfig;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the client keeps its blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Rocksdb,
}

#[derive(Parser, Debug)]
#[command(name = "dealflow")]
#[command(about = "Storage deal flow client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the deal flow scenario against the dev network
    Run(RunCommand),
}

#[derive(Parser, Debug, Clone)]
pub struct RunCommand {
    /// Load settings from a TOML file instead of the flags below
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Data directory for the persistent block store
    #[arg(long, default_value = "./data")]
    pub data_dir: PathBuf,

    /// Client block store backend
    #[arg(long, value_enum, default_value_t = StoreBackend::Memory)]
    pub store: StoreBackend,

    /// Logging level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    pub log_level: String,

    /// Milliseconds between produced blocks
    #[arg(long, default_value_t = 1000)]
    pub block_interval_ms: u64,

    /// Milliseconds between deal status polls
    #[arg(long, default_value_t = 500)]
    pub poll_interval_ms: u64,

    /// Retrieve a CAR archive and decode it before comparing
    #[arg(long)]
    pub archive: bool,

    /// Size of the generated payload in bytes
    #[arg(long, default_value_t = 600)]
    pub payload_size: usize,

    /// Seed of the generated payload
    #[arg(long, default_value_t = 5)]
    pub payload_seed: u64,

    /// Deal price per epoch (in smallest currency unit)
    #[arg(long, default_value_t = 1_000_000)]
    pub price_per_epoch: u64,

    /// Minimum deal duration in epochs
    #[arg(long, default_value_t = 100)]
    pub min_duration: u64,

    /// Import chunk size in bytes
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Links per file node
    #[arg(long, default_value_t = DEFAULT_FANOUT)]
    pub fanout: usize,

    /// Give up waiting for the deal after this many seconds
    #[arg(long)]
    pub deal_deadline_secs: Option<u64>,

    /// Skip proof validation on the provider (faster sealing)
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    pub insecure_proof_validation: bool,

    /// How the dev provider handles deals
    #[arg(long, value_enum, default_value_t = ProviderBehavior::Accept)]
    pub behavior: ProviderBehavior,

    /// Print Prometheus metrics after the run
    #[arg(long)]
    pub metrics: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub data_dir: PathBuf,
    pub store: StoreBackend,
    pub log_level: String,
    pub block_interval_ms: u64,
    pub poll_interval_ms: u64,
    pub archive: bool,
    pub payload_size: usize,
    pub payload_seed: u64,
    pub price_per_epoch: u64,
    pub min_duration: u64,
    pub chunk_size: usize,
    pub fanout: usize,
    pub deal_deadline_secs: Option<u64>,
    pub insecure_proof_validation: bool,
    pub behavior: ProviderBehavior,
    pub metrics: bool,
}

impl Config {
    /// Create config from CLI arguments
    pub fn from_cli() -> Result<Self, ConfigError> {
        let cli = Cli::parse();

        let config = match cli.command {
            Commands::Run(cmd) => match &cmd.config {
                Some(path) => Self::load_from_file(path)?,
                None => cmd.into(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Load config from a TOML file; missing keys take their defaults
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunk_size == 0 {
            return Err(ConfigError::Invalid("chunk_size must be greater than 0".into()));
        }
        if self.fanout < 2 {
            return Err(ConfigError::Invalid("fanout must be at least 2".into()));
        }
        if self.block_interval_ms == 0 || self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("intervals must be greater than 0".into()));
        }
        Ok(())
    }

    /// Scenario parameters
    pub fn scenario(&self) -> ScenarioConfig {
        ScenarioConfig {
            block_interval: Duration::from_millis(self.block_interval_ms),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            archive: self.archive,
            payload_size: self.payload_size,
            payload_seed: self.payload_seed,
            price_per_epoch: TokenAmount(u128::from(self.price_per_epoch)),
            min_duration: self.min_duration,
            chunk_size: self.chunk_size,
            fanout: self.fanout,
            deal_deadline: self.deal_deadline_secs.map(Duration::from_secs),
        }
    }

    /// Dev network parameters
    pub fn devnet(&self) -> DevNetConfig {
        DevNetConfig {
            behavior: self.behavior,
            insecure_proof_validation: self.insecure_proof_validation,
            ..DevNetConfig::default()
        }
    }

    /// Directory of the persistent block store
    pub fn block_dir(&self) -> PathBuf {
        self.data_dir.join("blocks")
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            data_dir: PathBuf::from("./data"),
            store: StoreBackend::Memory,
            log_level: "info".to_string(),
            block_interval_ms: 1000,
            poll_interval_ms: 500,
            archive: false,
            payload_size: 600,
            payload_seed: 5,
            price_per_epoch: 1_000_000,
            min_duration: 100,
            chunk_size: DEFAULT_CHUNK_SIZE,
            fanout: DEFAULT_FANOUT,
            deal_deadline_secs: None,
            insecure_proof_validation: true,
            behavior: ProviderBehavior::Accept,
            metrics: false,
        }
    }
}

impl From<RunCommand> for Config {
    fn from(cmd: RunCommand) -> Self {
        Config {
            data_dir: cmd.data_dir,
            store: cmd.store,
            log_level: cmd.log_level,
            block_interval_ms: cmd.block_interval_ms,
            poll_interval_ms: cmd.poll_interval_ms,
            archive: cmd.archive,
            payload_size: cmd.payload_size,
            payload_seed: cmd.payload_seed,
            price_per_epoch: cmd.price_per_epoch,
            min_duration: cmd.min_duration,
            chunk_size: cmd.chunk_size,
            fanout: cmd.fanout,
            deal_deadline_secs: cmd.deal_deadline_secs,
            insecure_proof_validation: cmd.insecure_proof_validation,
            behavior: cmd.behavior,
            metrics: cmd.metrics,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        let cli = Cli::try_parse_from(args).unwrap();
        match cli.command {
            Commands::Run(cmd) => cmd.into(),
        }
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.store, StoreBackend::Memory);
        assert_eq!(config.log_level, "info");
        assert!(config.insecure_proof_validation);

        let scenario = config.scenario();
        assert_eq!(scenario, ScenarioConfig::default());
    }

    #[test]
    fn test_config_from_run_command() {
        let config = parse(&[
            "dealflow",
            "run",
            "--store",
            "rocksdb",
            "--block-interval-ms",
            "10",
            "--archive",
            "--price-per-epoch",
            "42",
            "--deal-deadline-secs",
            "30",
            "--insecure-proof-validation",
            "false",
            "--behavior",
            "reject-on-submit",
        ]);

        assert_eq!(config.store, StoreBackend::Rocksdb);
        assert!(config.archive);
        assert!(!config.insecure_proof_validation);
        assert_eq!(config.behavior, ProviderBehavior::RejectOnSubmit);

        let scenario = config.scenario();
        assert_eq!(scenario.block_interval, Duration::from_millis(10));
        assert_eq!(scenario.price_per_epoch, TokenAmount(42));
        assert_eq!(scenario.deal_deadline, Some(Duration::from_secs(30)));
        assert!(!config.devnet().insecure_proof_validation);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dealflow.toml");
        std::fs::write(
            &path,
            "store = \"rocksdb\"\narchive = true\npayload_size = 4096\nbehavior = \"fail\"\n",
        )
        .unwrap();

        let config = Config::load_from_file(&path).unwrap();

        assert_eq!(config.store, StoreBackend::Rocksdb);
        assert!(config.archive);
        assert_eq!(config.payload_size, 4096);
        assert_eq!(config.behavior, ProviderBehavior::Fail);
        // Unset keys keep their defaults
        assert_eq!(config.payload_seed, 5);
        assert_eq!(config.block_interval_ms, 1000);
    }

    #[test]
    fn test_invalid_layout_rejected() {
        let config = Config {
            fanout: 1,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = Config {
            chunk_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        assert!(Config::default().validate().is_ok());
    }
}
