use clap::{Parser, Subcommand};
use serde::Deserialize;
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::factory::BackendType;

/// Environment variable that overrides the configured database path.
pub const DB_PATH_ENV: &str = "MEALBOT_DB";

#[derive(Parser, Debug)]
#[command(name = "mealbot", about = "Mealbot - who owes whom a meal")]
pub struct CliArgs {
    /// Path to config file
    #[arg(short, long, default_value = "mealbot.toml")]
    pub config: String,

    /// Storage backend (overrides config file)
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendType>,

    /// Database location (overrides config file and MEALBOT_DB)
    #[arg(short, long)]
    pub database: Option<String>,

    /// Log level (overrides config file)
    #[arg(short, long)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum Command {
    /// List all accounts in creation order
    Users,
    /// Look up an account by its numeric id
    Whoami { id: u64 },
    /// Create an account
    AddUser { name: String },
    /// Record that PAYER owes RECIPIENT some credits
    Record {
        payer: String,
        recipient: String,
        credits: u32,
    },
    /// List records, newest first
    Records {
        #[arg(long)]
        user1: Option<String>,
        #[arg(long)]
        user2: Option<String>,
        #[arg(long)]
        limit: Option<u64>,
        /// RFC 3339 start of the window
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<OffsetDateTime>,
        /// RFC 3339 end of the window
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<OffsetDateTime>,
    },
    /// Show debt summaries
    Summary {
        #[arg(long)]
        user: Option<String>,
        #[arg(long, value_parser = parse_timestamp)]
        start: Option<OffsetDateTime>,
        #[arg(long, value_parser = parse_timestamp)]
        end: Option<OffsetDateTime>,
    },
    /// Print the net debt table
    Debts,
    /// Dump the store in the snapshot format
    Export,
}

pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime, String> {
    OffsetDateTime::parse(s, &Rfc3339).map_err(|e| format!("invalid RFC 3339 timestamp: {}", e))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_logging")]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: BackendType,

    #[serde(default = "default_path")]
    pub path: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_storage() -> StorageConfig {
    StorageConfig {
        backend: default_backend(),
        path: default_path(),
    }
}

fn default_logging() -> LoggingConfig {
    LoggingConfig {
        level: default_log_level(),
        json: false,
    }
}

fn default_backend() -> BackendType {
    BackendType::Json
}

fn default_path() -> String {
    "./Database.json".to_string()
}

fn default_log_level() -> String {
    "warn".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Config {
            storage: default_storage(),
            logging: default_logging(),
        }
    }
}

impl Config {
    /// Reads the config file (a missing file means defaults), then applies
    /// the environment and CLI overrides.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let mut config = match std::fs::read_to_string(&cli.config) {
            Ok(contents) => Self::parse(&cli.config, &contents)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Config::default(),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: cli.config.clone(),
                    source,
                })
            }
        };

        if let Ok(path) = std::env::var(DB_PATH_ENV) {
            if !path.is_empty() {
                config.storage.path = path;
            }
        }

        // CLI overrides
        if let Some(backend) = cli.backend {
            config.storage.backend = backend;
        }
        if let Some(ref path) = cli.database {
            config.storage.path = path.clone();
        }
        if let Some(ref level) = cli.log_level {
            config.logging.level = level.clone();
        }

        Ok(config)
    }

    fn parse(path: &str, contents: &str) -> Result<Self, ConfigError> {
        toml::from_str(contents).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }
}
