// Application configuration
// Layered: conf/application.yml, then DISTLOCK_* environment variables, then command line flags

use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use config::{Config, ConfigError, Environment, File};
use serde::de::DeserializeOwned;

use distlock_core::LockConfig;
use distlock_store::MemoryStoreConfig;

use crate::logging::LoggingConfig;

pub const DEFAULT_CONFIG_FILE: &str = "conf/application.yml";
pub const ENV_PREFIX: &str = "distlock";

pub const DEFAULT_CLIENTS: u32 = 5;
pub const DEFAULT_RESOURCE: &str = "/dist/lock/test_resource/";
pub const DEFAULT_ACQUIRE_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_WORK_MS: u64 = 2_000;

#[derive(Debug, Parser)]
#[command(name = "distlock", version, about = "Distributed lock manager over a lease-capable store")]
pub struct Cli {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short = 'c', long = "config", env = "DISTLOCK_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    pub config: String,

    /// Log level for console and files
    #[arg(long = "log-level")]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run several clients competing for one resource and report grant order
    Contend(ContendArgs),
}

#[derive(Debug, Default, Args)]
pub struct ContendArgs {
    /// Number of competing clients
    #[arg(long)]
    pub clients: Option<u32>,

    /// Resource name, used as the queue key prefix
    #[arg(long)]
    pub resource: Option<String>,

    /// Session lease TTL in seconds
    #[arg(long = "ttl-secs")]
    pub ttl_secs: Option<u64>,

    /// Per-client acquire timeout in seconds
    #[arg(long = "timeout-secs")]
    pub timeout_secs: Option<u64>,

    /// Simulated work inside the critical section, in milliseconds
    #[arg(long = "work-ms")]
    pub work_ms: Option<u64>,
}

/// Settings of the contention demo
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DemoSettings {
    pub clients: u32,
    pub resource: String,
    pub acquire_timeout: Duration,
    pub work: Duration,
}

/// Application configuration loaded from file, environment and flags
#[derive(Clone, Debug)]
pub struct Configuration {
    pub config: Config,
}

impl Configuration {
    pub fn new(cli: &Cli) -> anyhow::Result<Self> {
        let mut builder = Config::builder()
            .add_source(File::with_name(&cli.config).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator(".")
                    .try_parsing(true),
            );

        if let Some(level) = &cli.log_level {
            builder = builder.set_override("logging.level", level.as_str())?;
        }

        let Command::Contend(args) = &cli.command;
        if let Some(clients) = args.clients {
            builder = builder.set_override("demo.clients", clients)?;
        }
        if let Some(resource) = &args.resource {
            builder = builder.set_override("demo.resource", resource.as_str())?;
        }
        if let Some(ttl_secs) = args.ttl_secs {
            builder = builder.set_override("lock.ttl_ms", ttl_secs.saturating_mul(1000))?;
        }
        if let Some(timeout_secs) = args.timeout_secs {
            builder =
                builder.set_override("demo.acquire_timeout_ms", timeout_secs.saturating_mul(1000))?;
        }
        if let Some(work_ms) = args.work_ms {
            builder = builder.set_override("demo.work_ms", work_ms)?;
        }

        Ok(Configuration {
            config: builder.build()?,
        })
    }

    /// Deserialize a section, falling back to its defaults when absent
    fn section<T: DeserializeOwned + Default>(&self, key: &str) -> anyhow::Result<T> {
        match self.config.get::<T>(key) {
            Ok(value) => Ok(value),
            Err(ConfigError::NotFound(_)) => Ok(T::default()),
            Err(e) => Err(anyhow::anyhow!("invalid '{}' configuration: {}", key, e)),
        }
    }

    // ========================================================================
    // Lock Configuration
    // ========================================================================

    pub fn lock_config(&self) -> anyhow::Result<LockConfig> {
        let config: LockConfig = self.section("lock")?;
        config.validate()?;
        Ok(config)
    }

    pub fn store_config(&self) -> anyhow::Result<MemoryStoreConfig> {
        self.section("store")
    }

    // ========================================================================
    // Demo Configuration
    // ========================================================================

    pub fn demo_settings(&self) -> DemoSettings {
        DemoSettings {
            clients: self
                .config
                .get_int("demo.clients")
                .map(|v| v.max(1) as u32)
                .unwrap_or(DEFAULT_CLIENTS),
            resource: self
                .config
                .get_string("demo.resource")
                .unwrap_or(DEFAULT_RESOURCE.to_string()),
            acquire_timeout: Duration::from_millis(
                self.config
                    .get_int("demo.acquire_timeout_ms")
                    .map(|v| v.max(0) as u64)
                    .unwrap_or(DEFAULT_ACQUIRE_TIMEOUT_MS),
            ),
            work: Duration::from_millis(
                self.config
                    .get_int("demo.work_ms")
                    .map(|v| v.max(0) as u64)
                    .unwrap_or(DEFAULT_WORK_MS),
            ),
        }
    }

    // ========================================================================
    // Logging Configuration
    // ========================================================================

    pub fn logging_config(&self) -> LoggingConfig {
        LoggingConfig::from_config(
            self.config.get_string("logging.dir").ok(),
            self.config.get_bool("logging.console").unwrap_or(true),
            self.config.get_bool("logging.file").unwrap_or(false),
            &self
                .config
                .get_string("logging.level")
                .unwrap_or("info".to_string()),
            &self
                .config
                .get_string("logging.rotation")
                .unwrap_or("daily".to_string()),
        )
    }
}
