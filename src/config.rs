//! Configuration management.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Defaults embedded in the binary (`config/default.toml`)
//! 2. A file passed with `--config`
//! 3. Environment variables prefixed with `MPC_`, nested keys separated by
//!    `__` (for example `MPC_RETENTION__KEEP_MONTHS=6`)
//! 4. Command-line flags

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::{PeakError, Result};

/// Command-line arguments
#[derive(Debug, Default, Parser)]
#[clap(version, about = "Tracks monthly peak player counts of servers and server groups")]
pub struct Args {
    /// Configuration file path
    #[clap(short, long, env = "MPC_CONFIG")]
    pub config: Option<PathBuf>,

    /// Address the HTTP API listens on
    #[clap(long)]
    pub listen: Option<String>,

    /// DuckDB database file, or `:memory:`
    #[clap(long)]
    pub database: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Servers registered at startup
    #[serde(default)]
    pub servers: Vec<String>,
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub sampling: SamplingConfig,
    pub retention: RetentionConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub listen: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplingConfig {
    pub interval_secs: u64,
    /// Only write a sample when a server's count differs from the last one
    /// written
    #[serde(default)]
    pub only_changes: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Whole months kept before the previous month
    pub keep_months: u32,
    pub initial_delay_secs: u64,
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub refresh_margin_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl AppConfig {
    /// Load configuration from all sources
    pub fn load(args: &Args) -> Result<Self> {
        let mut builder = config::Config::builder().add_source(config::File::from_str(
            include_str!("../config/default.toml"),
            config::FileFormat::Toml,
        ));

        if let Some(path) = &args.config {
            builder = builder.add_source(config::File::from(path.as_path()));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("MPC")
                .prefix_separator("_")
                .separator("__"),
        );

        let mut config: AppConfig = builder.build()?.try_deserialize()?;

        if let Some(listen) = &args.listen {
            config.server.listen = listen.clone();
        }
        if let Some(database) = &args.database {
            config.database.path = database.clone();
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sampling.interval_secs == 0 {
            return Err(PeakError::Config("sampling.interval_secs must be > 0".into()));
        }
        if self.retention.interval_secs == 0 {
            return Err(PeakError::Config("retention.interval_secs must be > 0".into()));
        }
        if self.cache.ttl_secs == 0 {
            return Err(PeakError::Config("cache.ttl_secs must be > 0".into()));
        }
        if self.cache.refresh_margin_secs >= self.cache.ttl_secs {
            return Err(PeakError::Config(
                "cache.refresh_margin_secs must be below cache.ttl_secs".into(),
            ));
        }
        Ok(())
    }

    pub fn sampling_interval(&self) -> Duration {
        Duration::from_secs(self.sampling.interval_secs)
    }

    pub fn retention_initial_delay(&self) -> Duration {
        Duration::from_secs(self.retention.initial_delay_secs)
    }

    pub fn retention_interval(&self) -> Duration {
        Duration::from_secs(self.retention.interval_secs)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache.ttl_secs)
    }

    pub fn cache_refresh_margin(&self) -> Duration {
        Duration::from_secs(self.cache.refresh_margin_secs)
    }
}
