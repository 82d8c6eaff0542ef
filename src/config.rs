//! Configuration loading and validation.
//!
//! Sources are merged lowest to highest precedence: built-in defaults, a
//! config file (TOML or YAML), `QUARRY_*` environment variables, then
//! command-line flags. The result is validated into plain values before any
//! pipeline component is constructed.

use crate::cli::Cli;
use derive_more::{Display, Error};
use figment::providers::{Env, Format, Serialized, Toml, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A configuration error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    #[display("configuration error: {_0}")]
    Figment(figment::Error),
    #[display("missing required setting: {_0}")]
    Missing(#[error(not(source))] &'static str),
}

/// Fully-resolved process configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Source bucket to sync artifacts from.
    pub bucket: String,
    /// Directory artifacts are downloaded into and scanned from.
    pub artifact_dir: PathBuf,
    /// Directory of YARA rule sources.
    pub rule_dir: PathBuf,
    /// SQLite database recording artifacts, rules, and results.
    pub database: PathBuf,
    /// Custom endpoint URL for S3-compatible services. A plain-http URL is
    /// how TLS-less local deployments are expressed.
    pub endpoint: Option<String>,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    /// Path-style addressing, required by most non-AWS services.
    pub force_path_style: bool,
    /// Worker count for the download and scan pools.
    pub workers: usize,
    /// Seconds between bucket listing passes.
    pub list_interval_secs: u64,
    /// Seconds between local-directory refreshes of the ignore set.
    pub refresh_interval_secs: u64,
    /// Budget in seconds for a single scan.
    pub scan_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            artifact_dir: PathBuf::new(),
            rule_dir: PathBuf::new(),
            database: PathBuf::new(),
            endpoint: None,
            region: "us-east-1".to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            force_path_style: false,
            workers: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
            list_interval_secs: 1,
            refresh_interval_secs: 1,
            scan_timeout_secs: 5,
        }
    }
}

impl Config {
    /// Merge defaults, config file, environment, and CLI flags, then
    /// validate.
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        match &cli.config {
            Some(path) => {
                figment = match path.extension().and_then(|ext| ext.to_str()) {
                    Some("yml" | "yaml") => figment.merge(Yaml::file(path)),
                    _ => figment.merge(Toml::file(path)),
                };
            },
            None => {
                // A quarry.toml next to the process, then the user-level
                // config; both optional.
                figment = figment.merge(Toml::file("quarry.toml"));
                if let Some(path) = Self::user_config_path() {
                    figment = figment.merge(Toml::file(path));
                }
            },
        }
        let mut config: Config = figment
            .merge(Env::prefixed("QUARRY_"))
            .extract()
            .map_err(ErrorKind::Figment)?;
        config.apply_cli(cli);
        config.validate()?;
        Ok(config)
    }

    /// The user-level config location (e.g. `~/.config/quarry/quarry.toml`).
    fn user_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "quarry")
            .map(|dirs| dirs.config_dir().join("quarry.toml"))
    }

    /// Flags beat every other source.
    fn apply_cli(&mut self, cli: &Cli) {
        if let Some(bucket) = &cli.bucket {
            self.bucket = bucket.clone();
        }
        if let Some(artifact_dir) = &cli.artifact_dir {
            self.artifact_dir = artifact_dir.clone();
        }
        if let Some(rule_dir) = &cli.rule_dir {
            self.rule_dir = rule_dir.clone();
        }
        if let Some(database) = &cli.database {
            self.database = database.clone();
        }
        if let Some(workers) = cli.workers {
            self.workers = workers;
        }
    }

    fn validate(&self) -> Result<()> {
        if self.bucket.is_empty() {
            exn::bail!(ErrorKind::Missing("bucket"));
        }
        if self.artifact_dir.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Missing("artifact_dir"));
        }
        if self.rule_dir.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Missing("rule_dir"));
        }
        if self.database.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Missing("database"));
        }
        if self.workers == 0 {
            exn::bail!(ErrorKind::Missing("workers"));
        }
        Ok(())
    }
}
