//! Store configuration
//!
//! Built once at process start, either explicitly through [`StoreConfigBuilder`]
//! or from the environment. Missing or malformed required values fail here,
//! never in the middle of an operation.

use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use directories::ProjectDirs;

use crate::store::{KeySchema, TableDef};

pub const DEFAULT_REGION: &str = "local";
pub const DEFAULT_STAGE: &str = "dev";
pub const DEFAULT_SERVICE: &str = "programdb";
pub const DEFAULT_SCAN_PAGE_SIZE: usize = 100;

pub const PROGRAM_TABLE: &str = "Program";
pub const HISTORY_TABLE: &str = "ProgramHistory";

/// Program rows are keyed by `pid` alone.
pub const PROGRAM_KEY: KeySchema = KeySchema {
    hash_attr: "pid",
    range_attr: None,
};

/// History rows are keyed by `pid` and the moment of the transition.
pub const HISTORY_KEY: KeySchema = KeySchema {
    hash_attr: "pid",
    range_attr: Some("downloadTime"),
};

/// Environment variables read by [`StoreConfig::from_env`].
pub mod env_keys {
    pub const REGION: &str = "PROGRAMDB_REGION";
    pub const ENDPOINT: &str = "PROGRAMDB_ENDPOINT";
    pub const STAGE: &str = "STAGE";
    pub const SERVICE: &str = "SERVICE_NAME";
    pub const MAX_PROGRAMS: &str = "MAX_PROGRAMS";
    pub const SCAN_PAGE_SIZE: &str = "PROGRAMDB_SCAN_PAGE_SIZE";
}

/// Names of the two tables this layer works with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNames {
    pub program: String,
    pub history: String,
}

impl TableNames {
    pub fn new(service: &str, stage: &str) -> Self {
        let prefix = format!("{service}-{stage}-");
        Self {
            program: format!("{prefix}{PROGRAM_TABLE}"),
            history: format!("{prefix}{HISTORY_TABLE}"),
        }
    }

    pub fn definitions(&self) -> [TableDef; 2] {
        [
            TableDef {
                name: self.program.clone(),
                key: PROGRAM_KEY,
            },
            TableDef {
                name: self.history.clone(),
                key: HISTORY_KEY,
            },
        ]
    }
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Region label of the store; the SQLite backend only reports it in logs.
    pub region: String,
    /// Location of the database file.
    pub endpoint: PathBuf,
    pub stage: String,
    pub service: String,
    /// Upper bound on the size of the Program collection.
    pub max_programs: usize,
    /// Items fetched per scan round trip.
    pub scan_page_size: usize,
    tables: TableNames,
}

impl StoreConfig {
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::new()
    }

    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through an arbitrary lookup (e.g. a map in tests).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_programs = lookup(env_keys::MAX_PROGRAMS)
            .ok_or_else(|| anyhow!("{} must be set", env_keys::MAX_PROGRAMS))?;
        let max_programs = parse_positive(env_keys::MAX_PROGRAMS, &max_programs)?;

        let mut builder = StoreConfigBuilder::new().max_programs(max_programs);

        if let Some(region) = lookup(env_keys::REGION) {
            builder = builder.region(region);
        }
        if let Some(endpoint) = lookup(env_keys::ENDPOINT) {
            builder = builder.endpoint(PathBuf::from(endpoint));
        }
        if let Some(stage) = lookup(env_keys::STAGE) {
            builder = builder.stage(stage);
        }
        if let Some(service) = lookup(env_keys::SERVICE) {
            builder = builder.service(service);
        }
        if let Some(size) = lookup(env_keys::SCAN_PAGE_SIZE) {
            builder = builder.scan_page_size(parse_positive(env_keys::SCAN_PAGE_SIZE, &size)?);
        }

        builder.build()
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }
}

fn parse_positive(name: &str, raw: &str) -> Result<usize> {
    let value: usize = raw
        .trim()
        .parse()
        .with_context(|| format!("{name} must be a positive integer, got {raw:?}"))?;
    if value == 0 {
        bail!("{name} must be a positive integer, got 0");
    }
    Ok(value)
}

/// Table names follow the usual managed-table rules: 3..=255 chars of `[A-Za-z0-9_.-]`.
fn validate_table_name(name: &str) -> Result<()> {
    let len_ok = (3..=255).contains(&name.len());
    let chars_ok = name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if !len_ok || !chars_ok {
        bail!("invalid table name {name:?}");
    }
    Ok(())
}

/// Per-user database location, e.g. `~/.local/share/programdb/programdb.sqlite3`.
pub fn default_endpoint() -> Result<PathBuf> {
    let dirs = ProjectDirs::from("com", "programdb", "programdb")
        .ok_or_else(|| anyhow!("failed to resolve per-user app data directory"))?;
    Ok(dirs.data_dir().join("programdb.sqlite3"))
}

/// Builder for StoreConfig.
pub struct StoreConfigBuilder {
    region: String,
    endpoint: Option<PathBuf>,
    stage: String,
    service: String,
    max_programs: Option<usize>,
    scan_page_size: usize,
}

impl StoreConfigBuilder {
    pub fn new() -> Self {
        Self {
            region: DEFAULT_REGION.to_string(),
            endpoint: None,
            stage: DEFAULT_STAGE.to_string(),
            service: DEFAULT_SERVICE.to_string(),
            max_programs: None,
            scan_page_size: DEFAULT_SCAN_PAGE_SIZE,
        }
    }

    pub fn region<S: Into<String>>(mut self, region: S) -> Self {
        self.region = region.into();
        self
    }

    pub fn endpoint(mut self, path: PathBuf) -> Self {
        self.endpoint = Some(path);
        self
    }

    pub fn stage<S: Into<String>>(mut self, stage: S) -> Self {
        self.stage = stage.into();
        self
    }

    pub fn service<S: Into<String>>(mut self, service: S) -> Self {
        self.service = service.into();
        self
    }

    pub fn max_programs(mut self, max: usize) -> Self {
        self.max_programs = Some(max);
        self
    }

    pub fn scan_page_size(mut self, size: usize) -> Self {
        self.scan_page_size = size;
        self
    }

    pub fn build(self) -> Result<StoreConfig> {
        let max_programs = match self.max_programs {
            Some(0) => bail!("max_programs must be a positive integer"),
            Some(max) => max,
            None => bail!("max_programs is required"),
        };
        if self.scan_page_size == 0 {
            bail!("scan_page_size must be a positive integer");
        }

        let tables = TableNames::new(&self.service, &self.stage);
        validate_table_name(&tables.program)?;
        validate_table_name(&tables.history)?;

        let endpoint = match self.endpoint {
            Some(path) => path,
            None => default_endpoint()?,
        };

        Ok(StoreConfig {
            region: self.region,
            endpoint,
            stage: self.stage,
            service: self.service,
            max_programs,
            scan_page_size: self.scan_page_size,
            tables,
        })
    }
}

impl Default for StoreConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
