//! Persistence layer for the program download list.
//!
//! The list lives in a scan-oriented table store (see [`store`]) next to an
//! append-only history table. [`ProgramRepository`] is the entry point used by
//! the API layer: every call opens one [`StoreHandle`], does its work and
//! closes the handle again, whatever the outcome.

pub mod codec;
pub mod config;
pub mod error;
pub mod handle;
pub mod models;
pub mod replace;
pub mod scanner;
pub mod status;
pub mod store;

pub use config::{StoreConfig, StoreConfigBuilder, TableNames};
pub use error::{ProgramError, Result, StoreError, ValidationError};
pub use handle::StoreHandle;
pub use models::{EditRecord, HistoryRecord, ProgramStatus, StatusUpdate, StoredRecord, ANY_DAY};
pub use store::{Connector, SqliteConnector, TableStore};

use codec::{decode_for_edit, from_item};
use scanner::scan_all;

/// Public operations over the Program and ProgramHistory tables.
pub struct ProgramRepository<C: Connector = SqliteConnector> {
    config: StoreConfig,
    connector: C,
}

impl ProgramRepository<SqliteConnector> {
    /// Repository backed by the SQLite store at `config.endpoint`.
    pub fn new(config: StoreConfig) -> Self {
        Self::with_connector(config, SqliteConnector)
    }
}

impl<C: Connector> ProgramRepository<C> {
    pub fn with_connector(config: StoreConfig, connector: C) -> Self {
        Self { config, connector }
    }

    /// Every stored program, ordered by position.
    pub async fn load_all(&self) -> Result<Vec<EditRecord>> {
        let mut handle = self.open().await?;
        let result = load_programs(&mut handle).await;
        finish("load_all", handle, result)
    }

    /// Replace the whole stored list with `programs`, positions following their order.
    ///
    /// Rejected requests never open the store.
    pub async fn save_all(&self, programs: &[EditRecord]) -> Result<()> {
        log::info!("save_all: {} programs", programs.len());
        if let Err(e) = replace::validate_candidates(self.config.max_programs, programs) {
            return reject("save_all", e.into());
        }
        let mut handle = self.open().await?;
        let result = replace::replace_all(&mut handle, self.config.max_programs, programs).await;
        finish("save_all", handle, result)
    }

    /// Change statuses and record each change in the history table, all or nothing.
    pub async fn apply_status_updates(&self, updates: &[StatusUpdate]) -> Result<()> {
        log::info!("apply_status_updates: {} updates", updates.len());
        match status::validate_updates(updates) {
            Err(e) => return reject("apply_status_updates", e.into()),
            Ok(valid) if valid.is_empty() => return Ok(()),
            Ok(_) => {}
        }
        let mut handle = self.open().await?;
        let result = status::apply_status_updates(&mut handle, updates).await;
        finish("apply_status_updates", handle, result)
    }

    /// Every recorded status transition, oldest first.
    pub async fn load_history(&self) -> Result<Vec<HistoryRecord>> {
        let mut handle = self.open().await?;
        let result = load_history_rows(&mut handle).await;
        finish("load_history", handle, result)
    }

    async fn open(&self) -> Result<StoreHandle<C::Store>> {
        StoreHandle::open(&self.connector, &self.config)
            .await
            .map_err(|e| {
                log::warn!("failed to open store at {}: {}", self.config.endpoint.display(), e);
                ProgramError::from(e)
            })
    }
}

fn finish<S: TableStore, T>(op: &str, mut handle: StoreHandle<S>, result: Result<T>) -> Result<T> {
    handle.close();
    if let Err(e) = &result {
        log_failure(op, e);
    }
    result
}

fn reject<T>(op: &str, e: ProgramError) -> Result<T> {
    log_failure(op, &e);
    Err(e)
}

fn log_failure(op: &str, e: &ProgramError) {
    if e.is_client_error() {
        log::warn!("{} rejected ({}): {}", op, e.as_str(), e);
    } else {
        log::error!("{} failed ({}): {}", op, e.as_str(), e);
    }
}

async fn load_programs<S: TableStore>(handle: &mut StoreHandle<S>) -> Result<Vec<EditRecord>> {
    let table = handle.tables().program.clone();
    let items = scan_all(handle.store()?, &table).await?;

    let mut records = items
        .iter()
        .map(decode_for_edit)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    records.sort_by_key(|r| r.pos);
    Ok(records)
}

async fn load_history_rows<S: TableStore>(handle: &mut StoreHandle<S>) -> Result<Vec<HistoryRecord>> {
    let table = handle.tables().history.clone();
    let items = scan_all(handle.store()?, &table).await?;

    let mut rows = items
        .iter()
        .map(from_item::<HistoryRecord>)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    rows.sort_by(|a, b| {
        a.download_time
            .cmp(&b.download_time)
            .then_with(|| a.pid.cmp(&b.pid))
    });
    Ok(rows)
}
