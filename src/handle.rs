use crate::config::{StoreConfig, TableNames};
use crate::error::StoreError;
use crate::store::{Connector, TableStore};

/// Store connection scoped to one logical operation.
///
/// The connection is released by [`StoreHandle::close`] or, failing that, when
/// the handle is dropped, so every exit path of the owning operation ends with
/// the connection closed. A handle is never shared between operations.
pub struct StoreHandle<S: TableStore> {
    store: Option<S>,
    tables: TableNames,
}

impl<S: TableStore> StoreHandle<S> {
    /// Connect through `connector` using `config`.
    pub async fn open<C>(connector: &C, config: &StoreConfig) -> Result<Self, StoreError>
    where
        C: Connector<Store = S>,
    {
        log::debug!(
            "opening store handle (region={}, endpoint={})",
            config.region,
            config.endpoint.display()
        );
        let store = connector.connect(config).await?;
        Ok(Self {
            store: Some(store),
            tables: config.tables().clone(),
        })
    }

    /// A handle with no connection behind it; closing it does nothing.
    pub fn detached(tables: TableNames) -> Self {
        Self {
            store: None,
            tables,
        }
    }

    pub fn tables(&self) -> &TableNames {
        &self.tables
    }

    pub fn is_open(&self) -> bool {
        self.store.is_some()
    }

    /// The live connection, or [`StoreError::Closed`] once the handle is closed.
    pub fn store(&mut self) -> Result<&mut S, StoreError> {
        self.store.as_mut().ok_or(StoreError::Closed)
    }

    /// Release the connection. Calling this again is a no-op.
    pub fn close(&mut self) {
        if let Some(mut store) = self.store.take() {
            store.close();
            log::debug!("store handle closed");
        }
    }
}

impl<S: TableStore> Drop for StoreHandle<S> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteConnector;
    use std::path::PathBuf;

    fn config(dir: &tempfile::TempDir) -> StoreConfig {
        StoreConfig::builder()
            .max_programs(10)
            .endpoint(dir.path().join("handle.sqlite3"))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_and_close_twice() {
        let dir = tempfile::tempdir().unwrap();
        let mut handle = StoreHandle::open(&SqliteConnector, &config(&dir)).await.unwrap();
        assert!(handle.is_open());
        assert!(handle.store().is_ok());

        handle.close();
        assert!(!handle.is_open());
        handle.close();
        assert!(matches!(handle.store(), Err(StoreError::Closed)));
    }

    #[test]
    fn test_detached_handle_closes_quietly() {
        let mut handle: StoreHandle<crate::store::SqliteStore> =
            StoreHandle::detached(TableNames::new("svc", "dev"));
        assert!(!handle.is_open());
        handle.close();
        handle.close();
    }

    #[tokio::test]
    async fn test_open_fails_on_unusable_endpoint() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();

        let config = StoreConfig::builder()
            .max_programs(10)
            .endpoint(PathBuf::from(&blocker).join("db.sqlite3"))
            .build()
            .unwrap();
        assert!(StoreHandle::open(&SqliteConnector, &config).await.is_err());
    }
}
