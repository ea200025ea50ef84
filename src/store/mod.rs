//! Backing store primitives.
//!
//! The persistence layer only relies on three round trips: a paginated scan,
//! a non-atomic batch write, and an all-or-nothing multi-item transaction.
//! Anything that can offer those can sit behind [`TableStore`].

use std::fmt;
use std::future::Future;

use serde_json::{Map, Value};

use crate::config::StoreConfig;
use crate::error::StoreError;

pub mod sqlite;

pub use sqlite::{SqliteConnector, SqliteStore};

/// Raw attribute map as the store holds it.
pub type Item = Map<String, Value>;

/// Primary key of an item: a hash attribute plus an optional range attribute.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Key {
    pub hash: String,
    pub range: Option<String>,
}

impl Key {
    pub fn hash<S: Into<String>>(hash: S) -> Self {
        Self {
            hash: hash.into(),
            range: None,
        }
    }

    pub fn composite<S1: Into<String>, S2: Into<String>>(hash: S1, range: S2) -> Self {
        Self {
            hash: hash.into(),
            range: Some(range.into()),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => write!(f, "({}, {})", self.hash, range),
            None => write!(f, "{}", self.hash),
        }
    }
}

/// Which attributes of an item make up its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeySchema {
    pub hash_attr: &'static str,
    pub range_attr: Option<&'static str>,
}

impl KeySchema {
    /// Extract the key of `item`. Key attributes must be non-empty strings.
    pub fn key_of(&self, table: &str, item: &Item) -> Result<Key, StoreError> {
        let hash = key_attr(table, item, self.hash_attr)?;
        let range = match self.range_attr {
            Some(attr) => Some(key_attr(table, item, attr)?),
            None => None,
        };
        Ok(Key { hash, range })
    }

    pub fn is_key_attr(&self, attr: &str) -> bool {
        attr == self.hash_attr || self.range_attr == Some(attr)
    }
}

fn key_attr(table: &str, item: &Item, attr: &str) -> Result<String, StoreError> {
    match item.get(attr) {
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(StoreError::InvalidItem {
            table: table.to_string(),
            reason: format!("key attribute {attr} is empty"),
        }),
        Some(_) => Err(StoreError::InvalidItem {
            table: table.to_string(),
            reason: format!("key attribute {attr} is not a string"),
        }),
        None => Err(StoreError::InvalidItem {
            table: table.to_string(),
            reason: format!("missing key attribute {attr}"),
        }),
    }
}

/// A table name together with its key layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableDef {
    pub name: String,
    pub key: KeySchema,
}

/// One page of a scan.
#[derive(Debug, Clone, Default)]
pub struct ScanPage {
    pub items: Vec<Item>,
    /// Present when the scan may continue; pass it back as the exclusive start key.
    pub last_evaluated_key: Option<Key>,
}

/// One entry of a batch write.
#[derive(Debug, Clone)]
pub enum WriteRequest {
    /// Insert or overwrite the whole item.
    Put(Item),
    Delete(Key),
}

/// One entry of a transaction.
#[derive(Debug, Clone)]
pub enum TransactItem {
    /// Set the given attributes on an item that must already exist.
    UpdateExisting { table: String, key: Key, set: Item },
    /// Insert an item that must not exist yet.
    InsertNew { table: String, item: Item },
}

/// The primitives the persistence layer is allowed to use.
pub trait TableStore: Send {
    /// Fetch one page of `table`, starting after `exclusive_start_key`.
    fn scan(
        &mut self,
        table: &str,
        exclusive_start_key: Option<Key>,
    ) -> impl Future<Output = Result<ScanPage, StoreError>> + Send;

    /// Apply puts and deletes to one table. No atomicity across entries.
    fn batch_write(
        &mut self,
        table: &str,
        requests: Vec<WriteRequest>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Apply every entry or none of them.
    fn transact_write(
        &mut self,
        items: Vec<TransactItem>,
    ) -> impl Future<Output = Result<(), StoreError>> + Send;

    /// Release the underlying connection. Must tolerate repeated calls.
    fn close(&mut self);
}

/// Opens store connections from configuration.
pub trait Connector: Send + Sync {
    type Store: TableStore;

    fn connect(
        &self,
        config: &StoreConfig,
    ) -> impl Future<Output = Result<Self::Store, StoreError>> + Send;
}
