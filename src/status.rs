//! Status patch with mandatory history.
//!
//! Every accepted status change is written together with its History row in a
//! single store transaction, so the Program table and the audit trail cannot
//! diverge.

use std::collections::{HashMap, HashSet};

use serde_json::Value;

use crate::codec::{encode_for_history, from_item, to_item};
use crate::error::{ProgramError, ValidationError};
use crate::handle::StoreHandle;
use crate::models::{ProgramStatus, StatusUpdate, StoredRecord};
use crate::scanner::scan_all;
use crate::store::{Item, Key, TableStore, TransactItem};

/// A request entry that passed validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidUpdate {
    pub pid: String,
    pub status: ProgramStatus,
}

/// Check every entry before anything reaches the store.
///
/// `pid` must be non-empty and unique within the request; `status` must be one
/// of the terminal statuses.
pub fn validate_updates(updates: &[StatusUpdate]) -> Result<Vec<ValidUpdate>, ValidationError> {
    let mut seen = HashSet::with_capacity(updates.len());
    let mut valid = Vec::with_capacity(updates.len());

    for (index, update) in updates.iter().enumerate() {
        if update.pid.is_empty() {
            return Err(ValidationError::EmptyPid { index });
        }
        let status = ProgramStatus::from_str(&update.status)
            .filter(|s| s.is_terminal())
            .ok_or_else(|| ValidationError::DisallowedStatus {
                pid: update.pid.clone(),
                status: update.status.clone(),
            })?;
        if !seen.insert(update.pid.as_str()) {
            return Err(ValidationError::DuplicatePid {
                pid: update.pid.clone(),
            });
        }
        valid.push(ValidUpdate {
            pid: update.pid.clone(),
            status,
        });
    }

    Ok(valid)
}

/// Apply `updates` and append one History row per update, atomically.
pub async fn apply_status_updates<S: TableStore>(
    handle: &mut StoreHandle<S>,
    updates: &[StatusUpdate],
) -> Result<(), ProgramError> {
    let updates = validate_updates(updates)?;
    if updates.is_empty() {
        return Ok(());
    }

    let tables = handle.tables().clone();
    let store = handle.store()?;

    let current = scan_all(store, &tables.program).await?;
    let mut by_pid: HashMap<String, StoredRecord> = HashMap::with_capacity(current.len());
    for item in &current {
        let record: StoredRecord = from_item(item)?;
        by_pid.insert(record.pid.clone(), record);
    }

    let mut program_ops = Vec::with_capacity(updates.len());
    let mut history_ops = Vec::with_capacity(updates.len());
    for update in &updates {
        let Some(stored) = by_pid.get(&update.pid) else {
            log::warn!("status update for unknown program {}", update.pid);
            return Err(ProgramError::NotFound {
                pid: update.pid.clone(),
            });
        };

        program_ops.push(TransactItem::UpdateExisting {
            table: tables.program.clone(),
            key: Key::hash(update.pid.clone()),
            set: status_only(update.status),
        });

        let merged = StoredRecord {
            status: update.status,
            ..stored.clone()
        };
        history_ops.push(TransactItem::InsertNew {
            table: tables.history.clone(),
            item: to_item(&encode_for_history(&merged))?,
        });
    }

    program_ops.extend(history_ops);
    store.transact_write(program_ops).await?;

    log::info!(
        "applied {} status updates to {} with history",
        updates.len(),
        tables.program
    );
    Ok(())
}

fn status_only(status: ProgramStatus) -> Item {
    let mut set = Item::new();
    set.insert(
        "status".to_string(),
        Value::String(status.as_str().to_string()),
    );
    set
}
