//! Full-collection replace ("save").
//!
//! The store has no "replace table" primitive, so a save is a scan, one batch
//! delete of every current row, and one batch put of the new rows with fresh
//! positions. The delete and the put are separate requests: a reader scanning
//! between them sees an empty collection, and a failed put leaves the table
//! empty. Both are accepted for a single-editor list.

use std::collections::HashSet;

use crate::codec::{encode_for_storage, to_item};
use crate::config::PROGRAM_KEY;
use crate::error::{ProgramError, StoreError, ValidationError};
use crate::handle::StoreHandle;
use crate::models::EditRecord;
use crate::scanner::scan_all;
use crate::store::{TableStore, WriteRequest};

/// Replace the stored Program collection with `candidates`, in order.
pub async fn replace_all<S: TableStore>(
    handle: &mut StoreHandle<S>,
    max_programs: usize,
    candidates: &[EditRecord],
) -> Result<(), ProgramError> {
    validate_candidates(max_programs, candidates)?;

    // Encode before touching the store so a malformed record cannot leave the
    // table half-replaced.
    let puts = encode_positions(candidates)?;

    let table = handle.tables().program.clone();
    let store = handle.store()?;

    let current = scan_all(store, &table).await?;
    if !current.is_empty() {
        let deletes = current
            .iter()
            .map(|item| PROGRAM_KEY.key_of(&table, item).map(WriteRequest::Delete))
            .collect::<Result<Vec<_>, _>>()?;
        log::debug!("deleting {} programs from {}", deletes.len(), table);
        store.batch_write(&table, deletes).await?;
    }

    if puts.is_empty() {
        log::info!("program collection in {} emptied", table);
        return Ok(());
    }

    log::debug!("writing {} programs to {}", puts.len(), table);
    store.batch_write(&table, puts).await?;
    log::info!("program collection in {} replaced ({} items)", table, candidates.len());
    Ok(())
}

/// Size and key checks that run before any store access.
///
/// Keys must be present and unique, otherwise positions would no longer be dense.
pub fn validate_candidates(
    max_programs: usize,
    candidates: &[EditRecord],
) -> Result<(), ValidationError> {
    if candidates.len() > max_programs {
        return Err(ValidationError::TooManyPrograms {
            count: candidates.len(),
            limit: max_programs,
        });
    }

    let mut seen = HashSet::with_capacity(candidates.len());
    for (index, candidate) in candidates.iter().enumerate() {
        if candidate.pid.is_empty() {
            return Err(ValidationError::EmptyPid { index });
        }
        if !seen.insert(candidate.pid.as_str()) {
            return Err(ValidationError::DuplicatePid {
                pid: candidate.pid.clone(),
            });
        }
    }
    Ok(())
}

fn encode_positions(candidates: &[EditRecord]) -> Result<Vec<WriteRequest>, StoreError> {
    candidates
        .iter()
        .zip(1u32..)
        .map(|(candidate, pos)| to_item(&encode_for_storage(candidate, pos)).map(WriteRequest::Put))
        .collect()
}
