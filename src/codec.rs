//! Record codec
//!
//! Pure mapping between the raw attribute maps held by the store and the
//! shapes callers work with. Apart from reading the clock nothing here has side
//! effects.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::StoreError;
use crate::models::{EditRecord, HistoryRecord, StoredRecord, ANY_DAY};
use crate::store::Item;

/// Raw Program item -> editable record.
///
/// Unknown attributes are dropped; an absent `dayOfWeek` becomes [`ANY_DAY`].
pub fn decode_for_edit(item: &Item) -> Result<EditRecord, StoreError> {
    Ok(edit_from_stored(from_item(item)?))
}

pub fn edit_from_stored(stored: StoredRecord) -> EditRecord {
    EditRecord {
        pid: stored.pid,
        status: stored.status,
        genre: stored.genre,
        quality: stored.quality,
        title: stored.title,
        synopsis: stored.synopsis,
        image_uri: stored.image_uri,
        day_of_week: stored
            .day_of_week
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| ANY_DAY.to_string()),
        modify_time: Some(stored.modify_time),
        pos: Some(stored.pos),
    }
}

/// Editable record -> Program row at 1-based `position`.
///
/// Keeps the caller's `modify_time` when present. `day_of_week` is left out
/// entirely when it does not name a concrete day.
pub fn encode_for_storage(edit: &EditRecord, position: u32) -> StoredRecord {
    StoredRecord {
        pid: edit.pid.clone(),
        status: edit.status,
        genre: edit.genre.clone(),
        quality: edit.quality.clone(),
        title: edit.title.clone(),
        synopsis: edit.synopsis.clone(),
        image_uri: edit.image_uri.clone(),
        day_of_week: edit
            .has_day_of_week()
            .then(|| edit.day_of_week.clone()),
        modify_time: edit.modify_time.unwrap_or_else(Utc::now),
        pos: position,
    }
}

/// Program row -> History row stamped with the current instant.
///
/// Both timestamps are overwritten: history reflects the moment of the
/// transition, not the last edit.
pub fn encode_for_history(record: &StoredRecord) -> HistoryRecord {
    let now = Utc::now();
    HistoryRecord {
        pid: record.pid.clone(),
        status: record.status,
        genre: record.genre.clone(),
        quality: record.quality.clone(),
        title: record.title.clone(),
        synopsis: record.synopsis.clone(),
        image_uri: record.image_uri.clone(),
        modify_time: now,
        download_time: now,
    }
}

/// Parse a raw item into one of the record shapes.
pub fn from_item<T: DeserializeOwned>(item: &Item) -> Result<T, StoreError> {
    Ok(serde_json::from_value(Value::Object(item.clone()))?)
}

/// Serialize a record into a raw item.
pub fn to_item<T: Serialize>(record: &T) -> Result<Item, StoreError> {
    match serde_json::to_value(record)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::NotAnItem(other.to_string())),
    }
}
