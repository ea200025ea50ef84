use crate::error::StoreError;
use crate::store::{Item, TableStore};

/// Read every item of `table`, following continuation keys until the store
/// stops handing them out.
///
/// Items come back in arrival order. A failing page aborts the whole scan and
/// whatever was collected so far is discarded.
pub async fn scan_all<S: TableStore>(store: &mut S, table: &str) -> Result<Vec<Item>, StoreError> {
    let mut items = Vec::new();
    let mut start_key = None;
    let mut pages = 0usize;

    loop {
        let page = store.scan(table, start_key.take()).await?;
        pages += 1;
        log::debug!("scan {} page {}: {} items", table, pages, page.items.len());

        items.extend(page.items);
        match page.last_evaluated_key {
            Some(key) => start_key = Some(key),
            None => break,
        }
    }

    Ok(items)
}
