use crate::errors::DarwinResult;
use crate::store::MigrationStore;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tells whether the patch and statement tables exist.
///
/// Tables are never dropped once created, so a positive answer is cached for
/// the life of the detector; a negative one is asked again every time.
#[derive(Clone)]
pub struct BookkeepingDetector {
    store: Arc<dyn MigrationStore>,
    present: Arc<AtomicBool>,
}

impl BookkeepingDetector {
    pub fn new(store: Arc<dyn MigrationStore>) -> BookkeepingDetector {
        BookkeepingDetector {
            store,
            present: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn exists(&self) -> DarwinResult<bool> {
        if self.present.load(Ordering::Acquire) {
            return Ok(true);
        }

        let found = self.store.bookkeeping_tables_exist()?;
        if found {
            log::debug!("Patch bookkeeping tables found");
            self.present.store(true, Ordering::Release);
        }
        Ok(found)
    }
}
