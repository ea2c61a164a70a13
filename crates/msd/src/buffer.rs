// TEAM_520: Client buffer identity.
//
// The driver core never touches buffer memory directly; pages are pinned
// through the platform BusMapper by buffer id. A buffer just carries that
// id and its size so mappings can be range-checked.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mali_hal::PAGE_SIZE;

#[derive(Debug)]
pub struct Buffer {
    id: u64,
    page_count: u64,
}

impl Buffer {
    pub fn new(page_count: u64) -> Arc<Self> {
        static NEXT_ID: AtomicU64 = AtomicU64::new(1);
        Arc::new(Self {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            page_count,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn page_count(&self) -> u64 {
        self.page_count
    }

    pub fn size(&self) -> u64 {
        self.page_count * PAGE_SIZE
    }
}
