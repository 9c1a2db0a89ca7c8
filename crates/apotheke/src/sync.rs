use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::event::ChangeRecord;
use crate::{StoreError, StoreResult};

/// The handler id the periodic drain looks up. A deployment registers its
/// push-to-server collaborator under this id; other ids are only reachable
/// through [`ContentStore::notify_sync_to_server`](crate::ContentStore::notify_sync_to_server).
pub const PERIODIC_SYNC_ID: &str = "periodic";

/// A named remote-side collaborator that pushes one recorded change to the
/// server. Returning `false` leaves the change queued for retry.
#[async_trait]
pub trait RemoteSync: Send + Sync {
    async fn sync_to_server(&self, change: &ChangeRecord) -> bool;
}

pub(crate) struct SyncRegistry {
    entries: Mutex<HashMap<String, Arc<dyn RemoteSync>>>,
}

impl SyncRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(
        &self,
        id: &str,
        handler: Arc<dyn RemoteSync>,
        overlap: bool,
    ) -> StoreResult<()> {
        let mut entries = self.entries.lock().expect("sync registry poisoned");
        if entries.contains_key(id) && !overlap {
            return Err(StoreError::conflict(format!("duplicate sync id {id:?}")));
        }
        entries.insert(id.to_string(), handler);
        Ok(())
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<dyn RemoteSync>> {
        self.entries
            .lock()
            .expect("sync registry poisoned")
            .get(id)
            .cloned()
    }
}
