use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::{StoreError, StoreResult};

/// A named UI-side collaborator. Its only capability is refreshing its
/// presentation of the data after a change.
#[async_trait]
pub trait Observer: Send + Sync {
    async fn refresh_view(&self) -> bool;
}

pub(crate) struct ObserverRegistry {
    entries: Mutex<HashMap<String, Arc<dyn Observer>>>,
}

impl ObserverRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub(crate) fn register(
        &self,
        id: &str,
        observer: Arc<dyn Observer>,
        overlap: bool,
    ) -> StoreResult<()> {
        let mut entries = self.entries.lock().expect("observer registry poisoned");
        if entries.contains_key(id) && !overlap {
            return Err(StoreError::conflict(format!("duplicate observer id {id:?}")));
        }
        entries.insert(id.to_string(), observer);
        Ok(())
    }

    pub(crate) fn get(&self, id: &str) -> Option<Arc<dyn Observer>> {
        self.entries
            .lock()
            .expect("observer registry poisoned")
            .get(id)
            .cloned()
    }
}
