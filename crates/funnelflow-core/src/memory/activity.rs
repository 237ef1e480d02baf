use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use funnelflow_types::contact::ActivityEntry;
use funnelflow_types::error::RepositoryError;

use crate::repository::activity::ActivityLog;

/// `ActivityLog` that keeps entries in a vector.
#[derive(Debug, Default)]
pub struct InMemoryActivityLog {
    entries: Mutex<Vec<ActivityEntry>>,
    failing: AtomicBool,
}

impl InMemoryActivityLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent appends fail (to exercise fire-and-forget handling).
    pub fn fail_appends(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn entries(&self) -> Vec<ActivityEntry> {
        self.entries
            .lock()
            .map(|e| e.clone())
            .unwrap_or_default()
    }

    fn append_now(&self, entry: &ActivityEntry) -> Result<(), RepositoryError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(RepositoryError::Connection);
        }
        self.entries
            .lock()
            .map_err(|_| RepositoryError::Query("activity log poisoned".to_string()))?
            .push(entry.clone());
        Ok(())
    }
}

impl ActivityLog for InMemoryActivityLog {
    fn append<'a>(
        &'a self,
        entry: &'a ActivityEntry,
    ) -> Pin<Box<dyn Future<Output = Result<(), RepositoryError>> + Send + 'a>> {
        Box::pin(ready(self.append_now(entry)))
    }
}
