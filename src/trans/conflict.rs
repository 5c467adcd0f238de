//! Admission table: at most one live transaction per resource name

use crate::common::{Error, Result};
use crate::trans::record::TransId;
use std::collections::HashMap;
use std::sync::Mutex;

pub trait AdmissionTable: Send + Sync {
    /// Take every resource in `resources` for `trans_id`, or none of them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Conflict`] naming the first resource held by another
    /// transaction. Re-acquiring resources already held by `trans_id` succeeds.
    fn try_acquire(&self, trans_id: TransId, resources: &[String]) -> Result<()>;

    /// Release everything held by `trans_id`
    fn release(&self, trans_id: TransId);

    /// Current holder of `resource`
    fn holder(&self, resource: &str) -> Option<TransId>;
}

/// In-memory admission table
#[derive(Debug, Default)]
pub struct ConflictTable {
    held: Mutex<HashMap<String, TransId>>,
}

impl ConflictTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.held.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AdmissionTable for ConflictTable {
    fn try_acquire(&self, trans_id: TransId, resources: &[String]) -> Result<()> {
        let mut held = self.held.lock()?;
        for resource in resources {
            if let Some(&holder) = held.get(resource) {
                if holder != trans_id {
                    return Err(Error::Conflict {
                        resource: resource.clone(),
                        holder,
                    });
                }
            }
        }
        for resource in resources {
            held.insert(resource.clone(), trans_id);
        }
        Ok(())
    }

    fn release(&self, trans_id: TransId) {
        match self.held.lock() {
            Ok(mut held) => held.retain(|_, holder| *holder != trans_id),
            Err(e) => tracing::error!(trans_id = trans_id, "conflict table poisoned: {}", e),
        }
    }

    fn holder(&self, resource: &str) -> Option<TransId> {
        self.held.lock().ok()?.get(resource).copied()
    }
}
