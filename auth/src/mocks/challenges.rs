//! Mock challenge store with atomic consumption.

use crate::error::Result;
use crate::providers::challenge_store::{ChallengeRecord, ChallengeStore};
use crate::state::ChallengeId;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// In-memory [`ChallengeStore`]. One mutex serializes consumption, so the
/// first-consumer-wins property holds under concurrency.
#[derive(Debug, Clone, Default)]
pub struct MockChallengeStore {
    records: Arc<Mutex<HashMap<ChallengeId, ChallengeRecord>>>,
}

impl MockChallengeStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Count of stored (unconsumed) challenges. Test helper.
    #[must_use]
    pub fn challenge_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ChallengeId, ChallengeRecord>> {
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl ChallengeStore for MockChallengeStore {
    async fn put(&self, record: &ChallengeRecord, _ttl: Duration) -> Result<()> {
        self.lock().insert(record.challenge_id, record.clone());
        Ok(())
    }

    async fn load(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRecord>> {
        Ok(self.lock().get(&challenge_id).cloned())
    }

    async fn consume(&self, challenge_id: ChallengeId) -> Result<Option<ChallengeRecord>> {
        // Remove-under-lock: exactly one concurrent consumer wins.
        Ok(self.lock().remove(&challenge_id))
    }

    async fn record_attempt(&self, challenge_id: ChallengeId) -> Result<Option<u32>> {
        let mut records = self.lock();
        match records.get_mut(&challenge_id) {
            Some(record) => {
                record.attempts += 1;
                Ok(Some(record.attempts))
            }
            None => Ok(None),
        }
    }
}
