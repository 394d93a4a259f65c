//! Saga instance envelope.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Every saga starts here.
pub const INITIAL_STATE: &str = "Initial";

/// State an instance lands in when an action fails and its compensations
/// have been unwound.
pub const FAILED_STATE: &str = "Failed";

/// A persistent saga: orchestration bookkeeping plus the domain fields
/// `S` the host defines. `version` is a monotonic counter used for
/// optimistic concurrency; only the repository advances it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SagaInstance<S> {
    pub correlation_id: String,
    pub saga_type: String,
    pub current_state: String,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_completed: bool,
    pub data: S,
}

impl<S: Default> SagaInstance<S> {
    pub fn new(saga_type: &str, correlation_id: &str, now: DateTime<Utc>) -> Self {
        Self {
            correlation_id: correlation_id.to_string(),
            saga_type: saga_type.to_string(),
            current_state: INITIAL_STATE.to_string(),
            version: 0,
            created_at: now,
            updated_at: now,
            is_completed: false,
            data: S::default(),
        }
    }
}
