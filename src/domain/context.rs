use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;

/// A piece of durable mission context: worker discoveries, stale-unit
/// descriptions fed back to the planner, operator notes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub id: String,
    pub mission_id: String,
    pub kind: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl ContextItem {
    pub fn new(
        mission_id: impl Into<String>,
        kind: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            mission_id: mission_id.into(),
            kind: kind.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}

/// Per-epoch summary handed back to the planner as feedback.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reflection {
    pub id: String,
    pub mission_id: String,
    pub epoch_id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl Reflection {
    pub fn new(
        mission_id: impl Into<String>,
        epoch_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: new_id(),
            mission_id: mission_id.into(),
            epoch_id: epoch_id.into(),
            content: content.into(),
            created_at: Utc::now(),
        }
    }
}
