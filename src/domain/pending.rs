use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A locally applied mutation waiting for the sync authority to replay it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingMutation {
    /// Per-client sequence number, strictly increasing in call order.
    pub id: u64,
    pub name: String,
    pub args: serde_json::Value,
    /// Captured at call time so every replay sees the same clock.
    pub created_at: DateTime<Utc>,
}
