use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionState {
    Started,
    Finished,
    Failed,
}

impl ActionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::Finished => "finished",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "started" => Some(Self::Started),
            "finished" => Some(Self::Finished),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// The only transitions are `started -> finished` and `started -> failed`.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Started, Self::Finished) | (Self::Started, Self::Failed)
        )
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReindexActionRow {
    pub id: i64,
    pub index_identifier: String,
    pub state: ActionState,
    pub action_start: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action_end: Option<DateTime<Utc>>,
    pub ondisk_size_bytes_start: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ondisk_size_bytes_end: Option<u64>,
    pub bloat_estimate_bytes_start: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Clone, Debug)]
pub struct NewReindexAction {
    pub index_identifier: String,
    pub action_start: DateTime<Utc>,
    pub ondisk_size_bytes_start: u64,
    pub bloat_estimate_bytes_start: u64,
}

#[derive(Clone, Debug)]
pub struct CloseReindexAction {
    pub id: i64,
    pub state: ActionState,
    pub action_end: DateTime<Utc>,
    pub ondisk_size_bytes_end: Option<u64>,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueState {
    Queued,
    Done,
    Failed,
}

impl QueueState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "queued" => Some(Self::Queued),
            "done" => Some(Self::Done),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct QueuedActionRow {
    pub id: i64,
    pub index_identifier: String,
    pub state: QueueState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
