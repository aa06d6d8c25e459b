//! Typed task envelopes and the row/stage vocabulary shared by every worker.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug, PartialEq, Eq)]
#[error("{0} is not a valid {1}")]
pub struct ParseEnumError(pub String, pub &'static str);

/// The stages of the pipeline, each bound to one queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskKind {
    InitialSync,
    FetchContent,
    Relevance,
    Classification,
    Ner,
    Transfer,
}

impl TaskKind {
    /// The queue this kind of task is consumed from.
    pub fn queue_name(&self) -> &'static str {
        match self {
            TaskKind::InitialSync => "gmail_initial_sync_queue",
            TaskKind::FetchContent => "gmail_fetch_content_queue",
            TaskKind::Relevance => "relevance_model_queue",
            TaskKind::Classification => "classification_model_queue",
            TaskKind::Ner => "ner_model_queue",
            TaskKind::Transfer => "staging_to_job_apps_queue",
        }
    }
}

/// Lifecycle state of a staging row. Stored as text in
/// `internal_staging.email_staging.status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EmailStatus {
    AwaitRelevance,
    AwaitClassification,
    AwaitTransfer,
    Retry,
    Purge,
    FailedPermanently,
}

impl EmailStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EmailStatus::AwaitRelevance => "AWAIT_RELEVANCE",
            EmailStatus::AwaitClassification => "AWAIT_CLASSIFICATION",
            EmailStatus::AwaitTransfer => "AWAIT_TRANSFER",
            EmailStatus::Retry => "RETRY",
            EmailStatus::Purge => "PURGE",
            EmailStatus::FailedPermanently => "FAILED_PERMANENTLY",
        }
    }
}

impl fmt::Display for EmailStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EmailStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "AWAIT_RELEVANCE" => Ok(EmailStatus::AwaitRelevance),
            "AWAIT_CLASSIFICATION" => Ok(EmailStatus::AwaitClassification),
            "AWAIT_TRANSFER" => Ok(EmailStatus::AwaitTransfer),
            "RETRY" => Ok(EmailStatus::Retry),
            "PURGE" => Ok(EmailStatus::Purge),
            "FAILED_PERMANENTLY" => Ok(EmailStatus::FailedPermanently),
            invalid => Err(ParseEnumError(invalid.to_owned(), "EmailStatus")),
        }
    }
}

/// The application-stage taxonomy the classifier maps emails into.
///
/// `as_str` is the value stored in `app_stage` columns; `key` is the
/// lowercase label used when talking to the zero-shot model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplicationStage {
    Applied,
    Interview,
    Offer,
    Accepted,
    Rejected,
}

pub const ALL_STAGES: [ApplicationStage; 5] = [
    ApplicationStage::Applied,
    ApplicationStage::Interview,
    ApplicationStage::Offer,
    ApplicationStage::Accepted,
    ApplicationStage::Rejected,
];

impl ApplicationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStage::Applied => "Applied",
            ApplicationStage::Interview => "Interview",
            ApplicationStage::Offer => "Offer",
            ApplicationStage::Accepted => "Accepted",
            ApplicationStage::Rejected => "Rejected",
        }
    }

    pub fn key(&self) -> &'static str {
        match self {
            ApplicationStage::Applied => "applied",
            ApplicationStage::Interview => "interview",
            ApplicationStage::Offer => "offer",
            ApplicationStage::Accepted => "accepted",
            ApplicationStage::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApplicationStage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApplicationStage {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "applied" => Ok(ApplicationStage::Applied),
            "interview" => Ok(ApplicationStage::Interview),
            "offer" => Ok(ApplicationStage::Offer),
            "accepted" => Ok(ApplicationStage::Accepted),
            "rejected" => Ok(ApplicationStage::Rejected),
            invalid => Err(ParseEnumError(invalid.to_owned(), "ApplicationStage")),
        }
    }
}

fn default_attempt() -> i32 {
    1
}

/// Kick off a sync for one user: list candidate message ids over the window
/// starting at `start_date` and fan out fetch tasks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct InitialSyncTask {
    pub user_id: String,
    pub trace_id: String,
    pub start_date: DateTime<Utc>,
}

/// Fetch the bodies of a batch of messages. The user id and access token
/// travel as ciphertext only.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FetchContentTask {
    pub message_ids: Vec<String>,
    pub user_id_enc: String,
    pub access_token_enc: String,
    pub trace_id: String,
    #[serde(default = "default_attempt")]
    pub attempt: i32,
    /// How many times this task has rescheduled itself waiting for a user
    /// slot. Separate from `attempt`: waiting is not a failure.
    #[serde(default)]
    pub slot_waits: u32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RelevanceTask {
    pub trace_id: String,
    pub row_ids: Vec<Uuid>,
    #[serde(default = "default_attempt")]
    pub attempt: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ClassificationTask {
    pub trace_id: String,
    pub row_ids: Vec<Uuid>,
    #[serde(default = "default_attempt")]
    pub attempt: i32,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct NerTask {
    pub trace_id: String,
    pub row_ids: Vec<Uuid>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct TransferTask {
    pub trace_id: String,
    pub row_ids: Vec<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_names() {
        assert_eq!(TaskKind::InitialSync.queue_name(), "gmail_initial_sync_queue");
        assert_eq!(TaskKind::FetchContent.queue_name(), "gmail_fetch_content_queue");
        assert_eq!(TaskKind::Relevance.queue_name(), "relevance_model_queue");
        assert_eq!(TaskKind::Classification.queue_name(), "classification_model_queue");
        assert_eq!(TaskKind::Ner.queue_name(), "ner_model_queue");
        assert_eq!(TaskKind::Transfer.queue_name(), "staging_to_job_apps_queue");
    }

    #[test]
    fn test_email_status_round_trips() {
        for status in [
            EmailStatus::AwaitRelevance,
            EmailStatus::AwaitClassification,
            EmailStatus::AwaitTransfer,
            EmailStatus::Retry,
            EmailStatus::Purge,
            EmailStatus::FailedPermanently,
        ] {
            assert_eq!(EmailStatus::from_str(status.as_str()).unwrap(), status);
        }
        assert!(EmailStatus::from_str("DELETED").is_err());
    }

    #[test]
    fn test_stage_storage_and_model_keys() {
        assert_eq!(ApplicationStage::Applied.as_str(), "Applied");
        assert_eq!(ApplicationStage::Applied.key(), "applied");
        assert_eq!(
            ApplicationStage::from_str("Rejected").unwrap(),
            ApplicationStage::Rejected
        );
        assert_eq!(
            ApplicationStage::from_str("offer").unwrap(),
            ApplicationStage::Offer
        );
    }

    #[test]
    fn test_fetch_task_defaults_on_deserialize() {
        // Envelopes written before the slot_waits field existed must still parse.
        let raw = r#"{
            "message_ids": ["m-1", "m-2"],
            "user_id_enc": "gAAAAAB-user",
            "access_token_enc": "gAAAAAB-token",
            "trace_id": "trace-1"
        }"#;
        let task: FetchContentTask = serde_json::from_str(raw).unwrap();
        assert_eq!(task.attempt, 1);
        assert_eq!(task.slot_waits, 0);
    }

    #[test]
    fn test_relevance_task_round_trip() {
        let task = RelevanceTask {
            trace_id: "trace-2".to_owned(),
            row_ids: vec![Uuid::new_v4(), Uuid::new_v4()],
            attempt: 2,
        };
        let encoded = serde_json::to_string(&task).unwrap();
        let decoded: RelevanceTask = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, task);
    }
}
