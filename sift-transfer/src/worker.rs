//! Transfer stage: move classified staging rows into the canonical
//! application table and mark them purged.

use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use sift_common::applications::{ApplicationInsert, ApplicationStore};
use sift_common::crypto::TokenCipher;
use sift_common::health::HealthHandle;
use sift_common::pgqueue::{PgJob, PgJobError, PgQueue, PgQueueError};
use sift_common::retry::RetryPolicy;
use sift_common::staging::{parse_received_at, StagingRow, StagingStore};
use sift_common::tasks::{EmailStatus, TransferTask};

use crate::error::TransferError;

pub struct TransferContext {
    pub staging: StagingStore,
    pub applications: ApplicationStore,
    pub cipher: TokenCipher,
}

#[derive(Debug, PartialEq, Eq)]
pub struct TransferOutcome {
    pub inserted: u64,
    pub purged: u64,
}

/// The conditional transition applied once the broker has exhausted a
/// batch's attempts: rows still awaiting transfer become terminal, rows an
/// earlier delivery already purged are left alone.
pub fn exhausted_transition() -> (&'static [EmailStatus], EmailStatus) {
    (&[EmailStatus::AwaitTransfer], EmailStatus::FailedPermanently)
}

/// Shape one staging row for the application table. `None` when the user id
/// cannot be decrypted; such rows are left in place for investigation.
pub fn build_application_insert(cipher: &TokenCipher, row: &StagingRow) -> Option<ApplicationInsert> {
    let user_uid = cipher.decrypt(&row.user_id_enc).ok()?;
    let received_at = cipher
        .decrypt(&row.received_at_enc)
        .ok()
        .and_then(|plaintext| parse_received_at(&plaintext));

    Some(ApplicationInsert {
        user_uid,
        provider_source: row.provider.clone(),
        provider_message_id: row.provider_message_id.clone(),
        app_stage: row.app_stage.clone(),
        stage_confidence: row.confidence_score,
        app_stage_secondary: row.app_stage_secondary.clone(),
        stage_confidence_secondary: row.confidence_score_secondary,
        needs_review: row.needs_review.unwrap_or(false),
        received_at,
    })
}

/// Run one transfer task.
pub async fn process_transfer(
    context: &TransferContext,
    task: TransferTask,
) -> Result<TransferOutcome, TransferError> {
    let trace_id = task.trace_id.as_str();
    info!(trace_id, rows = task.row_ids.len(), "starting transfer task");

    let rows = context.staging.fetch_rows(&task.row_ids).await?;
    if rows.is_empty() {
        info!(trace_id, "no staging rows found, nothing to transfer");
        return Ok(TransferOutcome {
            inserted: 0,
            purged: 0,
        });
    }

    let mut inserts = Vec::with_capacity(rows.len());
    let mut transferable: Vec<Uuid> = Vec::with_capacity(rows.len());
    for row in &rows {
        match build_application_insert(&context.cipher, row) {
            Some(insert) => {
                inserts.push(insert);
                transferable.push(row.id);
            }
            None => {
                warn!(trace_id, row_id = %row.id, "could not decrypt staging row, leaving in place");
            }
        }
    }

    let inserted = context.applications.insert_batch(&inserts).await?;
    metrics::counter!("transfer_rows_inserted").increment(inserted);

    let purged = context
        .staging
        .update_status(&transferable, &[EmailStatus::AwaitTransfer], EmailStatus::Purge)
        .await?;

    info!(trace_id, inserted, purged, "transfer task completed");
    Ok(TransferOutcome { inserted, purged })
}

/// Poll the transfer queue and spawn a task per dequeued job.
pub struct TransferWorker {
    name: String,
    queue: PgQueue,
    context: Arc<TransferContext>,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl TransferWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        context: Arc<TransferContext>,
        poll_interval: time::Duration,
        max_concurrent_jobs: usize,
        retry_policy: RetryPolicy,
        liveness: HealthHandle,
    ) -> Self {
        Self {
            name: name.to_owned(),
            queue,
            context,
            poll_interval,
            max_concurrent_jobs,
            retry_policy,
            liveness,
        }
    }

    async fn wait_for_job(&self) -> Result<PgJob<TransferTask>, PgQueueError> {
        let mut interval = tokio::time::interval(self.poll_interval);

        loop {
            interval.tick().await;
            self.liveness.report_healthy();

            if let Some(job) = self.queue.dequeue(&self.name).await? {
                return Ok(job);
            }
        }
    }

    pub async fn run(&self) -> Result<(), PgQueueError> {
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent_jobs));

        loop {
            let job = self.wait_for_job().await?;
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .expect("semaphore has been closed");
            let context = self.context.clone();
            let retry_policy = self.retry_policy;

            tokio::spawn(async move {
                process_transfer_job(context, job, retry_policy).await;
                drop(permit);
            });
        }
    }
}

async fn process_transfer_job(
    context: Arc<TransferContext>,
    job: PgJob<TransferTask>,
    retry_policy: RetryPolicy,
) {
    let task = job.job.parameters.0.clone();
    let trace_id = task.trace_id.clone();
    let row_ids = task.row_ids.clone();
    let attempt = job.job.attempt;

    metrics::counter!("transfer_jobs_total").increment(1);

    match process_transfer(&context, task).await {
        Ok(_) => {
            if let Err(error) = job.complete().await {
                error!(%trace_id, "failed to mark transfer job completed: {}", error);
                return;
            }
            metrics::counter!("transfer_jobs_completed").increment(1);
        }
        Err(error) => {
            error!(%trace_id, "transfer task failed: {}", error);
            let interval = retry_policy.retry_interval(attempt as u32);
            match job.retry(&error.to_string(), interval).await {
                Ok(()) => {
                    metrics::counter!("transfer_jobs_retried").increment(1);
                }
                Err(PgJobError::RetryInvalidError { job, .. }) => {
                    // Out of attempts: rows that never made it across go
                    // terminal rather than sitting in AWAIT_TRANSFER.
                    let (expected, to) = exhausted_transition();
                    match context.staging.update_status(&row_ids, expected, to).await {
                        Ok(marked) => {
                            error!(%trace_id, marked, "transfer exhausted retries, staging rows failed permanently");
                            metrics::counter!("transfer_rows_failed_permanently").increment(marked);
                        }
                        Err(error) => {
                            error!(%trace_id, "failed to mark staging rows failed permanently: {}", error);
                        }
                    }
                    metrics::counter!("transfer_jobs_failed").increment(1);
                    if let Err(error) = job.fail(&error.to_string()).await {
                        error!(%trace_id, "failed to mark transfer job failed: {}", error);
                    }
                }
                Err(error) => {
                    error!(%trace_id, "failed to reschedule transfer job: {}", error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fernet::Fernet;

    fn cipher() -> TokenCipher {
        TokenCipher::from_keys(&Fernet::generate_key()).unwrap()
    }

    fn staging_row(cipher: &TokenCipher) -> StagingRow {
        StagingRow {
            id: Uuid::new_v4(),
            user_id_enc: cipher.encrypt("user-42"),
            trace_id: "trace-1".to_owned(),
            provider: "google".to_owned(),
            provider_message_id: "m-1".to_owned(),
            subject_enc: cipher.encrypt("Application received"),
            sender_enc: cipher.encrypt("jobs@initech.example"),
            received_at_enc: cipher.encrypt("1706745600000"),
            body_enc: cipher.encrypt("We received your application."),
            status: "AWAIT_TRANSFER".to_owned(),
            app_stage: Some("Applied".to_owned()),
            app_stage_secondary: Some("Interview".to_owned()),
            confidence_score: Some(91),
            confidence_score_secondary: Some(4),
            needs_review: Some(false),
        }
    }

    #[test]
    fn test_build_application_insert() {
        let cipher = cipher();
        let row = staging_row(&cipher);

        let insert = build_application_insert(&cipher, &row).unwrap();
        assert_eq!(insert.user_uid, "user-42");
        assert_eq!(insert.provider_source, "google");
        assert_eq!(insert.provider_message_id, "m-1");
        assert_eq!(insert.app_stage.as_deref(), Some("Applied"));
        assert_eq!(insert.stage_confidence, Some(91));
        assert_eq!(insert.app_stage_secondary.as_deref(), Some("Interview"));
        assert_eq!(insert.stage_confidence_secondary, Some(4));
        assert!(!insert.needs_review);
        assert_eq!(insert.received_at.unwrap().timestamp(), 1706745600);
    }

    #[test]
    fn test_build_application_insert_bad_user_cipher() {
        let cipher = cipher();
        let mut row = staging_row(&cipher);
        row.user_id_enc = "garbage".to_owned();

        assert!(build_application_insert(&cipher, &row).is_none());
    }

    #[test]
    fn test_exhausted_batch_marks_rows_terminal() {
        // Transfer carries no stage-level attempt counter, so the broker's
        // exhaustion branch is the only path to the terminal status.
        let (expected, to) = exhausted_transition();
        assert_eq!(expected, [EmailStatus::AwaitTransfer]);
        assert_eq!(to, EmailStatus::FailedPermanently);
    }

    #[test]
    fn test_build_application_insert_bad_received_at() {
        let cipher = cipher();
        let mut row = staging_row(&cipher);
        row.received_at_enc = cipher.encrypt("not-a-timestamp");

        let insert = build_application_insert(&cipher, &row).unwrap();
        assert!(insert.received_at.is_none());
    }
}
