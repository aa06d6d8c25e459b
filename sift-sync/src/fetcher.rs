//! Content fetcher: batch-gets message bodies under a per-user slot,
//! encrypts them into staging, and fans out to the relevance stage.

use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use sift_common::accounts::AccountStore;
use sift_common::crypto::TokenCipher;
use sift_common::health::HealthHandle;
use sift_common::lockslots::UserSlots;
use sift_common::pgqueue::{NewJob, PgJob, PgJobError, PgQueue, PgQueueError};
use sift_common::retry::{slot_backoff, RetryPolicy};
use sift_common::staging::{NewStagingRow, StagingStore};
use sift_common::tasks::{FetchContentTask, RelevanceTask};

use crate::error::SyncError;
use crate::gmail::{BatchOutcome, GmailClient};
use crate::parse::{parse_message, ParsedEmail};

const PROVIDER: &str = "google";

pub struct FetcherContext {
    pub accounts: AccountStore,
    pub staging: StagingStore,
    pub cipher: TokenCipher,
    pub gmail: GmailClient,
    pub slots: UserSlots,
    pub fetch_queue: PgQueue,
    pub relevance_queue: PgQueue,
    pub max_retries: i32,
    pub post_batch_sleep: time::Duration,
}

/// How one fetch task ended.
#[derive(Debug, PartialEq, Eq)]
pub enum FetchOutcome {
    /// Bodies staged; `rescheduled` ids went back to the fetch queue.
    Completed { staged: usize, rescheduled: usize },
    /// All slots for the user were busy; a fresh task was scheduled.
    SlotBusy,
    /// The user no longer has a credential on file.
    Aborted,
}

/// Run one fetch-content task.
pub async fn process_fetch_content(
    context: &FetcherContext,
    task: FetchContentTask,
) -> Result<FetchOutcome, SyncError> {
    let trace_id = task.trace_id.as_str();
    let user_id = context.cipher.decrypt(&task.user_id_enc)?;
    let access_token = context.cipher.decrypt(&task.access_token_enc)?;

    info!(trace_id, batch = task.message_ids.len(), "starting content fetch");

    if context.accounts.get_refresh_token(&user_id).await?.is_none() {
        info!(trace_id, "no refresh token available, aborting fetch");
        return Ok(FetchOutcome::Aborted);
    }

    // One of MAX_SLOTS_PER_USER named slots gates every provider call. A busy
    // user is a rescheduling signal, not an error, and does not consume the
    // task's retry budget.
    let Some(lease) = context.slots.acquire(&user_id).await? else {
        let delay = slot_backoff(task.slot_waits + 1);
        info!(trace_id, delay_ms = delay.num_milliseconds(), "slots busy, rescheduling fetch");
        context
            .fetch_queue
            .enqueue(NewJob::with_countdown(
                context.max_retries,
                FetchContentTask {
                    slot_waits: task.slot_waits + 1,
                    ..task.clone()
                },
                delay,
            ))
            .await?;
        metrics::counter!("fetch_jobs_slot_busy").increment(1);
        return Ok(FetchOutcome::SlotBusy);
    };

    let batch = context
        .gmail
        .batch_get(&access_token, &task.message_ids, trace_id)
        .await;
    if batch.is_ok() {
        // Throttle inside the slot to stay under the provider's per-user quota.
        tokio::time::sleep(context.post_batch_sleep).await;
    }
    lease.release().await;
    let batch = batch?;

    log_and_skip(trace_id, &batch.skipped);

    let parsed = parse_batch(&batch);
    let rows = prepare_staging_rows(context, trace_id, &user_id, &parsed);

    let staged_ids = context.staging.insert_batch(&rows).await?;
    info!(trace_id, staged = staged_ids.len(), "staging insert ok");
    metrics::counter!("fetch_emails_staged").increment(staged_ids.len() as u64);

    if !staged_ids.is_empty() {
        enqueue_relevance(context, trace_id, staged_ids.clone()).await?;
    }

    let mut rescheduled = 0;
    if !batch.retry.is_empty() {
        rescheduled = schedule_partial_retry(context, &task, batch.retry).await?;
    }

    Ok(FetchOutcome::Completed {
        staged: staged_ids.len(),
        rescheduled,
    })
}

fn parse_batch(batch: &BatchOutcome) -> Vec<ParsedEmail> {
    batch
        .successful
        .iter()
        .map(|(message_id, message)| parse_message(message, message_id))
        .collect()
}

/// Encrypt sensitive fields and shape records for the staging insert.
fn prepare_staging_rows(
    context: &FetcherContext,
    trace_id: &str,
    user_id: &str,
    parsed: &[ParsedEmail],
) -> Vec<NewStagingRow> {
    parsed
        .iter()
        .map(|email| NewStagingRow {
            id: Uuid::new_v4(),
            user_id_enc: context.cipher.encrypt(user_id),
            trace_id: trace_id.to_owned(),
            provider: PROVIDER.to_owned(),
            provider_message_id: email.provider_message_id.clone(),
            subject_enc: context.cipher.encrypt(&email.subject),
            sender_enc: context.cipher.encrypt(&email.sender),
            received_at_enc: context.cipher.encrypt(&email.received_at),
            body_enc: context.cipher.encrypt(&email.body_text),
        })
        .collect()
}

fn log_and_skip(trace_id: &str, skipped: &[String]) {
    if skipped.is_empty() {
        return;
    }
    info!(trace_id, skipped = skipped.len(), sample = ?&skipped[..skipped.len().min(5)], "skipped messages");
}

async fn enqueue_relevance(
    context: &FetcherContext,
    trace_id: &str,
    row_ids: Vec<Uuid>,
) -> Result<(), SyncError> {
    info!(trace_id, rows = row_ids.len(), "enqueuing batch for relevance stage");
    context
        .relevance_queue
        .enqueue(NewJob::new(
            context.max_retries,
            RelevanceTask {
                trace_id: trace_id.to_owned(),
                row_ids,
                attempt: 1,
            },
        ))
        .await?;
    Ok(())
}

/// Re-enqueue only the rate-limited ids with exponential backoff.
async fn schedule_partial_retry(
    context: &FetcherContext,
    task: &FetchContentTask,
    retry_ids: Vec<String>,
) -> Result<usize, SyncError> {
    let trace_id = task.trace_id.as_str();

    if task.attempt >= context.max_retries {
        warn!(trace_id, dropped = retry_ids.len(), "retry budget exhausted, dropping rate-limited ids");
        metrics::counter!("fetch_emails_dropped").increment(retry_ids.len() as u64);
        return Ok(0);
    }

    let delay = slot_backoff(task.attempt as u32);
    warn!(trace_id, retrying = retry_ids.len(), delay_ms = delay.num_milliseconds(), "scheduling partial retry");
    let count = retry_ids.len();
    context
        .fetch_queue
        .enqueue(NewJob::with_countdown(
            context.max_retries,
            FetchContentTask {
                message_ids: retry_ids,
                user_id_enc: task.user_id_enc.clone(),
                access_token_enc: task.access_token_enc.clone(),
                trace_id: task.trace_id.clone(),
                attempt: task.attempt + 1,
                slot_waits: 0,
            },
            delay,
        ))
        .await?;

    Ok(count)
}

/// Poll the fetch queue and spawn a task per dequeued job.
pub struct FetchWorker {
    name: String,
    queue: PgQueue,
    context: Arc<FetcherContext>,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl FetchWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        context: Arc<FetcherContext>,
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

    async fn wait_for_job(&self) -> Result<PgJob<FetchContentTask>, PgQueueError> {
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
                process_fetch_job(context, job, retry_policy).await;
                drop(permit);
            });
        }
    }
}

async fn process_fetch_job(
    context: Arc<FetcherContext>,
    job: PgJob<FetchContentTask>,
    retry_policy: RetryPolicy,
) {
    let task = job.job.parameters.0.clone();
    let trace_id = task.trace_id.clone();
    let attempt = job.job.attempt;

    metrics::counter!("fetch_jobs_total").increment(1);

    match process_fetch_content(&context, task).await {
        Ok(outcome) => {
            if let Err(error) = job.complete().await {
                error!(%trace_id, "failed to mark fetch job completed: {}", error);
                return;
            }
            if let FetchOutcome::Completed { staged, rescheduled } = outcome {
                info!(%trace_id, staged, rescheduled, "fetch job completed");
            }
            metrics::counter!("fetch_jobs_completed").increment(1);
        }
        Err(error) => {
            error!(%trace_id, "content fetch failed: {}", error);
            let interval = retry_policy.retry_interval(attempt as u32);
            match job.retry(&error.to_string(), interval).await {
                Ok(()) => {
                    metrics::counter!("fetch_jobs_retried").increment(1);
                }
                Err(PgJobError::RetryInvalidError { job, .. }) => {
                    error!(%trace_id, "content fetch exhausted retries");
                    metrics::counter!("fetch_jobs_failed").increment(1);
                    if let Err(error) = job.fail(&error.to_string()).await {
                        error!(%trace_id, "failed to mark fetch job failed: {}", error);
                    }
                }
                Err(error) => {
                    error!(%trace_id, "failed to reschedule fetch job: {}", error);
                }
            }
        }
    }
}
