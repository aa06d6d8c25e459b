//! Ingest dispatcher: resolves credentials, lists candidate message ids for
//! the sync window, and fans out fetch tasks.

use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;
use tracing::{error, info};

use sift_common::accounts::AccountStore;
use sift_common::crypto::TokenCipher;
use sift_common::health::HealthHandle;
use sift_common::pgqueue::{NewJob, PgJob, PgJobError, PgQueue, PgQueueError};
use sift_common::retry::RetryPolicy;
use sift_common::tasks::{FetchContentTask, InitialSyncTask};

use crate::error::SyncError;
use crate::gmail::{chunk_ids, GmailClient};

pub struct DispatcherContext {
    pub accounts: AccountStore,
    pub cipher: TokenCipher,
    pub gmail: GmailClient,
    pub fetch_queue: PgQueue,
    pub emails_per_batch: usize,
    pub max_retries: i32,
}

/// Run one initial-sync task to completion.
pub async fn process_initial_sync(
    context: &DispatcherContext,
    task: InitialSyncTask,
) -> Result<(), SyncError> {
    let trace_id = task.trace_id.as_str();
    info!(trace_id, "starting initial sync dispatch");

    let Some(refresh_token_enc) = context.accounts.get_refresh_token(&task.user_id).await? else {
        // No credential on file: the user revoked access, stop quietly.
        info!(trace_id, "no refresh token available, aborting sync");
        return Ok(());
    };

    let refresh_token = context.cipher.decrypt(&refresh_token_enc)?;
    let access_token = context.gmail.exchange_refresh_token(&refresh_token).await?;

    let message_ids = context
        .gmail
        .list_message_ids(&access_token, task.start_date.timestamp(), trace_id)
        .await?;

    let user_id_enc = context.cipher.encrypt(&task.user_id);
    let access_token_enc = context.cipher.encrypt(&access_token);

    let batches = chunk_ids(&message_ids, context.emails_per_batch);
    for batch in &batches {
        info!(trace_id, batch_size = batch.len(), "enqueuing content fetch task");
        context
            .fetch_queue
            .enqueue(NewJob::new(
                context.max_retries,
                FetchContentTask {
                    message_ids: batch.clone(),
                    user_id_enc: user_id_enc.clone(),
                    access_token_enc: access_token_enc.clone(),
                    trace_id: task.trace_id.clone(),
                    attempt: 1,
                    slot_waits: 0,
                },
            ))
            .await?;
    }

    info!(trace_id, batches = batches.len(), "completed enqueuing fetch tasks");
    Ok(())
}

/// Poll the initial-sync queue and spawn a task per dequeued job.
pub struct DispatchWorker {
    name: String,
    queue: PgQueue,
    context: Arc<DispatcherContext>,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl DispatchWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        context: Arc<DispatcherContext>,
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

    async fn wait_for_job(&self) -> Result<PgJob<InitialSyncTask>, PgQueueError> {
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
                process_dispatch_job(context, job, retry_policy).await;
                drop(permit);
            });
        }
    }
}

async fn process_dispatch_job(
    context: Arc<DispatcherContext>,
    job: PgJob<InitialSyncTask>,
    retry_policy: RetryPolicy,
) {
    let task = job.job.parameters.0.clone();
    let trace_id = task.trace_id.clone();
    let attempt = job.job.attempt;

    metrics::counter!("dispatch_jobs_total").increment(1);

    match process_initial_sync(&context, task).await {
        Ok(()) => {
            if let Err(error) = job.complete().await {
                error!(%trace_id, "failed to mark dispatch job completed: {}", error);
                return;
            }
            metrics::counter!("dispatch_jobs_completed").increment(1);
        }
        Err(error) => {
            error!(%trace_id, "initial sync failed: {}", error);
            let interval = retry_policy.retry_interval(attempt as u32);
            match job.retry(&error.to_string(), interval).await {
                Ok(()) => {
                    metrics::counter!("dispatch_jobs_retried").increment(1);
                }
                Err(PgJobError::RetryInvalidError { job, .. }) => {
                    // Out of attempts: the user stays un-synced.
                    error!(%trace_id, "initial sync exhausted retries, user left un-synced");
                    metrics::counter!("dispatch_jobs_failed").increment(1);
                    if let Err(error) = job.fail(&error.to_string()).await {
                        error!(%trace_id, "failed to mark dispatch job failed: {}", error);
                    }
                }
                Err(error) => {
                    error!(%trace_id, "failed to reschedule dispatch job: {}", error);
                }
            }
        }
    }
}
