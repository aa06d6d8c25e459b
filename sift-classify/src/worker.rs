//! Classification stage: zero-shot stage prediction with a heuristic
//! overlay, written back onto staging rows ahead of transfer.

use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use sift_common::crypto::TokenCipher;
use sift_common::health::HealthHandle;
use sift_common::inference::StageClassifier;
use sift_common::pgqueue::{NewJob, PgJob, PgJobError, PgQueue, PgQueueError};
use sift_common::retry::{stage_retry_countdown, RetryPolicy};
use sift_common::staging::{ClassificationUpdate, StagingStore};
use sift_common::tasks::{ClassificationTask, EmailStatus, TransferTask};

use crate::error::ClassificationError;
use crate::heuristics::{heuristic_stage, resolve_prediction};
use crate::normalize::{compose_model_input, normalize_field};

pub struct ClassificationContext {
    pub staging: StagingStore,
    pub cipher: TokenCipher,
    pub classifier: Arc<dyn StageClassifier>,
    pub classification_queue: PgQueue,
    pub transfer_queue: PgQueue,
    pub confidence_threshold: f32,
    pub model_batch_size: usize,
    pub max_retries: i32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClassificationOutcome {
    Completed { classified: usize, retry: usize },
    Exhausted,
}

struct NormalizedEmail {
    id: Uuid,
    text: String,
}

/// Convert a model score to the integer percent stored in the tables.
pub fn confidence_percent(score: f32) -> i32 {
    (score.clamp(0.0, 1.0) * 100.0).round() as i32
}

/// Run one classification task.
pub async fn process_classification(
    context: &ClassificationContext,
    task: ClassificationTask,
) -> Result<ClassificationOutcome, ClassificationError> {
    let trace_id = task.trace_id.as_str();
    info!(trace_id, attempt = task.attempt, rows = task.row_ids.len(), "starting classification task");

    if task.attempt > context.max_retries {
        error!(trace_id, "exceeded maximum retries for classification task");
        context.staging.mark_failed_permanently(&task.row_ids).await?;
        metrics::counter!("classification_rows_failed_permanently")
            .increment(task.row_ids.len() as u64);
        return Ok(ClassificationOutcome::Exhausted);
    }

    let rows = context.staging.fetch_model_inputs(&task.row_ids).await?;

    let mut emails: Vec<NormalizedEmail> = Vec::with_capacity(rows.len());
    for row in &rows {
        let decrypted = (|| {
            let subject = context.cipher.decrypt(&row.subject_enc)?;
            let sender = context.cipher.decrypt(&row.sender_enc)?;
            let body = context.cipher.decrypt(&row.body_enc)?;
            Ok::<_, sift_common::crypto::CryptoError>((subject, sender, body))
        })();

        match decrypted {
            Ok((subject, sender, body)) => {
                let text = compose_model_input(
                    &normalize_field(&subject),
                    &normalize_field(&sender),
                    &normalize_field(&body),
                );
                emails.push(NormalizedEmail { id: row.id, text });
            }
            Err(error) => {
                warn!(trace_id, row_id = %row.id, "failed to decrypt email, omitting row: {}", error);
            }
        }
    }

    let mut updates: Vec<ClassificationUpdate> = Vec::new();
    let mut retry_ids: Vec<Uuid> = Vec::new();

    for chunk in emails.chunks(context.model_batch_size.max(1)) {
        let texts: Vec<String> = chunk.iter().map(|e| e.text.clone()).collect();

        match context.classifier.classify(&texts).await {
            Ok(predictions) => {
                for (email, prediction) in chunk.iter().zip(predictions.iter()) {
                    let heuristic = heuristic_stage(&email.text);
                    let decision =
                        resolve_prediction(prediction, heuristic, context.confidence_threshold);

                    info!(
                        trace_id,
                        row_id = %email.id,
                        label = %decision.final_label,
                        confidence = decision.final_score,
                        needs_review = decision.needs_review,
                        "classified email"
                    );
                    metrics::counter!("classification_labels_total", "stage" => decision.final_label.as_str())
                        .increment(1);

                    updates.push(ClassificationUpdate {
                        id: email.id,
                        stage: decision.final_label,
                        confidence: confidence_percent(decision.final_score),
                        stage_secondary: decision.second_label,
                        confidence_secondary: confidence_percent(decision.second_score),
                        needs_review: decision.needs_review,
                    });
                }
            }
            Err(error) => {
                warn!(trace_id, rows = chunk.len(), "classification inference failed, marking for retry: {}", error);
                retry_ids.extend(chunk.iter().map(|e| e.id));
            }
        }
    }

    context.staging.apply_classification(&updates).await?;
    context
        .staging
        .mark_retry(&retry_ids, EmailStatus::AwaitClassification)
        .await?;

    if !updates.is_empty() {
        let classified_ids: Vec<Uuid> = updates.iter().map(|u| u.id).collect();
        context
            .transfer_queue
            .enqueue(NewJob::new(
                context.max_retries,
                TransferTask {
                    trace_id: task.trace_id.clone(),
                    row_ids: classified_ids,
                },
            ))
            .await?;
    }

    if !retry_ids.is_empty() {
        let countdown = stage_retry_countdown(task.attempt);
        context
            .classification_queue
            .enqueue(NewJob::with_countdown(
                context.max_retries,
                ClassificationTask {
                    trace_id: task.trace_id.clone(),
                    row_ids: retry_ids.clone(),
                    attempt: task.attempt + 1,
                },
                countdown,
            ))
            .await?;
    }

    info!(trace_id, classified = updates.len(), retry = retry_ids.len(), "classification task completed");

    Ok(ClassificationOutcome::Completed {
        classified: updates.len(),
        retry: retry_ids.len(),
    })
}

/// Poll the classification queue and spawn a task per dequeued job.
pub struct ClassificationWorker {
    name: String,
    queue: PgQueue,
    context: Arc<ClassificationContext>,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl ClassificationWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        context: Arc<ClassificationContext>,
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

    async fn wait_for_job(&self) -> Result<PgJob<ClassificationTask>, PgQueueError> {
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
                process_classification_job(context, job, retry_policy).await;
                drop(permit);
            });
        }
    }
}

async fn process_classification_job(
    context: Arc<ClassificationContext>,
    job: PgJob<ClassificationTask>,
    retry_policy: RetryPolicy,
) {
    let task = job.job.parameters.0.clone();
    let trace_id = task.trace_id.clone();
    let attempt = job.job.attempt;

    metrics::counter!("classification_jobs_total").increment(1);

    match process_classification(&context, task).await {
        Ok(_) => {
            if let Err(error) = job.complete().await {
                error!(%trace_id, "failed to mark classification job completed: {}", error);
                return;
            }
            metrics::counter!("classification_jobs_completed").increment(1);
        }
        Err(error) => {
            error!(%trace_id, "classification task failed: {}", error);
            let interval = retry_policy.retry_interval(attempt as u32);
            match job.retry(&error.to_string(), interval).await {
                Ok(()) => {
                    metrics::counter!("classification_jobs_retried").increment(1);
                }
                Err(PgJobError::RetryInvalidError { job, .. }) => {
                    metrics::counter!("classification_jobs_failed").increment(1);
                    if let Err(error) = job.fail(&error.to_string()).await {
                        error!(%trace_id, "failed to mark classification job failed: {}", error);
                    }
                }
                Err(error) => {
                    error!(%trace_id, "failed to reschedule classification job: {}", error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confidence_percent() {
        assert_eq!(confidence_percent(0.62), 62);
        assert_eq!(confidence_percent(0.005), 1);
        assert_eq!(confidence_percent(0.0), 0);
        assert_eq!(confidence_percent(1.0), 100);
        assert_eq!(confidence_percent(1.7), 100);
        assert_eq!(confidence_percent(-0.3), 0);
    }
}
