//! Relevance stage: decrypt staged bodies, redact PII, score job-relatedness
//! and route each row onward.

use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};
use uuid::Uuid;

use sift_common::crypto::TokenCipher;
use sift_common::health::HealthHandle;
use sift_common::inference::{EntityRecognizer, InferenceError, RelevanceModel};
use sift_common::pgqueue::{NewJob, PgJob, PgJobError, PgQueue, PgQueueError};
use sift_common::redact::{strip_pii, EmailText};
use sift_common::retry::{stage_retry_countdown, RetryPolicy};
use sift_common::staging::{RelevancePartition, StagingStore};
use sift_common::tasks::{ClassificationTask, NerTask, RelevanceTask};

use crate::error::RelevanceError;

pub struct RelevanceContext {
    pub staging: StagingStore,
    pub cipher: TokenCipher,
    pub model: Arc<dyn RelevanceModel>,
    pub recognizer: Arc<dyn EntityRecognizer>,
    pub relevance_queue: PgQueue,
    pub classification_queue: PgQueue,
    pub ner_queue: PgQueue,
    pub threshold: f32,
    pub input_cap: usize,
    pub model_batch_size: usize,
    pub max_retries: i32,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RelevanceOutcome {
    Completed {
        relevant: usize,
        purge: usize,
        retry: usize,
    },
    /// The task arrived past its retry budget; rows were failed permanently.
    Exhausted,
}

/// Truncate to at most `cap` characters, respecting char boundaries.
pub fn truncate_chars(text: &str, cap: usize) -> String {
    text.chars().take(cap).collect()
}

/// Split ids into relevant/purge by the probability threshold.
pub fn partition_by_threshold(
    ids: &[Uuid],
    probabilities: &[f32],
    threshold: f32,
) -> (Vec<Uuid>, Vec<Uuid>) {
    let mut relevant = Vec::new();
    let mut purge = Vec::new();
    for (id, probability) in ids.iter().zip(probabilities.iter()) {
        if *probability >= threshold {
            relevant.push(*id);
        } else {
            purge.push(*id);
        }
    }
    (relevant, purge)
}

/// Redact a chunk of bodies and score them.
pub async fn score_bodies(
    model: &dyn RelevanceModel,
    recognizer: &dyn EntityRecognizer,
    bodies: Vec<String>,
    input_cap: usize,
) -> Result<Vec<f32>, InferenceError> {
    let emails: Vec<EmailText> = bodies
        .into_iter()
        .map(|body| EmailText {
            subject: String::new(),
            body,
        })
        .collect();

    let (redacted, counts) = strip_pii(emails, recognizer).await?;
    for (category, count) in &counts {
        metrics::counter!("relevance_redactions_total", "category" => category.clone())
            .increment(*count as u64);
    }

    let texts: Vec<String> = redacted
        .into_iter()
        .map(|email| truncate_chars(&email.body, input_cap))
        .collect();

    model.score(&texts).await
}

/// Run one relevance task.
pub async fn process_relevance(
    context: &RelevanceContext,
    task: RelevanceTask,
) -> Result<RelevanceOutcome, RelevanceError> {
    let trace_id = task.trace_id.as_str();
    info!(trace_id, attempt = task.attempt, rows = task.row_ids.len(), "starting relevance task");

    if task.attempt > context.max_retries {
        error!(trace_id, "exceeded maximum retries for relevance task");
        context.staging.mark_failed_permanently(&task.row_ids).await?;
        metrics::counter!("relevance_rows_failed_permanently").increment(task.row_ids.len() as u64);
        return Ok(RelevanceOutcome::Exhausted);
    }

    let rows = context.staging.fetch_model_inputs(&task.row_ids).await?;

    let mut decrypted: Vec<(Uuid, String)> = Vec::with_capacity(rows.len());
    for row in &rows {
        match context.cipher.decrypt(&row.body_enc) {
            Ok(body) => decrypted.push((row.id, body)),
            Err(error) => {
                // The row stays in place for later investigation.
                warn!(trace_id, row_id = %row.id, "failed to decrypt body, omitting row: {}", error);
            }
        }
    }

    let mut partition = RelevancePartition::default();
    for chunk in decrypted.chunks(context.model_batch_size.max(1)) {
        let ids: Vec<Uuid> = chunk.iter().map(|(id, _)| *id).collect();
        let bodies: Vec<String> = chunk.iter().map(|(_, body)| body.clone()).collect();

        match score_bodies(
            context.model.as_ref(),
            context.recognizer.as_ref(),
            bodies,
            context.input_cap,
        )
        .await
        {
            Ok(probabilities) => {
                let (relevant, purge) =
                    partition_by_threshold(&ids, &probabilities, context.threshold);
                partition.relevant.extend(relevant);
                partition.purge.extend(purge);
            }
            Err(error) => {
                warn!(trace_id, rows = ids.len(), "relevance inference failed, marking for retry: {}", error);
                partition.retry.extend(ids);
            }
        }
    }

    context.staging.apply_relevance(&partition).await?;

    if !partition.relevant.is_empty() {
        context
            .classification_queue
            .enqueue(NewJob::new(
                context.max_retries,
                ClassificationTask {
                    trace_id: task.trace_id.clone(),
                    row_ids: partition.relevant.clone(),
                    attempt: 1,
                },
            ))
            .await?;
        context
            .ner_queue
            .enqueue(NewJob::new(
                context.max_retries,
                NerTask {
                    trace_id: task.trace_id.clone(),
                    row_ids: partition.relevant.clone(),
                },
            ))
            .await?;
    }

    if !partition.retry.is_empty() {
        let countdown = stage_retry_countdown(task.attempt);
        context
            .relevance_queue
            .enqueue(NewJob::with_countdown(
                context.max_retries,
                RelevanceTask {
                    trace_id: task.trace_id.clone(),
                    row_ids: partition.retry.clone(),
                    attempt: task.attempt + 1,
                },
                countdown,
            ))
            .await?;
    }

    info!(
        trace_id,
        relevant = partition.relevant.len(),
        purge = partition.purge.len(),
        retry = partition.retry.len(),
        "relevance task completed"
    );

    Ok(RelevanceOutcome::Completed {
        relevant: partition.relevant.len(),
        purge: partition.purge.len(),
        retry: partition.retry.len(),
    })
}

/// Poll the relevance queue and spawn a task per dequeued job.
pub struct RelevanceWorker {
    name: String,
    queue: PgQueue,
    context: Arc<RelevanceContext>,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl RelevanceWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        context: Arc<RelevanceContext>,
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

    async fn wait_for_job(&self) -> Result<PgJob<RelevanceTask>, PgQueueError> {
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
                process_relevance_job(context, job, retry_policy).await;
                drop(permit);
            });
        }
    }
}

async fn process_relevance_job(
    context: Arc<RelevanceContext>,
    job: PgJob<RelevanceTask>,
    retry_policy: RetryPolicy,
) {
    let task = job.job.parameters.0.clone();
    let trace_id = task.trace_id.clone();
    let attempt = job.job.attempt;

    metrics::counter!("relevance_jobs_total").increment(1);

    match process_relevance(&context, task).await {
        Ok(_) => {
            if let Err(error) = job.complete().await {
                error!(%trace_id, "failed to mark relevance job completed: {}", error);
                return;
            }
            metrics::counter!("relevance_jobs_completed").increment(1);
        }
        Err(error) => {
            error!(%trace_id, "relevance task failed: {}", error);
            let interval = retry_policy.retry_interval(attempt as u32);
            match job.retry(&error.to_string(), interval).await {
                Ok(()) => {
                    metrics::counter!("relevance_jobs_retried").increment(1);
                }
                Err(PgJobError::RetryInvalidError { job, .. }) => {
                    metrics::counter!("relevance_jobs_failed").increment(1);
                    if let Err(error) = job.fail(&error.to_string()).await {
                        error!(%trace_id, "failed to mark relevance job failed: {}", error);
                    }
                }
                Err(error) => {
                    error!(%trace_id, "failed to reschedule relevance job: {}", error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sift_common::inference::mock::{MockEntityRecognizer, MockRelevanceModel};

    #[test]
    fn test_truncate_chars() {
        assert_eq!(truncate_chars("hello", 200), "hello");
        assert_eq!(truncate_chars("hello", 3), "hel");

        // Multibyte content truncates on char boundaries, not bytes.
        let long = "é".repeat(300);
        assert_eq!(truncate_chars(&long, 200).chars().count(), 200);

        // A body well past the cap shrinks without issue.
        let huge = "a".repeat(2 * 1024 * 1024);
        assert_eq!(truncate_chars(&huge, 200).len(), 200);
    }

    #[test]
    fn test_partition_by_threshold() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let probabilities = [0.02, 0.1, 0.95, 0.099];

        let (relevant, purge) = partition_by_threshold(&ids, &probabilities, 0.1);
        assert_eq!(relevant, vec![ids[1], ids[2]]);
        assert_eq!(purge, vec![ids[0], ids[3]]);
    }

    #[tokio::test]
    async fn test_score_bodies_redacts_before_inference() {
        let model = MockRelevanceModel {
            probabilities: vec![0.9],
            fail: false,
        };
        let recognizer = MockEntityRecognizer::default();

        let probabilities = score_bodies(
            &model,
            &recognizer,
            vec!["reach me at someone@example.com".to_owned()],
            200,
        )
        .await
        .unwrap();
        assert_eq!(probabilities, vec![0.9]);
    }

    #[tokio::test]
    async fn test_score_bodies_propagates_model_failure() {
        let model = MockRelevanceModel {
            probabilities: vec![],
            fail: true,
        };
        let recognizer = MockEntityRecognizer::default();

        let result = score_bodies(&model, &recognizer, vec!["anything".to_owned()], 200).await;
        assert!(result.is_err());
    }
}
