//! NER stage: decrypt subject and body for a relevant batch, run the
//! recognizer, and surface per-label entity counts. Nothing is persisted;
//! the counts feed metrics and logs only.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time;

use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use sift_common::crypto::TokenCipher;
use sift_common::health::HealthHandle;
use sift_common::inference::{Entity, EntityRecognizer};
use sift_common::pgqueue::{PgJob, PgJobError, PgQueue, PgQueueError};
use sift_common::retry::RetryPolicy;
use sift_common::staging::StagingStore;
use sift_common::tasks::NerTask;

use crate::error::NerError;

pub struct NerContext {
    pub staging: StagingStore,
    pub cipher: TokenCipher,
    pub recognizer: Arc<dyn EntityRecognizer>,
}

/// Sum entity occurrences per label across a batch of results.
pub fn aggregate_entity_counts(batches: &[Vec<Entity>]) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for entities in batches {
        for entity in entities {
            *counts.entry(entity.label.clone()).or_insert(0) += 1;
        }
    }
    counts
}

/// Run one NER task, returning the aggregated counts.
pub async fn process_ner(
    context: &NerContext,
    task: NerTask,
) -> Result<BTreeMap<String, usize>, NerError> {
    let trace_id = task.trace_id.as_str();
    info!(trace_id, rows = task.row_ids.len(), "starting ner task");

    let rows = context.staging.fetch_model_inputs(&task.row_ids).await?;

    let mut texts = Vec::with_capacity(rows.len() * 2);
    for row in &rows {
        let subject = context.cipher.decrypt(&row.subject_enc);
        let body = context.cipher.decrypt(&row.body_enc);
        match (subject, body) {
            (Ok(subject), Ok(body)) => {
                texts.push(subject);
                texts.push(body);
            }
            (Err(error), _) | (_, Err(error)) => {
                warn!(trace_id, row_id = %row.id, "failed to decrypt email, omitting row: {}", error);
            }
        }
    }

    let results = context.recognizer.recognize(&texts).await?;
    let counts = aggregate_entity_counts(&results);

    for (label, count) in &counts {
        metrics::counter!("ner_entities_total", "label" => label.clone()).increment(*count as u64);
    }
    info!(trace_id, counts = ?counts, "ner task completed");

    Ok(counts)
}

/// Poll the ner queue and spawn a task per dequeued job.
pub struct NerWorker {
    name: String,
    queue: PgQueue,
    context: Arc<NerContext>,
    poll_interval: time::Duration,
    max_concurrent_jobs: usize,
    retry_policy: RetryPolicy,
    liveness: HealthHandle,
}

impl NerWorker {
    pub fn new(
        name: &str,
        queue: PgQueue,
        context: Arc<NerContext>,
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

    async fn wait_for_job(&self) -> Result<PgJob<NerTask>, PgQueueError> {
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
                process_ner_job(context, job, retry_policy).await;
                drop(permit);
            });
        }
    }
}

async fn process_ner_job(context: Arc<NerContext>, job: PgJob<NerTask>, retry_policy: RetryPolicy) {
    let task = job.job.parameters.0.clone();
    let trace_id = task.trace_id.clone();
    let attempt = job.job.attempt;

    metrics::counter!("ner_jobs_total").increment(1);

    match process_ner(&context, task).await {
        Ok(_) => {
            if let Err(error) = job.complete().await {
                error!(%trace_id, "failed to mark ner job completed: {}", error);
                return;
            }
            metrics::counter!("ner_jobs_completed").increment(1);
        }
        Err(error) => {
            error!(%trace_id, "ner task failed: {}", error);
            let interval = retry_policy.retry_interval(attempt as u32);
            match job.retry(&error.to_string(), interval).await {
                Ok(()) => {
                    metrics::counter!("ner_jobs_retried").increment(1);
                }
                Err(PgJobError::RetryInvalidError { job, .. }) => {
                    metrics::counter!("ner_jobs_failed").increment(1);
                    if let Err(error) = job.fail(&error.to_string()).await {
                        error!(%trace_id, "failed to mark ner job failed: {}", error);
                    }
                }
                Err(error) => {
                    error!(%trace_id, "failed to reschedule ner job: {}", error);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entity(label: &str) -> Entity {
        Entity {
            label: label.to_owned(),
            start: 0,
            end: 1,
            text: "x".to_owned(),
        }
    }

    #[test]
    fn test_aggregate_entity_counts() {
        let batches = vec![
            vec![entity("PERSON"), entity("ORG")],
            vec![entity("PERSON"), entity("GPE"), entity("PERSON")],
            vec![],
        ];

        let counts = aggregate_entity_counts(&batches);
        assert_eq!(counts.get("PERSON"), Some(&3));
        assert_eq!(counts.get("ORG"), Some(&1));
        assert_eq!(counts.get("GPE"), Some(&1));
        assert_eq!(counts.get("LOC"), None);
    }

    #[test]
    fn test_aggregate_empty() {
        assert!(aggregate_entity_counts(&[]).is_empty());
    }
}
