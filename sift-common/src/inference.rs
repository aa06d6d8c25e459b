//! Clients for the model-serving endpoints.
//!
//! The pipeline treats the models as pure functions behind named interfaces:
//! a scalar job-relevance probability, a zero-shot stage classifier, and a
//! named-entity recognizer. Each worker process constructs one client at
//! start and issues a warm-up call before consuming its queue.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::tasks::{ApplicationStage, ALL_STAGES};

/// The hypothesis template the zero-shot classifier fills with each label.
pub const HYPOTHESIS_TEMPLATE: &str = "This email is a {}.";

/// Long-form candidate label per stage. The model scores these descriptions;
/// we map them back to their stage keys afterwards.
pub const CANDIDATE_LABELS: [(ApplicationStage, &str); 5] = [
    (
        ApplicationStage::Applied,
        "email confirming that the company received my job application \
         and may review it later, but does not ask for scheduling or availability \
         and does not mention offers or rejection",
    ),
    (
        ApplicationStage::Interview,
        "email about scheduling, confirming, or following up on a job interview \
         or phone screen, including messages that request my availability or \
         contain words like interview, meeting, call, or chat",
    ),
    (
        ApplicationStage::Offer,
        "email clearly telling me that I have a job offer or describing the terms \
         of a job offer, such as salary, compensation, benefits, or an offer letter",
    ),
    (
        ApplicationStage::Accepted,
        "welcome email confirming that I accepted the job and will join as a new hire, \
         usually mentioning my start date or onboarding",
    ),
    (
        ApplicationStage::Rejected,
        "email clearly saying the company is not moving forward, \
         that I was not selected, or that the position is closed. \
         It may thank me for interviewing, but must clearly indicate rejection.",
    ),
];

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("inference request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("inference response could not be interpreted: {0}")]
    DecodeError(String),
    #[error("inference response shape mismatch: expected {expected} results, got {got}")]
    ShapeError { expected: usize, got: usize },
}

/// Top-two output of the zero-shot classifier for one email.
#[derive(Debug, Clone, PartialEq)]
pub struct StagePrediction {
    pub top_label: ApplicationStage,
    pub top_score: f32,
    pub second_label: ApplicationStage,
    pub second_score: f32,
}

impl StagePrediction {
    /// Build from per-stage scores by ranking them.
    pub fn from_scores(scores: &HashMap<ApplicationStage, f32>) -> Option<Self> {
        let mut ranked: Vec<(ApplicationStage, f32)> =
            ALL_STAGES.iter().filter_map(|s| scores.get(s).map(|v| (*s, *v))).collect();
        if ranked.len() < 2 {
            return None;
        }
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

        Some(Self {
            top_label: ranked[0].0,
            top_score: ranked[0].1,
            second_label: ranked[1].0,
            second_score: ranked[1].1,
        })
    }
}

/// A named-entity span as returned by the recognizer. Offsets are character
/// offsets into the submitted text.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct Entity {
    pub label: String,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

#[async_trait]
pub trait RelevanceModel: Send + Sync {
    /// Scalar job-relatedness probability per text, in input order.
    async fn score(&self, texts: &[String]) -> Result<Vec<f32>, InferenceError>;
}

#[async_trait]
pub trait StageClassifier: Send + Sync {
    /// Zero-shot stage prediction per text, in input order.
    async fn classify(&self, texts: &[String]) -> Result<Vec<StagePrediction>, InferenceError>;
}

#[async_trait]
pub trait EntityRecognizer: Send + Sync {
    /// Entity spans per text, in input order.
    async fn recognize(&self, texts: &[String]) -> Result<Vec<Vec<Entity>>, InferenceError>;
}

#[derive(Serialize)]
struct TextsRequest<'a> {
    texts: &'a [String],
}

#[derive(Deserialize)]
struct ProbabilitiesResponse {
    probabilities: Vec<f32>,
}

#[derive(Serialize)]
struct ZeroShotRequest<'a> {
    inputs: &'a [String],
    parameters: ZeroShotParameters<'a>,
}

#[derive(Serialize)]
struct ZeroShotParameters<'a> {
    candidate_labels: Vec<&'a str>,
    hypothesis_template: &'a str,
}

#[derive(Deserialize)]
struct ZeroShotResponse {
    labels: Vec<String>,
    scores: Vec<f32>,
}

#[derive(Deserialize)]
struct EntitiesResponse {
    entities: Vec<Vec<Entity>>,
}

/// HTTP client for all three model endpoints.
pub struct InferenceClient {
    client: reqwest::Client,
    relevance_url: String,
    classification_url: String,
    ner_url: String,
}

impl InferenceClient {
    pub fn new(
        relevance_url: String,
        classification_url: String,
        ner_url: String,
        request_timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .user_agent("mailsift inference client")
            .timeout(request_timeout)
            .build()
            .expect("failed to construct reqwest client for inference");

        Self {
            client,
            relevance_url,
            classification_url,
            ner_url,
        }
    }

    /// Warm passes: run a throwaway input through an endpoint so the serving
    /// side loads its weights before real traffic arrives.
    pub async fn warm_relevance(&self) -> Result<(), InferenceError> {
        self.score(&["Warmup text.".to_owned()]).await.map(|_| ())
    }

    pub async fn warm_classification(&self) -> Result<(), InferenceError> {
        self.classify(&["Warmup text.".to_owned()]).await.map(|_| ())
    }

    pub async fn warm_ner(&self) -> Result<(), InferenceError> {
        self.recognize(&["Warmup text.".to_owned()]).await.map(|_| ())
    }

    /// Map a scored description back to its stage.
    fn stage_for_description(description: &str) -> Option<ApplicationStage> {
        CANDIDATE_LABELS
            .iter()
            .find(|(_, d)| *d == description)
            .map(|(stage, _)| *stage)
    }

    fn prediction_from_response(response: &ZeroShotResponse) -> Result<StagePrediction, InferenceError> {
        let mut scores: HashMap<ApplicationStage, f32> = HashMap::new();
        for (label, score) in response.labels.iter().zip(response.scores.iter()) {
            if let Some(stage) = Self::stage_for_description(label) {
                scores.insert(stage, *score);
            }
        }

        StagePrediction::from_scores(&scores).ok_or_else(|| {
            InferenceError::DecodeError("classifier response missing stage scores".to_owned())
        })
    }
}

#[async_trait]
impl RelevanceModel for InferenceClient {
    async fn score(&self, texts: &[String]) -> Result<Vec<f32>, InferenceError> {
        let response: ProbabilitiesResponse = self
            .client
            .post(&self.relevance_url)
            .json(&TextsRequest { texts })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.probabilities.len() != texts.len() {
            return Err(InferenceError::ShapeError {
                expected: texts.len(),
                got: response.probabilities.len(),
            });
        }

        Ok(response.probabilities)
    }
}

#[async_trait]
impl StageClassifier for InferenceClient {
    async fn classify(&self, texts: &[String]) -> Result<Vec<StagePrediction>, InferenceError> {
        let request = ZeroShotRequest {
            inputs: texts,
            parameters: ZeroShotParameters {
                candidate_labels: CANDIDATE_LABELS.iter().map(|(_, d)| *d).collect(),
                hypothesis_template: HYPOTHESIS_TEMPLATE,
            },
        };

        let responses: Vec<ZeroShotResponse> = self
            .client
            .post(&self.classification_url)
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if responses.len() != texts.len() {
            return Err(InferenceError::ShapeError {
                expected: texts.len(),
                got: responses.len(),
            });
        }

        responses
            .iter()
            .map(Self::prediction_from_response)
            .collect()
    }
}

#[async_trait]
impl EntityRecognizer for InferenceClient {
    async fn recognize(&self, texts: &[String]) -> Result<Vec<Vec<Entity>>, InferenceError> {
        let response: EntitiesResponse = self
            .client
            .post(&self.ner_url)
            .json(&TextsRequest { texts })
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.entities.len() != texts.len() {
            return Err(InferenceError::ShapeError {
                expected: texts.len(),
                got: response.entities.len(),
            });
        }

        Ok(response.entities)
    }
}

/// Fixed-output stand-ins for tests.
pub mod mock {
    use super::*;

    #[derive(Clone, Default)]
    pub struct MockRelevanceModel {
        pub probabilities: Vec<f32>,
        pub fail: bool,
    }

    #[async_trait]
    impl RelevanceModel for MockRelevanceModel {
        async fn score(&self, texts: &[String]) -> Result<Vec<f32>, InferenceError> {
            if self.fail {
                return Err(InferenceError::DecodeError("mock failure".to_owned()));
            }
            Ok(self.probabilities.iter().copied().cycle().take(texts.len()).collect())
        }
    }

    #[derive(Clone)]
    pub struct MockStageClassifier {
        pub prediction: StagePrediction,
        pub fail: bool,
    }

    #[async_trait]
    impl StageClassifier for MockStageClassifier {
        async fn classify(&self, texts: &[String]) -> Result<Vec<StagePrediction>, InferenceError> {
            if self.fail {
                return Err(InferenceError::DecodeError("mock failure".to_owned()));
            }
            Ok(vec![self.prediction.clone(); texts.len()])
        }
    }

    #[derive(Clone, Default)]
    pub struct MockEntityRecognizer {
        pub entities: Vec<Vec<Entity>>,
    }

    #[async_trait]
    impl EntityRecognizer for MockEntityRecognizer {
        async fn recognize(&self, texts: &[String]) -> Result<Vec<Vec<Entity>>, InferenceError> {
            let mut out = self.entities.clone();
            out.resize(texts.len(), Vec::new());
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prediction_ranks_scores() {
        let mut scores = HashMap::new();
        scores.insert(ApplicationStage::Applied, 0.55);
        scores.insert(ApplicationStage::Interview, 0.62);
        scores.insert(ApplicationStage::Offer, 0.02);
        scores.insert(ApplicationStage::Accepted, 0.01);
        scores.insert(ApplicationStage::Rejected, 0.03);

        let prediction = StagePrediction::from_scores(&scores).unwrap();
        assert_eq!(prediction.top_label, ApplicationStage::Interview);
        assert_eq!(prediction.second_label, ApplicationStage::Applied);
    }

    #[test]
    fn test_descriptions_map_back_to_stages() {
        for (stage, description) in CANDIDATE_LABELS {
            assert_eq!(InferenceClient::stage_for_description(description), Some(stage));
        }
        assert_eq!(InferenceClient::stage_for_description("something else"), None);
    }

    #[test]
    fn test_prediction_from_response_requires_known_labels() {
        let response = ZeroShotResponse {
            labels: vec!["warm".to_owned(), "cold".to_owned()],
            scores: vec![0.9, 0.1],
        };
        assert!(InferenceClient::prediction_from_response(&response).is_err());
    }
}
