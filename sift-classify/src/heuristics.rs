//! Keyword heuristics layered over the model's prediction.
//!
//! The phrase table catches wordings the zero-shot model reliably gets
//! wrong; the overlay decides the final label and whether a human should
//! look at the row.

use sift_common::inference::StagePrediction;
use sift_common::tasks::ApplicationStage;

const MAPPINGS: [(ApplicationStage, &[&str]); 5] = [
    (
        ApplicationStage::Applied,
        &[
            "application received",
            "application submitted",
            "application for",
            "applied for",
            "application confirmation",
        ],
    ),
    (
        ApplicationStage::Interview,
        &[
            "interview scheduled",
            "interview confirmed",
            "interview invitation",
            "schedule an interview",
        ],
    ),
    (
        ApplicationStage::Offer,
        &[
            "job offer",
            "offer letter",
            "extended an offer",
            "formal offer",
            "congratulations on your offer",
        ],
    ),
    (
        ApplicationStage::Accepted,
        &[
            "offer accepted",
            "joining date confirmed",
            "signed offer",
            "start date confirmed",
        ],
    ),
    (
        ApplicationStage::Rejected,
        &[
            "application rejected",
            "not selected",
            "not moving forward",
            "position filled",
            "application unsuccessful",
        ],
    ),
];

/// Rule-based stage from keyword phrases, if any phrase matches.
pub fn heuristic_stage(text: &str) -> Option<ApplicationStage> {
    if text.is_empty() {
        return None;
    }
    let lowered = text.to_lowercase();

    for (stage, phrases) in MAPPINGS {
        for phrase in phrases {
            if lowered.contains(phrase) {
                return Some(stage);
            }
        }
    }

    None
}

/// The classifier's final verdict for one email.
#[derive(Debug, Clone, PartialEq)]
pub struct Decision {
    pub final_label: ApplicationStage,
    pub final_score: f32,
    pub second_label: ApplicationStage,
    pub second_score: f32,
    pub needs_review: bool,
}

/// Combine the model prediction with the heuristic label.
///
/// Review is flagged when confidence is low or the top two scores are close.
/// A heuristic agreeing with the model changes nothing; one agreeing with
/// the runner-up swaps the labels and flags review; one agreeing with
/// neither keeps the model's label but flags review.
pub fn resolve_prediction(
    prediction: &StagePrediction,
    heuristic: Option<ApplicationStage>,
    confidence_threshold: f32,
) -> Decision {
    let mut needs_review = prediction.top_score < confidence_threshold
        || (prediction.top_score - prediction.second_score).abs() < 0.1;

    let mut final_label = prediction.top_label;
    if let Some(heuristic) = heuristic {
        if heuristic == prediction.top_label {
            // Model and rules agree.
        } else if heuristic == prediction.second_label {
            final_label = prediction.second_label;
            needs_review = true;
        } else {
            needs_review = true;
        }
    }

    // When the final label is the model's second choice, swap labels and
    // scores so the stored confidence matches the stored label.
    if final_label == prediction.second_label && final_label != prediction.top_label {
        Decision {
            final_label: prediction.second_label,
            final_score: prediction.second_score,
            second_label: prediction.top_label,
            second_score: prediction.top_score,
            needs_review,
        }
    } else {
        Decision {
            final_label: prediction.top_label,
            final_score: prediction.top_score,
            second_label: prediction.second_label,
            second_score: prediction.second_score,
            needs_review,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prediction(
        top: ApplicationStage,
        top_score: f32,
        second: ApplicationStage,
        second_score: f32,
    ) -> StagePrediction {
        StagePrediction {
            top_label: top,
            top_score,
            second_label: second,
            second_score,
        }
    }

    #[test]
    fn test_heuristic_phrases() {
        assert_eq!(
            heuristic_stage("we confirm your application received yesterday"),
            Some(ApplicationStage::Applied)
        );
        assert_eq!(
            heuristic_stage("your Offer Letter is attached"),
            Some(ApplicationStage::Offer)
        );
        assert_eq!(
            heuristic_stage("you were not selected for this role"),
            Some(ApplicationStage::Rejected)
        );
        assert_eq!(heuristic_stage("lunch on tuesday?"), None);
        assert_eq!(heuristic_stage(""), None);
    }

    #[test]
    fn test_confident_prediction_passes_through() {
        let decision = resolve_prediction(
            &prediction(ApplicationStage::Applied, 0.91, ApplicationStage::Interview, 0.05),
            None,
            0.6,
        );
        assert_eq!(decision.final_label, ApplicationStage::Applied);
        assert!(!decision.needs_review);
    }

    #[test]
    fn test_low_confidence_flags_review() {
        let decision = resolve_prediction(
            &prediction(ApplicationStage::Applied, 0.45, ApplicationStage::Rejected, 0.2),
            None,
            0.6,
        );
        assert_eq!(decision.final_label, ApplicationStage::Applied);
        assert!(decision.needs_review);
    }

    #[test]
    fn test_heuristic_swaps_to_second_label() {
        // Model says interview (0.62) over applied (0.55); the body contains
        // "application received", so the heuristic forces the swap.
        let decision = resolve_prediction(
            &prediction(ApplicationStage::Interview, 0.62, ApplicationStage::Applied, 0.55),
            Some(ApplicationStage::Applied),
            0.6,
        );
        assert_eq!(decision.final_label, ApplicationStage::Applied);
        assert_eq!(decision.final_score, 0.55);
        assert_eq!(decision.second_label, ApplicationStage::Interview);
        assert_eq!(decision.second_score, 0.62);
        assert!(decision.needs_review);
    }

    #[test]
    fn test_close_scores_flag_review() {
        // offer 0.51 vs accepted 0.49: gap under 0.1.
        let decision = resolve_prediction(
            &prediction(ApplicationStage::Offer, 0.51, ApplicationStage::Accepted, 0.49),
            None,
            0.6,
        );
        assert_eq!(decision.final_label, ApplicationStage::Offer);
        assert!(decision.needs_review);
    }

    #[test]
    fn test_heuristic_disagreeing_with_both_keeps_label() {
        let decision = resolve_prediction(
            &prediction(ApplicationStage::Interview, 0.88, ApplicationStage::Offer, 0.07),
            Some(ApplicationStage::Rejected),
            0.6,
        );
        assert_eq!(decision.final_label, ApplicationStage::Interview);
        assert!(decision.needs_review);
    }

    #[test]
    fn test_heuristic_agreeing_with_top_keeps_confidence() {
        let decision = resolve_prediction(
            &prediction(ApplicationStage::Applied, 0.93, ApplicationStage::Interview, 0.04),
            Some(ApplicationStage::Applied),
            0.6,
        );
        assert_eq!(decision.final_label, ApplicationStage::Applied);
        assert!(!decision.needs_review);
    }
}
