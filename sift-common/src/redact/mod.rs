//! Five-layer PII redaction.
//!
//! A deterministic text transformation applied to decrypted email content
//! before any model sees it. Layers run in a fixed order: regex PII, NER
//! entities, keys/secrets, money/numbers, and a final mixed-token sweep,
//! followed by a normalization pass that flattens the text, placeholders
//! included, down to lowercase alphanumerics.
//!
//! Placeholders are bracketed tokens (`[EMAIL]`, `[SECRET]`, ...) while the
//! layers run; later layers never touch content inside brackets, so nested
//! brackets cannot appear and bracketed literals in the source corpus
//! survive every layer. Re-running the pipeline on its own output changes
//! nothing.

mod numbers;
mod patterns;
mod secrets;

use std::collections::BTreeMap;

use regex::Regex;

use crate::inference::{Entity, EntityRecognizer, InferenceError};

pub use numbers::{redact_mixed_tokens, redact_money_and_numbers};
pub use patterns::redact_pii;
pub use secrets::redact_keys;

/// Per-category replacement counts, aggregated across a batch.
pub type RedactionCounts = BTreeMap<String, usize>;

/// A subject/body pair moving through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct EmailText {
    pub subject: String,
    pub body: String,
}

/// Replacement targets for recognized entity labels.
fn entity_placeholder(label: &str) -> Option<&'static str> {
    match label {
        "PERSON" => Some("[PERSON]"),
        "ORG" => Some("[ORG]"),
        "GPE" | "LOC" | "FAC" => Some("[LOCATION]"),
        _ => None,
    }
}

/// Placeholders layer 1 can leave behind; the NER layer must not re-tag them.
const LAYER1_PLACEHOLDERS: [&str; 13] = [
    "[EMAIL]", "[URL]", "[IPV4]", "[IPV6]", "[MAC]", "[SSN]", "[CREDIT_CARD]", "[UUID]",
    "[DATE]", "[ZIP]", "[ADDRESS]", "[HANDLE]", "[PHONE]",
];

pub(crate) fn merge_counts(total: &mut RedactionCounts, layer: RedactionCounts) {
    for (key, value) in layer {
        *total.entry(key).or_insert(0) += value;
    }
}

/// Replace every match of `re` (or of capture group `group`) with
/// `placeholder`, subject to `should_replace`. The guard receives the matched
/// token and its span so callers can emulate boundary conditions the regex
/// engine cannot express.
pub(crate) fn replace_matches<F>(
    text: &str,
    re: &Regex,
    group: Option<usize>,
    placeholder: &str,
    mut should_replace: F,
) -> (String, usize)
where
    F: FnMut(&str, usize, usize, &str) -> bool,
{
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut count = 0;

    for caps in re.captures_iter(text) {
        let m = match group {
            Some(g) => caps.get(g),
            None => caps.get(0),
        };
        let Some(m) = m else { continue };
        let (start, end) = (m.start(), m.end());
        if start < last {
            continue;
        }
        if should_replace(m.as_str(), start, end, text) {
            out.push_str(&text[last..start]);
            out.push_str(placeholder);
            last = end;
            count += 1;
        }
    }

    out.push_str(&text[last..]);
    (out, count)
}

/// The character before byte offset `idx`, if any.
pub(crate) fn prev_char(text: &str, idx: usize) -> Option<char> {
    text[..idx].chars().next_back()
}

/// The character at byte offset `idx`, if any.
pub(crate) fn next_char(text: &str, idx: usize) -> Option<char> {
    text[idx..].chars().next()
}

pub(crate) fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Whether the span `[start, end)` sits inside a bracketed token. Bracketed
/// literals in the source corpus, and placeholders from earlier layers, are
/// preserved by refusing to replace anything enclosed this way.
pub(crate) fn inside_brackets(text: &str, start: usize, end: usize) -> bool {
    let open_before = text[..start]
        .chars()
        .rev()
        .find(|c| *c == '[' || *c == ']')
        .map(|c| c == '[')
        .unwrap_or(false);
    let close_after = text[end..]
        .chars()
        .find(|c| *c == '[' || *c == ']')
        .map(|c| c == ']')
        .unwrap_or(false);

    open_before && close_after
}

/// Layer 2: replace recognized entity spans, skipping anything that is (or
/// sits inside) a placeholder. Entity offsets are char offsets; replacements
/// are applied back-to-front so earlier spans stay valid.
fn apply_entities(text: &str, entities: &[Entity], counts: &mut RedactionCounts) -> String {
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(i, _)| i)
        .chain(std::iter::once(text.len()))
        .collect();

    let mut redacted = text.to_owned();
    let mut ordered: Vec<&Entity> = entities.iter().collect();
    ordered.sort_by_key(|e| e.start);

    for entity in ordered.iter().rev() {
        let Some(placeholder) = entity_placeholder(&entity.label) else {
            continue;
        };
        if LAYER1_PLACEHOLDERS.contains(&entity.text.as_str()) {
            continue;
        }
        let (Some(&start), Some(&end)) =
            (char_to_byte.get(entity.start), char_to_byte.get(entity.end))
        else {
            continue;
        };
        if start >= end || end > redacted.len() {
            continue;
        }
        if inside_brackets(&redacted, start, end) {
            continue;
        }

        redacted.replace_range(start..end, placeholder);
        *counts.entry(entity.label.clone()).or_insert(0) += 1;
    }

    redacted
}

/// Final pass: strip HTML, lowercase, and reduce everything that is not
/// alphanumeric to whitespace. Placeholders fold into plain tokens here
/// (`[EMAIL]` comes out as `email`).
pub fn normalize_redacted(text: &str) -> String {
    use once_cell::sync::Lazy;

    static SCRIPT_STYLE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"(?is)<(script|style)\b[^>]*>.*?</(script|style)>").unwrap());
    static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());

    let text = SCRIPT_STYLE.replace_all(text, " ");
    let text = TAGS.replace_all(&text, " ");

    collapse_whitespace(&normalize_plain(&text))
}

fn normalize_plain(text: &str) -> String {
    text.to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect()
}

fn collapse_whitespace(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut pending_space = false;
    for c in text.chars() {
        if c.is_whitespace() {
            pending_space = !out.is_empty();
        } else {
            if pending_space {
                out.push(' ');
                pending_space = false;
            }
            out.push(c);
        }
    }
    out
}

/// Run the full pipeline over a batch of subject/body pairs.
///
/// Subjects and bodies go through the recognizer as two batches, mirroring
/// the per-column batching of the layers themselves.
pub async fn strip_pii(
    emails: Vec<EmailText>,
    recognizer: &dyn EntityRecognizer,
) -> Result<(Vec<EmailText>, RedactionCounts), InferenceError> {
    let mut counts = RedactionCounts::new();

    // Layer 1: regex PII.
    let mut emails: Vec<EmailText> = emails
        .into_iter()
        .map(|email| {
            let (subject, subject_counts) = redact_pii(&email.subject);
            merge_counts(&mut counts, subject_counts);
            let (body, body_counts) = redact_pii(&email.body);
            merge_counts(&mut counts, body_counts);
            EmailText { subject, body }
        })
        .collect();

    // Layer 2: NER.
    let subjects: Vec<String> = emails.iter().map(|e| e.subject.clone()).collect();
    let subject_entities = recognizer.recognize(&subjects).await?;
    for (email, entities) in emails.iter_mut().zip(subject_entities.iter()) {
        email.subject = apply_entities(&email.subject, entities, &mut counts);
    }

    let bodies: Vec<String> = emails.iter().map(|e| e.body.clone()).collect();
    let body_entities = recognizer.recognize(&bodies).await?;
    for (email, entities) in emails.iter_mut().zip(body_entities.iter()) {
        email.body = apply_entities(&email.body, entities, &mut counts);
    }

    // Layers 3-5, then normalization.
    let emails = emails
        .into_iter()
        .map(|email| {
            let mut email = email;
            for text in [&mut email.subject, &mut email.body] {
                let (redacted, key_counts) = redact_keys(text);
                merge_counts(&mut counts, key_counts);
                let (redacted, number_counts) = redact_money_and_numbers(&redacted);
                merge_counts(&mut counts, number_counts);
                let (redacted, token_count) = redact_mixed_tokens(&redacted);
                *counts.entry("TOKEN".to_owned()).or_insert(0) += token_count;
                *text = normalize_redacted(&redacted);
            }
            email
        })
        .collect();

    Ok((emails, counts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::mock::MockEntityRecognizer;

    fn email(subject: &str, body: &str) -> EmailText {
        EmailText {
            subject: subject.to_owned(),
            body: body.to_owned(),
        }
    }

    #[test]
    fn test_inside_brackets() {
        let text = "call [PERSON] at noon";
        let start = text.find("PERSON").unwrap();
        assert!(inside_brackets(text, start, start + "PERSON".len()));
        assert!(!inside_brackets(text, 0, 4));

        // A closed pair before the span does not enclose it.
        let text = "[EMAIL] sent to bob";
        let start = text.find("bob").unwrap();
        assert!(!inside_brackets(text, start, start + 3));
    }

    #[test]
    fn test_apply_entities_replaces_and_counts() {
        let mut counts = RedactionCounts::new();
        let entities = vec![
            Entity {
                label: "PERSON".to_owned(),
                start: 0,
                end: 10,
                text: "Jane Astor".to_owned(),
            },
            Entity {
                label: "ORG".to_owned(),
                start: 18,
                end: 25,
                text: "Initech".to_owned(),
            },
        ];
        let out = apply_entities("Jane Astor joined Initech", &entities, &mut counts);
        assert!(out.contains("[PERSON]"));
        assert!(out.contains("[ORG]"));
        assert_eq!(counts.get("PERSON"), Some(&1));
        assert_eq!(counts.get("ORG"), Some(&1));
    }

    #[test]
    fn test_apply_entities_skips_placeholders() {
        let mut counts = RedactionCounts::new();
        let entities = vec![Entity {
            label: "ORG".to_owned(),
            start: 8,
            end: 15,
            text: "[EMAIL]".to_owned(),
        }];
        let text = "mail to [EMAIL] today";
        assert_eq!(apply_entities(text, &entities, &mut counts), text);
        assert!(counts.is_empty());
    }

    #[test]
    fn test_normalize_flattens_placeholders() {
        let normalized = normalize_redacted("Please Wire [MONEY] to ACCT!  <b>Now</b>");
        assert_eq!(normalized, "please wire money to acct now");
    }

    #[tokio::test]
    async fn test_strip_pii_end_to_end() {
        let recognizer = MockEntityRecognizer::default();
        let emails = vec![email(
            "Offer from recruiting",
            "Contact jane.doe@example.com or visit https://jobs.example.com. Salary $120K.",
        )];

        let (redacted, counts) = strip_pii(emails, &recognizer).await.unwrap();
        let body = &redacted[0].body;
        assert!(!body.contains("jane.doe"));
        assert!(!body.contains("jobs.example.com"));
        assert!(!body.contains("120"));
        assert_eq!(body, "contact email or visit url salary money");
        assert_eq!(counts.get("EMAIL"), Some(&1));
        assert_eq!(counts.get("URL"), Some(&1));
        assert_eq!(counts.get("MONEY"), Some(&1));
    }

    #[tokio::test]
    async fn test_strip_pii_is_idempotent() {
        let recognizer = MockEntityRecognizer::default();
        let emails = vec![email(
            "Re: application",
            "SSN 123-45-6789, card 4111 1111 1111 1111, 40% raise to $90,000 on May 5th, 2024.",
        )];

        let (first, _) = strip_pii(emails, &recognizer).await.unwrap();
        let (second, counts) = strip_pii(first.clone(), &recognizer).await.unwrap();

        assert_eq!(first, second);
        assert!(!first[0].body.contains('['), "no brackets survive: {}", first[0].body);
        // Redacted tokens must not be re-counted on the second pass.
        assert_eq!(counts.values().sum::<usize>(), 0);
    }

    #[tokio::test]
    async fn test_strip_pii_empty_batch_and_empty_body() {
        let recognizer = MockEntityRecognizer::default();

        let (out, counts) = strip_pii(Vec::new(), &recognizer).await.unwrap();
        assert!(out.is_empty());
        assert!(counts.values().all(|v| *v == 0));

        let (out, _) = strip_pii(vec![email("", "")], &recognizer).await.unwrap();
        assert_eq!(out[0], email("", ""));
    }
}
