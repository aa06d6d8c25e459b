//! Text normalization applied to decrypted fields before classification.

use once_cell::sync::Lazy;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

static TAGS: Lazy<Regex> = Lazy::new(|| Regex::new(r"<[^>]+>").unwrap());
static URLS: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)(?:https?\S+|www\S+)").unwrap());
static EMAILS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[\w.\-]+@\w[\w\-]*\.[\w.\-]+\b").unwrap());
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

/// Unescape HTML entities, strip tags, substitute URLs and addresses with
/// neutral tokens, NFKC-normalize, collapse whitespace, lowercase, trim.
pub fn normalize_field(text: &str) -> String {
    let text = htmlescape::decode_html(text).unwrap_or_else(|_| text.to_owned());
    let text = TAGS.replace_all(&text, " ");
    let text = URLS.replace_all(&text, " URL ");
    let text = EMAILS.replace_all(&text, " EMAIL_ADDRESS ");
    let text: String = text.nfkc().collect();
    let text = WHITESPACE.replace_all(&text, " ");

    text.to_lowercase().trim().to_owned()
}

/// The classifier sees one composed document per email.
pub fn compose_model_input(subject: &str, sender: &str, body: &str) -> String {
    format!("Subject: {}\nFrom: {}\nBody: {}", subject, sender, body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unescapes_entities_and_strips_tags() {
        assert_eq!(
            normalize_field("We&#39;re <b>excited</b> to move forward"),
            "we're excited to move forward"
        );
    }

    #[test]
    fn test_substitutes_urls_and_emails() {
        assert_eq!(
            normalize_field("Apply at https://jobs.example.com today"),
            "apply at url today"
        );
        assert_eq!(
            normalize_field("Reply to recruiting@initech.example please"),
            "reply to email_address please"
        );
    }

    #[test]
    fn test_nfkc_and_whitespace() {
        // The ligature ﬁ decomposes to "fi" under NFKC.
        assert_eq!(normalize_field("con\u{fb01}rmed   \n\t position"), "confirmed position");
    }

    #[test]
    fn test_empty_input() {
        assert_eq!(normalize_field(""), "");
    }

    #[test]
    fn test_compose_model_input() {
        assert_eq!(
            compose_model_input("application received", "jobs@x", "thanks for applying"),
            "Subject: application received\nFrom: jobs@x\nBody: thanks for applying"
        );
    }
}
