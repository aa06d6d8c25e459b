//! Layer 1: regex PII redaction.
//!
//! Patterns run in a fixed order so that later, broader patterns never see
//! the text earlier ones already replaced. Boundary conditions the regex
//! engine cannot express (this crate has no look-around) are enforced by the
//! guards passed to `replace_matches`.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{next_char, prev_char, replace_matches, RedactionCounts};

const MONTHS: &str = "January|February|March|April|May|June|July|August|September|October|November|December|Jan|Feb|Mar|Apr|Jun|Jul|Aug|Sep|Sept|Oct|Nov|Dec";

static EMAIL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9._%+\-]+@[A-Za-z0-9.\-]+\.[A-Za-z]{2,}\b").unwrap());

static URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"(?i)\b(?:https?://[^\s<>"']+|www\.[^\s<>"']+)"#).unwrap());

static IPV4: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b(?:25[0-5]|2[0-4]\d|1?\d?\d)(?:\.(?:25[0-5]|2[0-4]\d|1?\d?\d)){3}\b").unwrap()
});

static IPV6: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[A-Fa-f0-9]{1,4}:){2,7}[A-Fa-f0-9]{1,4}\b").unwrap());

static MAC: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(?:[0-9A-Fa-f]{2}[:\-]){5}[0-9A-Fa-f]{2}\b").unwrap());

static SSN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b(\d{3})[\- ]?(\d{2})[\- ]?(\d{4})\b").unwrap());

static CREDIT_CARD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:\d[ \-]?){12,18}\d").unwrap());

static CREDIT_CARD_MASKED: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:[xX*#][ \-]?){10,15}\d{3,4}").unwrap());

static UUID: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b[0-9a-fA-F]{8}\-[0-9a-fA-F]{4}\-[0-9a-fA-F]{4}\-[0-9a-fA-F]{4}\-[0-9a-fA-F]{12}\b")
        .unwrap()
});

static DATE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:(?:{m})\s+\d{{1,2}}(?:st|nd|rd|th)?(?:,\s*\d{{2,4}})?|\d{{1,2}}(?:st|nd|rd|th)?\s+(?:{m})(?:,\s*\d{{2,4}})?|(?:0?[1-9]|1[0-2])[/\-](?:0?[1-9]|[12]\d|3[01])[/\-](?:19|20)\d{{2}}|(?:19|20)\d{{2}}[\-/](?:0[1-9]|1[0-2])[\-/](?:0[1-9]|[12]\d|3[01]))\b",
        m = MONTHS
    ))
    .unwrap()
});

static ZIP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d{5}(?:\-\d{4})?\b").unwrap());

static ADDRESS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b\d{1,5}\s+(?:[A-Za-z0-9.#']+\s+){1,4}(?:Street|St|Avenue|Ave|Road|Rd|Boulevard|Blvd|Lane|Ln|Drive|Dr|Court|Ct|Parkway|Pkwy|Circle|Cir)\b\.?",
    )
    .unwrap()
});

static HANDLE: Lazy<Regex> = Lazy::new(|| Regex::new(r"@[A-Za-z0-9_]{2,15}\b").unwrap());

fn not_word_adjacent(start: usize, end: usize, full: &str) -> bool {
    let before_ok = prev_char(full, start).map_or(true, |c| !super::is_word_char(c));
    let after_ok = next_char(full, end).map_or(true, |c| !super::is_word_char(c));
    before_ok && after_ok
}

fn valid_ssn(token: &str) -> bool {
    let digits: String = token.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 9 {
        return false;
    }
    let (area, group, serial) = (&digits[0..3], &digits[3..5], &digits[5..9]);
    area != "000" && area != "666" && !area.starts_with('9') && group != "00" && serial != "0000"
}

fn apply(
    redacted: &mut String,
    counts: &mut RedactionCounts,
    key: &str,
    re: &Regex,
    placeholder: &str,
    guard: &dyn Fn(&str, usize, usize, &str) -> bool,
) {
    let (next, count) = replace_matches(redacted, re, None, placeholder, |token, start, end, full| {
        guard(token, start, end, full)
    });
    if count > 0 {
        *counts.entry(key.to_owned()).or_insert(0) += count;
    }
    *redacted = next;
}

/// Apply the layer-1 patterns in order, returning the redacted text and how
/// many replacements each category made.
pub fn redact_pii(text: &str) -> (String, RedactionCounts) {
    let mut counts = RedactionCounts::new();
    let mut redacted = text.to_owned();

    let always: &dyn Fn(&str, usize, usize, &str) -> bool = &|_, _, _, _| true;

    apply(&mut redacted, &mut counts, "EMAIL", &EMAIL, "[EMAIL]", always);
    apply(&mut redacted, &mut counts, "URL", &URL, "[URL]", always);
    apply(&mut redacted, &mut counts, "IPV4", &IPV4, "[IPV4]", always);
    apply(&mut redacted, &mut counts, "IPV6", &IPV6, "[IPV6]", always);
    apply(&mut redacted, &mut counts, "MAC", &MAC, "[MAC]", always);
    apply(
        &mut redacted,
        &mut counts,
        "SSN",
        &SSN,
        "[SSN]",
        &|token, _, _, _| valid_ssn(token),
    );
    apply(
        &mut redacted,
        &mut counts,
        "CREDIT_CARD",
        &CREDIT_CARD,
        "[CREDIT_CARD]",
        &|_, start, end, full| {
            // Emulate (?<!\d) ... (?!\d)
            prev_char(full, start).map_or(true, |c| !c.is_ascii_digit())
                && next_char(full, end).map_or(true, |c| !c.is_ascii_digit())
        },
    );
    apply(
        &mut redacted,
        &mut counts,
        "CREDIT_CARD",
        &CREDIT_CARD_MASKED,
        "[CREDIT_CARD]",
        &|_, start, end, full| not_word_adjacent(start, end, full),
    );
    apply(&mut redacted, &mut counts, "UUID", &UUID, "[UUID]", always);
    apply(&mut redacted, &mut counts, "DATE", &DATE, "[DATE]", always);
    apply(&mut redacted, &mut counts, "ZIP", &ZIP, "[ZIP]", always);
    apply(&mut redacted, &mut counts, "ADDRESS", &ADDRESS, "[ADDRESS]", always);
    apply(
        &mut redacted,
        &mut counts,
        "HANDLE",
        &HANDLE,
        "[HANDLE]",
        &|_, start, _, full| prev_char(full, start).map_or(true, |c| !super::is_word_char(c)),
    );

    (redacted, counts)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn redact(text: &str) -> String {
        redact_pii(text).0
    }

    #[test]
    fn test_email_and_url() {
        assert_eq!(redact("mail me at a.b@c.io now"), "mail me at [EMAIL] now");
        assert_eq!(redact("see https://x.dev/careers?id=1"), "see [URL]");
        assert_eq!(redact("see www.example.com"), "see [URL]");
    }

    #[test]
    fn test_network_identifiers() {
        assert_eq!(redact("host 192.168.1.250 down"), "host [IPV4] down");
        assert_eq!(redact("via fe80:0:0:0:0:0:0:1"), "via [IPV6]");
        // Colon-separated MACs are claimed by the broader IPV6 pattern first.
        assert_eq!(redact("nic 00-1b-44-11-3a-b7 ok"), "nic [MAC] ok");
    }

    #[test]
    fn test_ssn_validity() {
        assert_eq!(redact("ssn 123-45-6789"), "ssn [SSN]");
        assert_eq!(redact("ssn 123 45 6789"), "ssn [SSN]");
        // Invalid area/group/serial numbers are left for later layers.
        assert_eq!(redact("ref 000-12-3456"), "ref 000-12-3456");
        assert_eq!(redact("ref 666-12-3456"), "ref 666-12-3456");
        assert_eq!(redact("ref 900-12-3456"), "ref 900-12-3456");
        assert_eq!(redact("ref 123-00-4567"), "ref 123-00-4567");
        assert_eq!(redact("ref 123-45-0000"), "ref 123-45-0000");
    }

    #[test]
    fn test_credit_cards() {
        assert_eq!(redact("card 4111 1111 1111 1111 ok"), "card [CREDIT_CARD] ok");
        assert_eq!(redact("card 4111111111111111 ok"), "card [CREDIT_CARD] ok");
        assert_eq!(redact("masked ****-****-****-1234 ok"), "masked [CREDIT_CARD] ok");
    }

    #[test]
    fn test_dates() {
        assert_eq!(redact("due May 5th, 2024"), "due [DATE]");
        assert_eq!(redact("due 5th May, 2024"), "due [DATE]");
        assert_eq!(redact("on 12/31/2023"), "on [DATE]");
        assert_eq!(redact("on 2023-12-31"), "on [DATE]");
    }

    #[test]
    fn test_zip_address_handle() {
        assert_eq!(redact("zip 94103-1234"), "zip [ZIP]");
        assert_eq!(
            redact("at 123 Mission Street today"),
            "at [ADDRESS] today"
        );
        assert_eq!(redact("ping @some_handle please"), "ping [HANDLE] please");
        // '@' glued to a word is an email-ish remnant, not a handle.
        assert_eq!(redact("not_a@handle"), "not_a@handle");
    }

    #[test]
    fn test_uuid() {
        assert_eq!(
            redact("id 123e4567-e89b-12d3-a456-426614174000"),
            "id [UUID]"
        );
    }

    #[test]
    fn test_order_email_before_handle() {
        // The address must be consumed whole by EMAIL, not split by HANDLE.
        assert_eq!(redact("jane@corp.example.com"), "[EMAIL]");
    }

    #[test]
    fn test_counts() {
        let (_, counts) = redact_pii("a@b.co and c@d.org at 94103");
        assert_eq!(counts.get("EMAIL"), Some(&2));
        assert_eq!(counts.get("ZIP"), Some(&1));
        assert_eq!(counts.get("SSN"), None);
    }
}
