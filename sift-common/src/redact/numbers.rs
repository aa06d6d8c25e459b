//! Layers 4 and 5: money, numbers, and the final mixed-token sweep.

use once_cell::sync::Lazy;
use regex::Regex;

use super::{inside_brackets, replace_matches, RedactionCounts};

static MONEY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(?:USD|EUR|GBP|\$|€|£)\s*\d[\d,]*(?:\.\d+)?(?:K|M|B)?").unwrap()
});

static QUANTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\b\d+(?:\.\d+)?[KMB]\b").unwrap());

static PERCENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?%").unwrap());

static PLAIN_NUMBER: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b\d+(?:\.\d+)?\b").unwrap());

static MIXED_TOKEN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[A-Za-z0-9][A-Za-z0-9\-_./]*[A-Za-z0-9]\b").unwrap());

static ORDINAL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^\d+(?:st|nd|rd|th)$").unwrap());

/// Layer 4: money first, then quantity-suffixed numbers (`100K` becomes
/// `[NUM]K`), percentage operands, and finally any remaining plain number.
/// Ordinals and bracketed content are preserved.
pub fn redact_money_and_numbers(text: &str) -> (String, RedactionCounts) {
    let mut counts = RedactionCounts::new();

    let (redacted, money_count) =
        replace_matches(text, &MONEY, None, "[MONEY]", |_, start, end, full| {
            !inside_brackets(full, start, end)
        });
    if money_count > 0 {
        *counts.entry("MONEY".to_owned()).or_insert(0) += money_count;
    }

    // Quantity suffixes keep their scale letter, so the placeholder varies
    // per match and replace_matches cannot be used directly.
    let mut out = String::with_capacity(redacted.len());
    let mut last = 0;
    let mut num_count = 0;
    for m in QUANTITY.find_iter(&redacted) {
        if inside_brackets(&redacted, m.start(), m.end()) {
            continue;
        }
        let suffix = m.as_str().chars().next_back().expect("match is non-empty");
        out.push_str(&redacted[last..m.start()]);
        out.push_str("[NUM]");
        out.push(suffix);
        last = m.end();
        num_count += 1;
    }
    out.push_str(&redacted[last..]);
    let redacted = out;

    let (redacted, percent_count) =
        replace_matches(&redacted, &PERCENT, None, "[NUM]%", |_, start, end, full| {
            !inside_brackets(full, start, end)
        });
    num_count += percent_count;

    let (redacted, plain_count) = replace_matches(
        &redacted,
        &PLAIN_NUMBER,
        None,
        "[NUM]",
        |token, start, end, full| {
            !ORDINAL.is_match(token) && !inside_brackets(full, start, end)
        },
    );
    num_count += plain_count;

    if num_count > 0 {
        *counts.entry("NUM".to_owned()).or_insert(0) += num_count;
    }

    (redacted, counts)
}

/// Layer 5: any word containing both letters and digits becomes `[TOKEN]`,
/// except ordinals and bracketed content.
pub fn redact_mixed_tokens(text: &str) -> (String, usize) {
    replace_matches(
        text,
        &MIXED_TOKEN,
        None,
        "[TOKEN]",
        |token, start, end, full| {
            token.chars().any(|c| c.is_ascii_alphabetic())
                && token.chars().any(|c| c.is_ascii_digit())
                && !ORDINAL.is_match(token)
                && !inside_brackets(full, start, end)
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn money_nums(text: &str) -> String {
        redact_money_and_numbers(text).0
    }

    fn tokens(text: &str) -> String {
        redact_mixed_tokens(text).0
    }

    #[test]
    fn test_money() {
        assert_eq!(money_nums("base of $120,000 plus bonus"), "base of [MONEY] plus bonus");
        assert_eq!(money_nums("about €95K total"), "about [MONEY] total");
        assert_eq!(money_nums("USD 85000 per year"), "[MONEY] per year");
    }

    #[test]
    fn test_quantity_suffix_keeps_scale() {
        assert_eq!(money_nums("over 100K applicants"), "over [NUM]K applicants");
        assert_eq!(money_nums("raised 1.5M already"), "raised [NUM]M already");
    }

    #[test]
    fn test_percent_operand() {
        assert_eq!(money_nums("a 40% raise"), "a [NUM]% raise");
    }

    #[test]
    fn test_plain_numbers_and_ordinals() {
        assert_eq!(money_nums("room 204 on floor 3"), "room [NUM] on floor [NUM]");
        assert_eq!(money_nums("the 1st and 22nd of the month"), "the 1st and 22nd of the month");
        assert_eq!(money_nums("keep [2023] as is"), "keep [2023] as is");
    }

    #[test]
    fn test_mixed_tokens() {
        assert_eq!(tokens("ref REQ12345 attached"), "ref [TOKEN] attached");
        assert_eq!(tokens("build v2.4.1-rc3 shipped"), "build [TOKEN] shipped");
        assert_eq!(tokens("all words, no digits"), "all words, no digits");
        assert_eq!(tokens("the 3rd floor"), "the 3rd floor");
        assert_eq!(tokens("leave [NUM]K alone"), "leave [NUM]K alone");
    }

    #[test]
    fn test_counts_aggregate() {
        let (_, counts) = redact_money_and_numbers("$5 and 10K and 40% and 7");
        assert_eq!(counts.get("MONEY"), Some(&1));
        assert_eq!(counts.get("NUM"), Some(&3));
    }
}
