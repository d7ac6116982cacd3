use std::sync::LazyLock;

use regex::Regex;

use super::normalize::NormalizedStream;
use super::Deadline;
use crate::error::ExtractError;

static STREET_NUMBER_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^\d{1,5}[A-Z]?$").unwrap());
static UNIT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Apt|Unit|#|Suite)\s*(\d+[A-Z]?)").unwrap());
static STREET_TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(Street|St|Avenue|Ave|Road|Rd|Drive|Dr|Lane|Ln|Court|Ct|Boulevard|Blvd|Way|Place|Pl|Circle|Cir|Close|Terrace|Ter|Trail|Trl|Park|Parkway|Pkwy)",
    )
    .unwrap()
});
static TITLE_CASE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z][a-z]{2,}$").unwrap());
static ALL_CAPS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z]{3,}$").unwrap());
static CAPS_PHRASE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[A-Z][A-Z\s]+[A-Z]$").unwrap());

/// Label boilerplate that looks like a proper noun but never names a street.
const STOP_WORDS: &[&str] = &[
    "the", "dear", "customer", "proof", "delivery", "tracking", "number", "weight", "service",
    "shipped", "billed", "delivered", "left", "reference", "please", "print", "sincerely", "front",
    "door",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressFields {
    pub street_number: Option<String>,
    pub street_name: Option<String>,
    pub unit_number: Option<String>,
}

impl AddressFields {
    pub fn is_empty(&self) -> bool {
        self.street_number.is_none() && self.street_name.is_none() && self.unit_number.is_none()
    }
}

/// 1-5 digits with an optional letter; surrounding whitespace ignored.
pub fn classify_street_number(text: &str) -> Option<String> {
    let text = text.trim();
    STREET_NUMBER_RE.is_match(text).then(|| text.to_string())
}

/// First unit designator plus number anywhere in `text`, e.g. "Apt 5B".
pub fn classify_unit_number(text: &str) -> Option<String> {
    UNIT_RE.find(text).map(|m| m.as_str().to_string())
}

/// Keep a token that carries a street type, or that is shaped like a proper
/// noun and is not label boilerplate.
pub fn classify_street_name_fragment(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    if STREET_TYPE_RE.is_match(text) {
        return Some(text.to_string());
    }

    let proper_noun = TITLE_CASE_RE.is_match(text)
        || ALL_CAPS_RE.is_match(text)
        || CAPS_PHRASE_RE.is_match(text);
    if proper_noun && !is_stop_word(text) {
        return Some(text.to_string());
    }

    None
}

fn is_stop_word(text: &str) -> bool {
    let lower = text.to_lowercase();
    STOP_WORDS.contains(&lower.as_str())
}

fn is_suffix_letter(text: &str) -> bool {
    let mut chars = text.chars();
    matches!((chars.next(), chars.next()), (Some(c), None) if c.is_alphabetic())
}

/// Run the three field classifiers over a normalized stream.
///
/// The fields are independent: street number and street name look at eligible
/// candidates only, the unit search runs over the full text so a designator and
/// its number split across tokens still match.
pub fn classify(stream: &NormalizedStream, deadline: &Deadline) -> Result<AddressFields, ExtractError> {
    let candidates = stream.candidates();
    let mut street_number: Option<String> = None;
    let mut fragments: Vec<String> = Vec::new();

    for (i, candidate) in candidates.iter().enumerate() {
        deadline.check()?;
        if !candidate.eligible {
            continue;
        }

        if street_number.is_none() {
            if let Some(mut number) = classify_street_number(&candidate.text) {
                // detached suffix: "17" "a" -> "17a"
                if let Some(next) = candidates.get(i + 1) {
                    if is_suffix_letter(&next.text) {
                        number.push_str(&next.text);
                    }
                }
                street_number = Some(number);
            }
        }

        if let Some(fragment) = classify_street_name_fragment(&candidate.text) {
            fragments.push(fragment);
        }
    }

    deadline.check()?;
    let unit_number = classify_unit_number(stream.full_text());
    let street_name = if fragments.is_empty() {
        None
    } else {
        Some(fragments.join(" "))
    };

    Ok(AddressFields {
        street_number,
        street_name,
        unit_number,
    })
}

// ── Tests ──
