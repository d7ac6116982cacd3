use super::Deadline;
use crate::error::ExtractError;

/// Characters peeled off both ends of every token before classification.
const STRIP_CHARS: &[char] = &['.', ',', ';', ':', '(', ')', '[', ']', '"'];

/// Confidence threshold used when the caller does not supply one.
pub const DEFAULT_THRESHOLD: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub text: String,
    pub confidence: Option<f64>,
}

impl Token {
    pub fn scored(text: impl Into<String>, confidence: f64) -> Self {
        Token {
            text: text.into(),
            confidence: Some(confidence),
        }
    }

    pub fn plain(text: impl Into<String>) -> Self {
        Token {
            text: text.into(),
            confidence: None,
        }
    }

    /// Tokens without a native score count as fully confident.
    pub fn effective_confidence(&self) -> f64 {
        self.confidence.unwrap_or(1.0)
    }
}

/// Whitespace-split a generated block of text into confidence-less tokens.
pub fn tokens_from_generated(text: &str) -> Vec<Token> {
    text.split_whitespace().map(Token::plain).collect()
}

pub fn tokens_from_scored(pairs: &[(String, f64)]) -> Vec<Token> {
    pairs
        .iter()
        .map(|(text, score)| Token::scored(text.clone(), *score))
        .collect()
}

/// A cleaned token (or merged all-caps run) in recognition order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub text: String,
    pub eligible: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NormalizedStream {
    candidates: Vec<Candidate>,
    full_text: String,
    confidence: f64,
}

impl NormalizedStream {
    pub fn candidates(&self) -> &[Candidate] {
        &self.candidates
    }

    pub fn eligible(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| c.eligible)
    }

    /// Every original token joined by single spaces, threshold ignored.
    pub fn full_text(&self) -> &str {
        &self.full_text
    }

    /// Highest confidence seen on any token, eligible or not.
    pub fn confidence(&self) -> f64 {
        self.confidence
    }
}

pub fn clean_token(text: &str) -> &str {
    text.trim().trim_matches(STRIP_CHARS).trim()
}

/// Fully alphabetic with no lower-case letters (and at least one upper-case one).
pub fn is_caps_word(text: &str) -> bool {
    !text.is_empty()
        && text.chars().all(char::is_alphabetic)
        && text.chars().any(char::is_uppercase)
        && !text.chars().any(char::is_lowercase)
}

/// Clean tokens and collapse consecutive all-caps words into one phrase.
///
/// Runs are built from eligible tokens only: a low-confidence token inside a
/// caps phrase does not split it. It is still kept in the sequence, after the
/// merged phrase, as an ineligible candidate. Eligible tokens that clean down
/// to nothing are dropped but still end a pending run.
pub fn normalize(
    tokens: &[Token],
    threshold: f64,
    deadline: &Deadline,
) -> Result<NormalizedStream, ExtractError> {
    let mut candidates = Vec::with_capacity(tokens.len());
    let mut run = CapsRun::default();
    let mut confidence: f64 = 0.0;
    let mut full_parts = Vec::with_capacity(tokens.len());

    for token in tokens {
        deadline.check()?;

        let raw = token.text.trim();
        if !raw.is_empty() {
            full_parts.push(raw);
        }
        confidence = confidence.max(token.effective_confidence());

        let eligible = token.effective_confidence() >= threshold;
        let clean = clean_token(&token.text);

        if !eligible {
            if !clean.is_empty() {
                candidates.push(Candidate {
                    text: clean.to_string(),
                    eligible: false,
                });
            }
            continue;
        }

        if is_caps_word(clean) {
            run.push(clean, candidates.len());
            continue;
        }

        run.flush(&mut candidates);
        if !clean.is_empty() {
            candidates.push(Candidate {
                text: clean.to_string(),
                eligible: true,
            });
        }
    }
    run.flush(&mut candidates);

    Ok(NormalizedStream {
        candidates,
        full_text: full_parts.join(" "),
        confidence,
    })
}

/// Pending all-caps words and the slot where the merged phrase belongs.
#[derive(Default)]
struct CapsRun<'a> {
    words: Vec<&'a str>,
    at: usize,
}

impl<'a> CapsRun<'a> {
    fn push(&mut self, word: &'a str, next_slot: usize) {
        if self.words.is_empty() {
            self.at = next_slot;
        }
        self.words.push(word);
    }

    fn flush(&mut self, out: &mut Vec<Candidate>) {
        if self.words.is_empty() {
            return;
        }
        out.insert(
            self.at,
            Candidate {
                text: self.words.join(" "),
                eligible: true,
            },
        );
        self.words.clear();
    }
}
