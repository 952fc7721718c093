use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;

use crate::constants::{CHARS_PER_TOKEN, TOKEN_OVERHEAD_CHARS};

static NON_WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[^\w\s']").unwrap());
static APOSTROPHE_TRIM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^'+|'+$").unwrap());

/// Tokenize text into lowercase words.
/// Preserves apostrophes within words (e.g., "don't").
pub fn tokenize(text: &str) -> Vec<String> {
    let cleaned = NON_WORD.replace_all(text, " ");
    cleaned
        .to_lowercase()
        .split_whitespace()
        .map(|t| APOSTROPHE_TRIM.replace_all(t, "").to_string())
        .filter(|t| !t.is_empty())
        .collect()
}

/// Coarse token estimate for a rendered `label: value` fact.
/// Four characters per token plus a fixed formatting overhead. Not exact.
pub fn estimate_tokens(label: &str, value: &str) -> i32 {
    ((label.len() + value.len() + TOKEN_OVERHEAD_CHARS) / CHARS_PER_TOKEN) as i32
}

/// Coarse topic of a query or fact, used to keep admissions on-topic.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Topic {
    Code,
    Science,
    Personal,
    /// No dominant topic. Never disagrees with anything.
    #[default]
    General,
}

const CODE_WORDS: &[&str] = &[
    "code", "function", "compile", "compiler", "bug", "rust", "python", "api", "struct",
    "variable", "debug", "crate", "thread", "mutex", "deploy", "git", "commit", "test",
];
const SCIENCE_WORDS: &[&str] = &[
    "quantum", "physics", "chemistry", "biology", "energy", "particle", "atom", "molecule",
    "experiment", "theory", "cell", "gravity", "electron", "protein", "evolution",
];
const PERSONAL_WORDS: &[&str] = &[
    "i", "me", "my", "mine", "family", "friend", "feel", "birthday", "wife", "husband",
    "mom", "dad", "home", "favorite", "prefer", "likes",
];

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Code => "code",
            Self::Science => "science",
            Self::Personal => "personal",
            Self::General => "general",
        }
    }

    /// Keyword vote over the tokenized text. Ties and zero hits are `General`.
    pub fn classify(text: &str) -> Self {
        let tokens = tokenize(text);
        let count = |words: &[&str]| {
            tokens
                .iter()
                .filter(|t| words.contains(&t.as_str()))
                .count()
        };
        let votes = [
            (Self::Code, count(CODE_WORDS)),
            (Self::Science, count(SCIENCE_WORDS)),
            (Self::Personal, count(PERSONAL_WORDS)),
        ];

        let best = votes.iter().map(|(_, n)| *n).max().unwrap_or(0);
        if best == 0 {
            return Self::General;
        }
        let mut leaders = votes.iter().filter(|(_, n)| *n == best);
        match (leaders.next(), leaders.next()) {
            (Some((topic, _)), None) => *topic,
            _ => Self::General,
        }
    }

    /// Both topics are specific and they differ.
    pub fn disagrees_with(&self, other: Topic) -> bool {
        *self != Topic::General && other != Topic::General && *self != other
    }
}
