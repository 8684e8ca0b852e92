//! Boundary codecs for the string-encoded values the legacy tables store.

use std::cmp::Ordering;
use std::fmt::{Display, Formatter};
use std::sync::OnceLock;

use md5::{Digest, Md5};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::QuestionId;

const CONTENT_KEY_PREFIX: &str = "ordering_item_";
const RESPONSE_PREFIX: &str = "response_";

/// Salted content hash that names an item inside re-encoded responses.
///
/// The ordering question type recomputes `ordering_item_<md5 hex>` from the
/// answer text to read `response_<questionid>`, so the digest must stay MD5.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(transparent)]
pub struct ContentKey(String);

impl ContentKey {
    #[must_use]
    pub fn derive(salt: &str, text: &str) -> Self {
        let mut hasher = Md5::new();
        hasher.update(salt.as_bytes());
        hasher.update(text.as_bytes());
        Self(format!(
            "{CONTENT_KEY_PREFIX}{}",
            hex::encode(hasher.finalize())
        ))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ContentKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Decodes a comma-separated id list. Blank, zero and non-numeric entries
/// are dropped.
#[must_use]
pub fn parse_id_list(raw: &str) -> Vec<i64> {
    raw.split(',')
        .filter_map(|item| item.trim().parse::<i64>().ok())
        .filter(|id| *id != 0)
        .collect()
}

#[must_use]
pub fn format_id_list<I, T>(ids: I) -> String
where
    I: IntoIterator<Item = T>,
    T: Display,
{
    ids.into_iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(",")
}

/// One `<code>-<position>` entry of a legacy state answer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
pub struct StateToken {
    pub code: i64,
    /// Zero when the item has not been placed yet.
    pub position: u32,
}

impl StateToken {
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        let (code_raw, position_raw) = raw.trim().split_once('-')?;
        if code_raw.is_empty() || !code_raw.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }
        if !position_raw.bytes().all(|byte| byte.is_ascii_digit()) {
            return None;
        }

        let code = code_raw.parse::<i64>().ok()?;
        let position = if position_raw.is_empty() {
            0
        } else {
            position_raw.parse::<u32>().ok()?
        };

        Some(Self { code, position })
    }
}

/// Decodes a legacy state answer, skipping entries that are not
/// `<digits>-<digits?>`.
#[must_use]
pub fn parse_state_tokens(raw: &str) -> Vec<StateToken> {
    raw.split(',').filter_map(StateToken::parse).collect()
}

/// Parses the decimal text of a legacy weight. Unparseable text weighs zero.
#[must_use]
pub fn parse_fraction(weight_text: &str) -> f64 {
    let trimmed = weight_text.trim();
    if let Ok(value) = trimmed.parse::<f64>() {
        return value;
    }

    // Longest numeric prefix with at most one dot, e.g. "2.5 points" or "1.2.3".
    let mut prefix_len = 0;
    let mut seen_dot = false;
    for (index, ch) in trimmed.char_indices() {
        let accepted = match ch {
            '0'..='9' => true,
            '.' if !seen_dot => {
                seen_dot = true;
                true
            }
            '-' | '+' => index == 0,
            _ => false,
        };
        if !accepted {
            break;
        }
        prefix_len = index + ch.len_utf8();
    }
    trimmed[..prefix_len].parse::<f64>().unwrap_or(0.0)
}

fn paragraph_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| match Regex::new(r"^\s*<p>\s*([^<>]*)\s*</p>\s*$") {
        Ok(value) => value,
        Err(err) => panic!("paragraph pattern must compile: {err}"),
    })
}

fn summary_annotation_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| match Regex::new(r"\s*\{[^}]*\}\s*$") {
        Ok(value) => value,
        Err(err) => panic!("summary pattern must compile: {err}"),
    })
}

/// Unwraps text that is exactly one markup-free paragraph.
#[must_use]
pub fn normalize_item_text(text: &str) -> String {
    match paragraph_pattern().captures(text) {
        Some(captures) => captures
            .get(1)
            .map_or_else(String::new, |inner| inner.as_str().to_string()),
        None => text.to_string(),
    }
}

/// Drops the trailing `{...}` list the legacy type appended to summaries.
#[must_use]
pub fn strip_summary_annotation(summary: &str) -> String {
    summary_annotation_pattern()
        .replace(summary, "")
        .into_owned()
}

/// A classified attempt step-data name.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum StepName {
    StemOrder,
    ChoiceOrder,
    CurrentResponse,
    CorrectResponse,
    Sub(u64),
    Response(QuestionId),
    /// Behaviour-owned variables such as `-finish` or `-comment`.
    Behaviour(String),
    Other(String),
}

impl StepName {
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "_stemorder" => Self::StemOrder,
            "_choiceorder" => Self::ChoiceOrder,
            "_currentresponse" => Self::CurrentResponse,
            "_correctresponse" => Self::CorrectResponse,
            _ => {
                if let Some(index) = raw.strip_prefix("sub").and_then(parse_digits) {
                    return Self::Sub(index);
                }
                if let Some(question_id) = raw.strip_prefix(RESPONSE_PREFIX).and_then(parse_digits)
                {
                    if let Ok(question_id) = i64::try_from(question_id) {
                        return Self::Response(QuestionId(question_id));
                    }
                }
                if raw.starts_with('-') && raw.len() > 1 {
                    return Self::Behaviour(raw.to_string());
                }
                Self::Other(raw.to_string())
            }
        }
    }

    #[must_use]
    pub fn response_for(question_id: QuestionId) -> String {
        format!("{RESPONSE_PREFIX}{question_id}")
    }
}

fn parse_digits(raw: &str) -> Option<u64> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    raw.parse().ok()
}

/// Sort key placing structural records first, then `subN` by number, then
/// everything else by name.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct NaturalKey {
    rank: i8,
    index: u64,
    name: String,
}

impl NaturalKey {
    #[must_use]
    pub fn of(name: &str) -> Self {
        let (rank, index) = match StepName::parse(name) {
            StepName::StemOrder | StepName::CurrentResponse => (-2, 0),
            StepName::ChoiceOrder | StepName::CorrectResponse => (-1, 0),
            StepName::Sub(index) => (0, index),
            StepName::Response(_) | StepName::Behaviour(_) | StepName::Other(_) => (1, 0),
        };

        Self {
            rank,
            index,
            name: name.to_string(),
        }
    }
}

#[must_use]
pub fn natural_cmp(lhs: &str, rhs: &str) -> Ordering {
    NaturalKey::of(lhs).cmp(&NaturalKey::of(rhs))
}
