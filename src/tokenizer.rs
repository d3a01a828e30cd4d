//! Free-text parameter blocks (`prompt\nNegative prompt: ...\nSteps: 20, ...`).

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::constants::tokenizer::{CIVITAI_RESOURCES_KEY, NEGATIVE_PROMPT_MARKER, STEPS_MARKER};
use crate::types::{ParamKey, ParamValue};

/// Ordered key/value fields from a parameter section.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParameterTokens {
    /// Lower-cased keys mapped to trimmed values, in encounter order.
    pub fields: IndexMap<ParamKey, ParamValue>,
    /// Verbatim value of the `civitai resources` field, when present.
    pub raw_resources: Option<String>,
}

/// A free-text block split into prompts and parameter fields.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreeTextParts {
    /// Text before the negative-prompt marker (or before `Steps:`).
    pub positive: String,
    /// Text between the negative-prompt marker and `Steps:`.
    pub negative: String,
    /// Tokenized parameter section.
    pub parameters: ParameterTokens,
}

/// Split a free-text block into positive prompt, negative prompt and parameters.
///
/// Markers are matched case-insensitively. Without either marker the whole
/// text is the positive prompt.
pub fn split_free_text(text: &str) -> FreeTextParts {
    if text.trim().is_empty() {
        return FreeTextParts::default();
    }

    let (positive, remainder) = match find_marker(text, NEGATIVE_PROMPT_MARKER, false) {
        Some(idx) => (&text[..idx], &text[idx + NEGATIVE_PROMPT_MARKER.len()..]),
        None => match find_marker(text, STEPS_MARKER, true) {
            Some(idx) => (&text[..idx], &text[idx..]),
            None => (text, ""),
        },
    };

    let (negative, section) = match find_marker(remainder, STEPS_MARKER, true) {
        Some(idx) => (&remainder[..idx], &remainder[idx..]),
        None => (remainder, ""),
    };

    FreeTextParts {
        positive: positive.trim().to_string(),
        negative: negative.trim().to_string(),
        parameters: tokenize_parameters(section),
    }
}

/// Tokenize a `Key: Value, Key: Value` section.
///
/// Commas separate fields only outside double quotes and outside `[]`/`{}`
/// nesting, so embedded JSON arrays survive intact. Fields without a colon
/// are dropped.
pub fn tokenize_parameters(section: &str) -> ParameterTokens {
    let mut tokens = ParameterTokens::default();
    let mut buffer = String::new();
    let mut depth: Vec<char> = Vec::new();
    let mut in_quote = false;
    let mut escaped = false;

    for ch in section.chars() {
        if in_quote {
            buffer.push(ch);
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_quote = false;
            }
            continue;
        }
        match ch {
            '"' => {
                in_quote = true;
                buffer.push(ch);
            }
            '[' | '{' => {
                depth.push(ch);
                buffer.push(ch);
            }
            ']' | '}' => {
                depth.pop();
                buffer.push(ch);
            }
            ',' if depth.is_empty() => {
                commit_field(&mut tokens, &buffer);
                buffer.clear();
            }
            _ => buffer.push(ch),
        }
    }
    commit_field(&mut tokens, &buffer);
    tokens
}

fn commit_field(tokens: &mut ParameterTokens, field: &str) {
    let field = field.trim();
    let Some((key, value)) = field.split_once(':') else {
        return;
    };
    let key = key.trim().to_lowercase();
    if key.is_empty() {
        return;
    }
    let value = value.trim().to_string();
    if key == CIVITAI_RESOURCES_KEY {
        tokens.raw_resources = Some(value.clone());
    }
    tokens.fields.insert(key, value);
}

/// Byte offset of the first case-insensitive `marker` occurrence.
///
/// With `word_start`, the match must not directly follow a word character.
/// `marker` must be lower-case ASCII.
pub(crate) fn find_marker(haystack: &str, marker: &str, word_start: bool) -> Option<usize> {
    let lowered = haystack.to_ascii_lowercase();
    lowered.match_indices(marker).map(|(idx, _)| idx).find(|idx| {
        !word_start
            || haystack[..*idx]
                .chars()
                .next_back()
                .is_none_or(|prev| !(prev.is_alphanumeric() || prev == '_'))
    })
}

/// Returns `true` when `text` contains `marker` case-insensitively.
pub(crate) fn contains_marker(text: &str, marker: &str) -> bool {
    find_marker(text, marker, false).is_some()
}
