//! Normalizes free-form backend replies into an [`Answer`].
//!
//! Strategies are tried in order and the first hit wins:
//! whole-text JSON, fenced JSON block, first balanced JSON object,
//! `answer:`/`reason:` lines, a "final answer" marker, a bare token,
//! and finally the raw text itself.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

use crate::models::answer::Answer;

/// Longest fallback answer kept when nothing structured is found.
const MAX_FALLBACK_CHARS: usize = 500;

static RX_FENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)```json\s*(\{[\s\S]*?\})\s*```").expect("valid fence regex"));

static RX_ANSWER_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:answer|jawaban)\s*[:：]\s*(.+)$").expect("valid answer-line regex")
});

static RX_REASON_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?im)^\s*(?:reason|penjelasan)\s*[:：]\s*(.+)$").expect("valid reason-line regex")
});

static RX_FINAL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)\b(?:final|jawaban|answer)\b[:：]?\s*([a-z]|[1-9][0-9]?|true|false|ya|tidak|benar|salah)\b",
    )
    .expect("valid final-answer regex")
});

static RX_BOOL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)\b(true|false|ya|tidak|benar|salah)\b").expect("valid boolean regex")
});

static RX_LETTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\b[a-z]\b").expect("valid letter regex"));

static RX_NUMBER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\b[1-9][0-9]?\b").expect("valid number regex"));

/// Parse a backend reply. Never fails; unstructured prose still yields a best-effort answer.
pub fn parse_answer(content: &str) -> Answer {
    let mut answer = Answer {
        raw: content.trim().to_string(),
        ..Default::default()
    };

    let structured = fill_from_json(content, &mut answer)
        || extract_fenced_json(content).is_some_and(|block| fill_from_json(block, &mut answer))
        || extract_first_json_object(content).is_some_and(|obj| fill_from_json(obj, &mut answer));

    if !structured {
        if let Some((text, reason)) = parse_labelled_lines(content) {
            answer.answer = text;
            answer.reason = reason;
        } else if let Some(token) = parse_short_token(content) {
            answer.answer = token;
        } else {
            answer.answer = truncate_single_line(&answer.raw, MAX_FALLBACK_CHARS);
        }
    }

    answer.answer = answer.answer.trim().to_string();
    answer
}

/// Apply a JSON object to `out`. Succeeds only if it carries a non-empty `answer`.
fn fill_from_json(text: &str, out: &mut Answer) -> bool {
    let Ok(object) = serde_json::from_str::<Map<String, Value>>(text.trim()) else {
        return false;
    };

    let Some(answer) = object.get("answer").and_then(coerce_to_string) else {
        return false;
    };
    if answer.trim().is_empty() {
        return false;
    }

    out.answer = answer;
    out.reason = object
        .get("reason")
        .and_then(coerce_to_string)
        .filter(|reason| !reason.trim().is_empty());
    out.options = match object.get("options") {
        Some(Value::Array(items)) => items.iter().filter_map(coerce_to_string).collect(),
        _ => Vec::new(),
    };
    out.confidence = object
        .get("confidence")
        .and_then(coerce_to_f64)
        .map(|c| c.clamp(0.0, 1.0));
    true
}

fn coerce_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Bool(true) => Some("True".to_string()),
        Value::Bool(false) => Some("False".to_string()),
        Value::Number(n) => Some(format_number(n)),
        other => Some(other.to_string()),
    }
}

fn format_number(n: &serde_json::Number) -> String {
    if n.is_i64() || n.is_u64() {
        return n.to_string();
    }
    match n.as_f64() {
        Some(f) if f.fract() == 0.0 && f.abs() < i64::MAX as f64 => format!("{}", f as i64),
        Some(f) => {
            let fixed = format!("{f:.6}");
            fixed.trim_end_matches('0').trim_end_matches('.').to_string()
        }
        None => n.to_string(),
    }
}

fn coerce_to_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn extract_fenced_json(text: &str) -> Option<&str> {
    RX_FENCE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
}

/// First `{ ... }` span with balanced braces.
fn extract_first_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    for (offset, byte) in text.as_bytes()[start..].iter().enumerate() {
        match byte {
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_labelled_lines(text: &str) -> Option<(String, Option<String>)> {
    let answer = RX_ANSWER_LINE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|a| !a.is_empty())?;
    let reason = RX_REASON_LINE
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
        .filter(|r| !r.is_empty());
    Some((answer, reason))
}

fn parse_short_token(text: &str) -> Option<String> {
    if let Some(token) = RX_FINAL.captures(text).and_then(|caps| caps.get(1)) {
        return Some(normalize_token(token.as_str()));
    }
    if let Some(word) = RX_BOOL.find(text) {
        return Some(normalize_token(word.as_str()));
    }
    if let Some(letter) = first_bare_letter(text) {
        return Some(letter.to_ascii_uppercase());
    }
    RX_NUMBER.find(text).map(|m| m.as_str().to_string())
}

/// First standalone letter in either case, skipping contractions and the
/// pronoun "I".
fn first_bare_letter(text: &str) -> Option<&str> {
    RX_LETTER
        .find_iter(text)
        .find(|m| {
            let before = text[..m.start()].chars().next_back();
            let after = text[m.end()..].chars().next();
            if matches!(before, Some('\'' | '’')) || matches!(after, Some('\'' | '’')) {
                return false;
            }
            !(m.as_str().eq_ignore_ascii_case("i") && starts_lowercase_word(&text[m.end()..]))
        })
        .map(|m| m.as_str())
}

fn starts_lowercase_word(rest: &str) -> bool {
    let mut chars = rest.chars();
    chars.next() == Some(' ') && chars.next().is_some_and(char::is_lowercase)
}

fn normalize_token(token: &str) -> String {
    let lowered = token.trim().to_lowercase();
    match lowered.as_str() {
        "true" | "ya" | "benar" => "True".to_string(),
        "false" | "tidak" | "salah" => "False".to_string(),
        t if t.len() == 1 && t.as_bytes()[0].is_ascii_lowercase() => t.to_uppercase(),
        t => t.to_string(),
    }
}

fn truncate_single_line(text: &str, max_chars: usize) -> String {
    let line = text.replace("\r\n", " ").replace('\n', " ");
    if line.chars().count() > max_chars {
        let cut: String = line.chars().take(max_chars).collect();
        format!("{cut}…")
    } else {
        line
    }
}
