//! Recovery of JSON documents from free-text model output.
//!
//! Models wrap JSON in code fences, leave trailing commas, or chat before and
//! after the object. [`parse_with_fallback`] tries the raw text first and then
//! applies three repairs in a fixed order, reporting which one succeeded.

use crate::core::error::DramaError;
use anyhow::Result;
use regex::Regex;
use serde::de::DeserializeOwned;
use std::sync::LazyLock;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid regex"));
static OUTERMOST_OBJECT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("valid regex"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repair {
    StrippedCodeFence,
    DroppedTrailingCommas,
    ExtractedObject,
}

#[derive(Debug)]
pub enum ParseOutcome<T> {
    Ok(T),
    RepairedOk(T, Repair),
    Err(String),
}

impl<T> ParseOutcome<T> {
    pub fn into_result(self, stage: &'static str) -> Result<T> {
        match self {
            ParseOutcome::Ok(v) | ParseOutcome::RepairedOk(v, _) => Ok(v),
            ParseOutcome::Err(message) => Err(DramaError::Parse { stage, message }.into()),
        }
    }
}

pub fn strip_code_blocks(s: &str) -> String {
    let s = s.trim();
    let Some(start) = s.find("```") else {
        return s.to_string();
    };
    let after_fence = &s[start + 3..];
    // Skip the info string ("json", "JSON", ...) up to the first newline.
    let body_start = after_fence
        .find('\n')
        .filter(|&i| after_fence[..i].chars().all(|c| c.is_ascii_alphanumeric() || c.is_whitespace()))
        .map(|i| i + 1)
        .unwrap_or(0);
    let body = &after_fence[body_start..];
    let body = match body.rfind("```") {
        Some(end) => &body[..end],
        None => body,
    };
    body.trim().to_string()
}

pub fn drop_trailing_commas(s: &str) -> String {
    TRAILING_COMMA.replace_all(s, "$1").to_string()
}

pub fn extract_outermost_object(s: &str) -> Option<String> {
    OUTERMOST_OBJECT.find(s).map(|m| m.as_str().to_string())
}

pub fn parse_with_fallback<T: DeserializeOwned>(raw: &str) -> ParseOutcome<T> {
    let mut last_error = match serde_json::from_str::<T>(raw.trim()) {
        Ok(v) => return ParseOutcome::Ok(v),
        Err(e) => e.to_string(),
    };

    let stripped = strip_code_blocks(raw);
    match serde_json::from_str::<T>(&stripped) {
        Ok(v) => return ParseOutcome::RepairedOk(v, Repair::StrippedCodeFence),
        Err(e) => last_error = e.to_string(),
    }

    let no_commas = drop_trailing_commas(&stripped);
    match serde_json::from_str::<T>(&no_commas) {
        Ok(v) => return ParseOutcome::RepairedOk(v, Repair::DroppedTrailingCommas),
        Err(e) => last_error = e.to_string(),
    }

    if let Some(object) = extract_outermost_object(&no_commas) {
        match serde_json::from_str::<T>(&object) {
            Ok(v) => return ParseOutcome::RepairedOk(v, Repair::ExtractedObject),
            Err(e) => last_error = e.to_string(),
        }
    }

    let preview: String = raw.chars().take(200).collect();
    ParseOutcome::Err(format!("{} (output starts with: {:?})", last_error, preview))
}
