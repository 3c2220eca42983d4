//! Text extraction and overlapping chunking for knowledge-base ingestion.

use std::collections::VecDeque;

use serde_json::Value;

use crate::config::IngestionConfig;
use crate::errors::DomainError;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Already-parsed ingestion payload.
#[derive(Clone, Debug, PartialEq)]
pub enum RawInput {
    Json(Value),
    Text(String),
}

impl RawInput {
    /// A bare JSON string is treated as plain text.
    pub fn from_payload(value: Value) -> Self {
        match value {
            Value::String(text) => Self::Text(text),
            other => Self::Json(other),
        }
    }
}

pub fn extract(input: &RawInput) -> Result<String, DomainError> {
    let text = match input {
        RawInput::Text(text) => text.trim().to_owned(),
        RawInput::Json(value) => {
            let mut parts = Vec::new();
            collect_strings(value, &mut parts);
            parts.join(" ")
        }
    };

    if text.is_empty() {
        return Err(DomainError::MalformedInput("input contains no extractable text".to_owned()));
    }
    Ok(text)
}

fn collect_strings<'a>(value: &'a Value, parts: &mut Vec<&'a str>) {
    match value {
        Value::String(text) => {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                parts.push(trimmed);
            }
        }
        Value::Array(items) => items.iter().for_each(|item| collect_strings(item, parts)),
        Value::Object(fields) => fields.values().for_each(|field| collect_strings(field, parts)),
        Value::Null | Value::Bool(_) | Value::Number(_) => {}
    }
}

/// Recursive character splitting with greedy merge and trailing overlap.
///
/// Every returned chunk is trimmed, non-empty and at most `target_size`
/// characters long unless a single character already exceeds it.
pub fn chunk(text: &str, target_size: usize, overlap: usize) -> Vec<String> {
    let target_size = target_size.max(1);
    let overlap = overlap.min(target_size - 1);
    let mut chunks = Vec::new();
    split_recursive(text, &SEPARATORS, target_size, overlap, &mut chunks);
    chunks
}

fn split_recursive(
    text: &str,
    separators: &[&str],
    target_size: usize,
    overlap: usize,
    out: &mut Vec<String>,
) {
    let (separator, finer) = pick_separator(text, separators);
    let mut fitting = Vec::new();

    for piece in split_keeping_separator(text, separator) {
        if char_len(piece) < target_size {
            fitting.push(piece);
            continue;
        }

        if !fitting.is_empty() {
            merge_pieces(&fitting, target_size, overlap, out);
            fitting.clear();
        }
        if finer.is_empty() {
            push_trimmed(out, piece);
        } else {
            split_recursive(piece, finer, target_size, overlap, out);
        }
    }

    if !fitting.is_empty() {
        merge_pieces(&fitting, target_size, overlap, out);
    }
}

fn pick_separator<'s>(text: &str, separators: &'s [&'s str]) -> (&'s str, &'s [&'s str]) {
    for (position, separator) in separators.iter().enumerate() {
        if separator.is_empty() {
            return ("", &[]);
        }
        if text.contains(separator) {
            return (separator, &separators[position + 1..]);
        }
    }
    ("", &[])
}

/// Splits on `separator`, keeping it at the start of the following piece.
fn split_keeping_separator<'t>(text: &'t str, separator: &str) -> Vec<&'t str> {
    if separator.is_empty() {
        return text.char_indices().map(|(at, c)| &text[at..at + c.len_utf8()]).collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (at, _) in text.match_indices(separator) {
        if at > start {
            pieces.push(&text[start..at]);
        }
        start = at;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn merge_pieces(pieces: &[&str], target_size: usize, overlap: usize, out: &mut Vec<String>) {
    let mut window = VecDeque::new();
    let mut total = 0usize;

    for piece in pieces {
        let len = char_len(piece);
        if total + len > target_size && !window.is_empty() {
            push_window(out, &window);
            while total > overlap || (total > 0 && total + len > target_size) {
                match window.pop_front() {
                    Some(front) => total -= char_len(front),
                    None => break,
                }
            }
        }
        window.push_back(*piece);
        total += len;
    }

    push_window(out, &window);
}

fn push_window(out: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined = window.iter().copied().collect::<String>();
    push_trimmed(out, &joined);
}

fn push_trimmed(out: &mut Vec<String>, text: &str) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_owned());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Extraction followed by chunking with the configured window.
#[derive(Clone, Copy, Debug)]
pub struct IngestionPipeline {
    config: IngestionConfig,
}

impl IngestionPipeline {
    pub fn new(config: IngestionConfig) -> Self {
        Self { config }
    }

    pub fn prepare(&self, input: &RawInput) -> Result<Vec<String>, DomainError> {
        let text = extract(input)?;
        let chunks = chunk(&text, self.config.chunk_size, self.config.chunk_overlap);
        if chunks.is_empty() {
            return Err(DomainError::MalformedInput(
                "input produced no non-blank chunks".to_owned(),
            ));
        }
        Ok(chunks)
    }
}
