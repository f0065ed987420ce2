//! Normalization of stored content into plain text for the AI calls.

use serde_json::Value;

use knowhere_core::{ContentType, Error, Result};

/// Keys whose values hold nested blocks rather than inline text.
const BLOCK_KEYS: [&str; 2] = ["children", "blocks"];

/// Keys that may hold inline text within a block.
const INLINE_KEYS: [&str; 4] = ["text", "content", "data", "items"];

/// Turn decrypted content into the text the summarizer and embedder see.
///
/// Markdown passes through. Blocks documents (a JSON array of blocks, or an
/// object with a `blocks` array) become one line per block.
pub fn normalize(content_type: ContentType, raw: &str) -> Result<String> {
    match content_type {
        ContentType::Markdown => Ok(raw.to_string()),
        ContentType::Blocks => {
            let doc: Value = serde_json::from_str(raw)
                .map_err(|e| Error::InvalidInput(format!("blocks content is not JSON: {}", e)))?;
            let mut lines = Vec::new();
            block_lines(&doc, &mut lines);
            Ok(lines.join("\n"))
        }
    }
}

fn block_lines(value: &Value, lines: &mut Vec<String>) {
    match value {
        Value::Array(items) => items.iter().for_each(|item| block_lines(item, lines)),
        Value::Object(map) => {
            let mut line = String::new();
            for (key, v) in map {
                if INLINE_KEYS.contains(&key.as_str()) {
                    inline_text(v, &mut line);
                }
            }
            let line = line.trim();
            if !line.is_empty() {
                lines.push(line.to_string());
            }
            for key in BLOCK_KEYS {
                if let Some(nested) = map.get(key) {
                    block_lines(nested, lines);
                }
            }
        }
        Value::String(s) if !s.trim().is_empty() => lines.push(s.trim().to_string()),
        _ => {}
    }
}

fn inline_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            // Adjacent word runs need a space; punctuation attaches as is.
            let joins_word = s.starts_with(char::is_alphanumeric)
                && out.ends_with(char::is_alphanumeric);
            if joins_word {
                out.push(' ');
            }
            out.push_str(s);
        }
        Value::Array(items) => items.iter().for_each(|item| inline_text(item, out)),
        Value::Object(map) => {
            for (key, v) in map {
                if INLINE_KEYS.contains(&key.as_str()) {
                    inline_text(v, out);
                }
            }
        }
        _ => {}
    }
}
