//! Summarization prompt and tolerant parsing of the model's JSON reply.

use serde::Deserialize;

use knowhere_core::{Error, Result};

/// System prompt for the summarize call.
pub const SUMMARIZE_SYSTEM_PROMPT: &str = "You organize personal knowledge. \
Read the user's note and reply with a single JSON object and nothing else:\n\
{\n\
  \"title\": short descriptive title,\n\
  \"summary\": two or three sentence summary,\n\
  \"tags\": up to five lowercase topical tags,\n\
  \"date\": the date the note is about as YYYY-MM-DD, or null,\n\
  \"chunks\": the note split into self-contained passages of at most a few paragraphs, \
copied verbatim, in order\n\
}\n\
Use the note's language for title, summary and tags.";

/// Fields the model is asked to return. Every field is optional so a
/// partially compliant reply still yields whatever it did provide.
#[derive(Debug, Default, Deserialize)]
pub struct SummaryReply {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub chunks: Vec<String>,
}

impl SummaryReply {
    /// Trim strings, drop empties, lowercase and dedupe tags.
    pub fn normalized(self) -> Self {
        let non_empty = |s: Option<String>| {
            s.map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty() && v != "null")
        };

        let mut tags: Vec<String> = Vec::new();
        for tag in self.tags {
            let tag = tag.trim().trim_start_matches('#').to_lowercase();
            if !tag.is_empty() && !tags.contains(&tag) {
                tags.push(tag);
            }
        }

        Self {
            title: non_empty(self.title),
            summary: non_empty(self.summary),
            date: non_empty(self.date),
            tags,
            chunks: self
                .chunks
                .into_iter()
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
        }
    }
}

/// Cut `text` to at most `max_chars` bytes on a char boundary.
pub fn truncate_input(text: &str, max_chars: usize) -> &str {
    if text.len() <= max_chars {
        return text;
    }
    let mut end = max_chars;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// Extract the JSON object from a model reply.
///
/// Accepts bare JSON, JSON wrapped in a code fence, and replies that carry a
/// `<think>` block before the answer.
pub fn parse_summary_reply(raw: &str) -> Result<SummaryReply> {
    let answer = match raw.rfind("</think>") {
        Some(pos) => &raw[pos + "</think>".len()..],
        None => raw,
    };

    let start = answer.find('{');
    let end = answer.rfind('}');
    let json = match (start, end) {
        (Some(s), Some(e)) if e > s => &answer[s..=e],
        _ => {
            return Err(Error::Inference(format!(
                "summary reply contains no JSON object ({} bytes)",
                raw.len()
            )))
        }
    };

    let reply: SummaryReply = serde_json::from_str(json)
        .map_err(|e| Error::Inference(format!("summary reply is not valid JSON: {}", e)))?;
    Ok(reply.normalized())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let reply = parse_summary_reply(
            r##"{"title":"Rust","summary":"About Rust.","tags":["Rust","#lang","rust"],"date":null,"chunks":["a"," ","b"]}"##,
        )
        .unwrap();
        assert_eq!(reply.title.as_deref(), Some("Rust"));
        assert_eq!(reply.tags, vec!["rust".to_string(), "lang".to_string()]);
        assert!(reply.date.is_none());
        assert_eq!(reply.chunks, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn test_parse_fenced_json_after_think_block() {
        let raw = "<think>the user wants {json}</think>\n```json\n{\"title\": \"T\", \"date\": \"2026-03-01\"}\n```";
        let reply = parse_summary_reply(raw).unwrap();
        assert_eq!(reply.title.as_deref(), Some("T"));
        assert_eq!(reply.date.as_deref(), Some("2026-03-01"));
        assert!(reply.chunks.is_empty());
    }

    #[test]
    fn test_parse_missing_fields_default() {
        let reply = parse_summary_reply("{}").unwrap();
        assert!(reply.title.is_none());
        assert!(reply.tags.is_empty());
    }

    #[test]
    fn test_parse_rejects_prose() {
        let err = parse_summary_reply("I cannot summarize this.").unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(parse_summary_reply("{\"title\": }").is_err());
    }

    #[test]
    fn test_truncate_input_respects_char_boundary() {
        let text = "héllo";
        assert_eq!(truncate_input(text, 2), "h");
        assert_eq!(truncate_input(text, 3), "hé");
        assert_eq!(truncate_input(text, 100), text);
    }
}
