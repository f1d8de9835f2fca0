use serde_json::Value;
use std::collections::HashMap;

use crate::error::{AgentError, ErrorKind};

/// What a ReAct model turn parses into.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// Text after a recognized final-answer marker; terminates the loop.
    FinalAnswer(String),
    /// A tool invocation request.
    Action {
        thought: String,
        tool:    String,
        input:   HashMap<String, Value>,
    },
}

/// Parser for the text tool protocol:
///
/// ```text
/// Thought: I should look this up
/// Action: weather
/// Action Input: {"city": "SF"}
/// ```
///
/// or, to finish:
///
/// ```text
/// Final Answer: it is sunny
/// ```
///
/// Markers are matched case-insensitively. Anything that fits neither shape
/// is a parse error; the loop turns those into synthetic observations and
/// fails only after several in a row.
#[derive(Debug, Clone)]
pub struct ResponseParser {
    final_marker:  String,
    action_marker: String,
    input_marker:  String,
    thought_marker: String,
}

impl Default for ResponseParser {
    fn default() -> Self {
        Self {
            final_marker:   "final answer:".to_string(),
            action_marker:  "action:".to_string(),
            input_marker:   "action input:".to_string(),
            thought_marker: "thought:".to_string(),
        }
    }
}

/// Case-insensitive search; returns the byte offset right after the marker.
fn find_marker(text: &str, marker: &str) -> Option<usize> {
    text.to_lowercase().find(marker).map(|pos| pos + marker.len())
}

/// Pull the first balanced JSON object out of `text`, tolerating trailing
/// prose. Quote- and escape-aware.
fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if escaped {
            escaped = false;
            continue;
        }
        match b {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=i]);
                }
            }
            _ => {}
        }
    }
    None
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn parse(&self, text: &str) -> Result<ParsedResponse, AgentError> {
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Err(AgentError::new(
                ErrorKind::ParserFailed,
                "parser",
                "parse",
                "empty model output",
            ));
        }

        // Final answer wins over any action fragments that precede it.
        if let Some(after) = find_marker(trimmed, &self.final_marker) {
            return Ok(ParsedResponse::FinalAnswer(trimmed[after..].trim().to_string()));
        }

        let action_at = find_marker(trimmed, &self.action_marker);
        let input_at = find_marker(trimmed, &self.input_marker);

        // Note "action input:" does not contain the substring "action:", so
        // a lone input line cannot masquerade as the action line.
        let action_at = action_at.ok_or_else(|| {
            AgentError::new(
                ErrorKind::ParserMissingField,
                "parser",
                "parse",
                "no action or final answer marker",
            )
            .with_context("field", "action")
        })?;

        let thought = find_marker(trimmed, &self.thought_marker)
            .map(|at| {
                trimmed[at..]
                    .lines()
                    .next()
                    .unwrap_or("")
                    .trim()
                    .to_string()
            })
            .unwrap_or_default();

        let tool = trimmed[action_at..]
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if tool.is_empty() {
            return Err(AgentError::new(
                ErrorKind::ParserMissingField,
                "parser",
                "parse",
                "action line names no tool",
            )
            .with_context("field", "action"));
        }

        let input_at = input_at.ok_or_else(|| {
            AgentError::new(
                ErrorKind::ParserMissingField,
                "parser",
                "parse",
                "action without action input",
            )
            .with_context("field", "action_input")
        })?;

        let raw_input = trimmed[input_at..].trim();
        let input = if raw_input.is_empty() {
            HashMap::new()
        } else {
            let json_str = extract_json_object(raw_input).ok_or_else(|| {
                AgentError::new(
                    ErrorKind::ParserInvalidJson,
                    "parser",
                    "parse",
                    "action input is not a JSON object",
                )
            })?;
            serde_json::from_str::<HashMap<String, Value>>(json_str).map_err(|e| {
                AgentError::new(
                    ErrorKind::ParserInvalidJson,
                    "parser",
                    "parse",
                    "action input failed to parse",
                )
                .with_source(e)
            })?
        };

        Ok(ParsedResponse::Action { thought, tool, input })
    }
}
