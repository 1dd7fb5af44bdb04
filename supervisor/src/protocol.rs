//! Line interpretation and narration.
//!
//! Each decoded stdout line is either raw text or a JSON object. JSON objects
//! go through the backend adapter twice: once for a session id, once for a
//! [`StandardEvent`]. Every event is also narrated into a human-readable line
//! because the console shows both the typed and the text form.

use shared_types::StandardEvent;

use crate::adapter::BackendAdapter;

const TOOL_OUTPUT_PREVIEW_CHARS: usize = 200;

/// What one stdout line turned out to be.
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedLine {
    /// Not JSON; surfaced verbatim
    Raw(String),
    /// JSON object, with whatever the adapter recognized in it
    Structured {
        session_id: Option<String>,
        event: Option<StandardEvent>,
    },
}

/// Classify one line. Blank lines yield `None`.
pub fn interpret_line(adapter: &dyn BackendAdapter, line: &str) -> Option<ParsedLine> {
    if line.trim().is_empty() {
        return None;
    }
    let raw: serde_json::Value = match serde_json::from_str::<serde_json::Value>(line) {
        Ok(v) if v.is_object() => v,
        _ => return Some(ParsedLine::Raw(line.to_string())),
    };
    Some(ParsedLine::Structured {
        session_id: adapter.extract_session_id(&raw),
        event: adapter.parse_event(&raw),
    })
}

/// Human-readable rendering of an event for the output stream.
pub fn narrate(event: &StandardEvent) -> String {
    match event {
        StandardEvent::Init { session_id, model } => {
            format!("Session started: {session_id} (model: {model})")
        }
        StandardEvent::Text { text, .. } => text.clone(),
        StandardEvent::Thinking { text, .. } => format!("[thinking] {text}"),
        StandardEvent::ToolStart { tool_name, .. } => format!("Using tool: {tool_name}"),
        StandardEvent::ToolResult { tool_output } => {
            format!("Tool result: {}", truncate(tool_output, TOOL_OUTPUT_PREVIEW_CHARS))
        }
        StandardEvent::StepComplete { tokens, cost, .. } => {
            let mut line = format!(
                "Step complete: {} in / {} out tokens",
                tokens.input, tokens.output
            );
            if tokens.cache_read > 0 || tokens.cache_creation > 0 {
                line.push_str(&format!(
                    " (cache read {}, cache write {})",
                    tokens.cache_read, tokens.cache_creation
                ));
            }
            if let Some(cost) = cost {
                line.push_str(&format!(", ${cost:.4}"));
            }
            line
        }
        StandardEvent::Error { message } => format!("Error: {message}"),
        StandardEvent::ContextStats { raw } => format!("Context: {raw}"),
    }
}

/// Whether the narrated line is a streaming fragment.
pub fn is_streaming(event: &StandardEvent) -> bool {
    matches!(
        event,
        StandardEvent::Text {
            is_streaming: true,
            ..
        } | StandardEvent::Thinking {
            is_streaming: true,
            ..
        }
    )
}

fn truncate(text: &str, max_chars: usize) -> String {
    let mut out: String = text.chars().take(max_chars).collect();
    if text.chars().count() > max_chars {
        out.push_str("...");
    }
    out
}
