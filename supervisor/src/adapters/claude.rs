//! Claude Code adapter for the `stream-json` protocol.
//!
//! Claude Code is spawned in print mode with `--input-format stream-json`
//! and `--output-format stream-json`. The process stays alive between turns:
//! every user message is one JSON line on stdin, and every output record is
//! one JSON line on stdout. A new process for the same conversation passes
//! `--resume <session-id>`.

use std::path::PathBuf;

use serde_json::{json, Value};
use shared_types::{RunnerRequest, StandardEvent, TokenUsage};

use crate::adapter::BackendAdapter;

const STREAM_JSON_ARGS: &[&str] = &[
    "--print",
    "--verbose", // required for stream-json output
    "--input-format",
    "stream-json",
    "--output-format",
    "stream-json",
];

pub struct ClaudeCodeAdapter {
    executable: PathBuf,
}

impl ClaudeCodeAdapter {
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
        }
    }
}

fn usage_tokens(usage: &Value) -> TokenUsage {
    let field = |k: &str| usage.get(k).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input: field("input_tokens"),
        output: field("output_tokens"),
        cache_read: field("cache_read_input_tokens"),
        cache_creation: field("cache_creation_input_tokens"),
    }
}

fn tool_result_text(block: &Value) -> String {
    match &block["content"] {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// An assistant record carries content blocks. A tool call wins over text,
/// text wins over thinking, so each record yields at most one event.
fn parse_assistant(obj: &Value) -> Option<StandardEvent> {
    let blocks = obj["message"]["content"].as_array()?;

    if let Some(tool) = blocks.iter().find(|b| b["type"] == "tool_use") {
        return Some(StandardEvent::ToolStart {
            tool_name: tool["name"].as_str().unwrap_or("Unknown").to_string(),
            tool_input: tool.get("input").cloned().unwrap_or(Value::Null),
        });
    }

    let text: Vec<&str> = blocks
        .iter()
        .filter(|b| b["type"] == "text")
        .filter_map(|b| b["text"].as_str())
        .collect();
    if !text.is_empty() {
        return Some(StandardEvent::Text {
            text: text.join("\n"),
            is_streaming: false,
        });
    }

    let thinking: Vec<&str> = blocks
        .iter()
        .filter(|b| b["type"] == "thinking")
        .filter_map(|b| b["thinking"].as_str())
        .collect();
    if !thinking.is_empty() {
        return Some(StandardEvent::Thinking {
            text: thinking.join("\n"),
            is_streaming: false,
        });
    }
    None
}

/// Partial-message deltas emitted with `--include-partial-messages`.
fn parse_stream_event(obj: &Value) -> Option<StandardEvent> {
    let event = &obj["event"];
    if event["type"] != "content_block_delta" {
        return None;
    }
    let delta = &event["delta"];
    match delta["type"].as_str()? {
        "text_delta" => Some(StandardEvent::Text {
            text: delta["text"].as_str()?.to_string(),
            is_streaming: true,
        }),
        "thinking_delta" => Some(StandardEvent::Thinking {
            text: delta["thinking"].as_str()?.to_string(),
            is_streaming: true,
        }),
        _ => None,
    }
}

fn parse_result(obj: &Value) -> StandardEvent {
    let subtype = obj["subtype"].as_str().unwrap_or("success");
    if obj["is_error"].as_bool().unwrap_or(false) || subtype.starts_with("error") {
        let message = obj["result"]
            .as_str()
            .map(ToString::to_string)
            .or_else(|| {
                obj["errors"].as_array().map(|errs| {
                    errs.iter()
                        .filter_map(Value::as_str)
                        .collect::<Vec<_>>()
                        .join("; ")
                })
            })
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| subtype.to_string());
        return StandardEvent::Error { message };
    }

    StandardEvent::StepComplete {
        tokens: usage_tokens(&obj["usage"]),
        cost: obj["total_cost_usd"].as_f64(),
        model_usage: obj.get("modelUsage").filter(|v| !v.is_null()).cloned(),
    }
}

impl BackendAdapter for ClaudeCodeAdapter {
    fn name(&self) -> &str {
        "claude"
    }

    fn executable_path(&self) -> PathBuf {
        self.executable.clone()
    }

    fn build_args(&self, request: &RunnerRequest) -> Vec<String> {
        let mut args: Vec<String> = STREAM_JSON_ARGS.iter().map(ToString::to_string).collect();
        args.extend([
            "--permission-mode".to_string(),
            request.permission_mode.as_cli_value().to_string(),
        ]);
        if let Some(model) = &request.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(system_prompt) = &request.system_prompt {
            args.extend(["--append-system-prompt".to_string(), system_prompt.clone()]);
        }
        if let Some(tools) = request.extra_str("allowed_tools") {
            args.extend(["--allowedTools".to_string(), tools.to_string()]);
        }
        if request.extras.get("include_partial_messages").and_then(Value::as_bool) == Some(true) {
            args.push("--include-partial-messages".to_string());
        }
        if let Some(session_id) = request.resume_session() {
            args.extend(["--resume".to_string(), session_id.to_string()]);
        }
        args
    }

    fn requires_stdin_input(&self) -> bool {
        true
    }

    fn format_stdin_input(&self, text: &str) -> String {
        let line = json!({
            "type": "user",
            "message": { "role": "user", "content": text },
        });
        format!("{line}\n")
    }

    fn extract_session_id(&self, raw: &Value) -> Option<String> {
        raw.get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }

    fn parse_event(&self, raw: &Value) -> Option<StandardEvent> {
        match raw["type"].as_str()? {
            "system" => match raw["subtype"].as_str()? {
                "init" => Some(StandardEvent::Init {
                    session_id: raw["session_id"].as_str().unwrap_or_default().to_string(),
                    model: raw["model"].as_str().unwrap_or("unknown").to_string(),
                }),
                "compact_boundary" => Some(StandardEvent::ContextStats {
                    raw: raw
                        .get("compact_metadata")
                        .cloned()
                        .unwrap_or_else(|| raw.clone()),
                }),
                _ => None,
            },
            "assistant" => parse_assistant(raw),
            "user" => raw["message"]["content"]
                .as_array()?
                .iter()
                .find(|b| b["type"] == "tool_result")
                .map(|b| StandardEvent::ToolResult {
                    tool_output: tool_result_text(b),
                }),
            "stream_event" => parse_stream_event(raw),
            "result" => Some(parse_result(raw)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared_types::PermissionMode;

    fn adapter() -> ClaudeCodeAdapter {
        ClaudeCodeAdapter::new("claude")
    }

    #[test]
    fn system_init_becomes_init_event() {
        let raw = json!({
            "type": "system",
            "subtype": "init",
            "session_id": "abc",
            "model": "opus",
            "cwd": "/w"
        });
        assert_eq!(
            adapter().parse_event(&raw),
            Some(StandardEvent::Init {
                session_id: "abc".to_string(),
                model: "opus".to_string()
            })
        );
    }

    #[test]
    fn tool_use_wins_over_text() {
        let raw = json!({"type":"assistant","message":{"content":[
            {"type":"text","text":"Let me look"},
            {"type":"tool_use","name":"Read","input":{"file_path":"/a.rs"}}
        ]}});
        match adapter().parse_event(&raw) {
            Some(StandardEvent::ToolStart { tool_name, tool_input }) => {
                assert_eq!(tool_name, "Read");
                assert_eq!(tool_input["file_path"], "/a.rs");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn result_success_maps_usage_and_cost() {
        let raw = json!({
            "type": "result",
            "subtype": "success",
            "total_cost_usd": 0.25,
            "usage": {
                "input_tokens": 100,
                "output_tokens": 20,
                "cache_read_input_tokens": 7,
                "cache_creation_input_tokens": 3
            }
        });
        match adapter().parse_event(&raw) {
            Some(StandardEvent::StepComplete { tokens, cost, .. }) => {
                assert_eq!(tokens.input, 100);
                assert_eq!(tokens.output, 20);
                assert_eq!(tokens.cache_read, 7);
                assert_eq!(tokens.cache_creation, 3);
                assert_eq!(cost, Some(0.25));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn result_error_becomes_error_event() {
        let raw = json!({"type":"result","subtype":"error_max_turns","is_error":true});
        assert_eq!(
            adapter().parse_event(&raw),
            Some(StandardEvent::Error {
                message: "error_max_turns".to_string()
            })
        );
    }

    #[test]
    fn text_delta_is_streaming() {
        let raw = json!({
            "type": "stream_event",
            "event": {
                "type": "content_block_delta",
                "delta": { "type": "text_delta", "text": "Hel" }
            }
        });
        assert_eq!(
            adapter().parse_event(&raw),
            Some(StandardEvent::Text {
                text: "Hel".to_string(),
                is_streaming: true
            })
        );
    }

    #[test]
    fn build_args_resumes_and_sets_permission_mode() {
        let mut req = RunnerRequest::new("a1", "hi", "/w").with_session("s9");
        req.permission_mode = PermissionMode::AcceptEdits;
        let args = adapter().build_args(&req);
        assert!(args.windows(2).any(|w| w == ["--resume", "s9"]));
        assert!(args.windows(2).any(|w| w == ["--permission-mode", "acceptEdits"]));
        assert!(!args.contains(&"hi".to_string()));
    }

    #[test]
    fn stdin_input_is_one_json_line() {
        let line = adapter().format_stdin_input("do it");
        assert!(line.ends_with('\n'));
        let parsed: Value = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(parsed["message"]["content"], "do it");
    }
}
