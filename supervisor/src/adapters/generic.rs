//! Adapter for CLIs that emit a flat, `type`-tagged NDJSON schema.
//!
//! ```text
//! {"type":"init","session_id":"s1","model":"m"}
//! {"type":"text","text":"hi","streaming":true}
//! {"type":"thinking","text":"..."}
//! {"type":"tool_start","tool":"Bash","input":{"command":"ls"}}
//! {"type":"tool_result","output":"..."}
//! {"type":"result","tokens":{"input":10,"output":5},"cost":0.01}
//! {"type":"error","message":"..."}
//! {"type":"context","used":1200,"limit":200000}
//! ```
//!
//! Any object may carry a top-level `session_id`.

use std::path::PathBuf;

use serde_json::Value;
use shared_types::{RunnerRequest, StandardEvent, TokenUsage};

use crate::adapter::BackendAdapter;

pub struct GenericJsonAdapter {
    executable: PathBuf,
    base_args: Vec<String>,
    prompt_via_stdin: bool,
}

impl GenericJsonAdapter {
    pub fn new(executable: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            executable: executable.into(),
            base_args,
            prompt_via_stdin: false,
        }
    }

    /// Deliver prompts and follow-up messages over stdin instead of argv.
    pub fn with_stdin_prompt(mut self) -> Self {
        self.prompt_via_stdin = true;
        self
    }
}

fn str_field<'a>(raw: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| raw.get(*k).and_then(Value::as_str))
}

fn parse_tokens(raw: &Value) -> TokenUsage {
    let tokens = &raw["tokens"];
    let field = |k: &str| tokens.get(k).and_then(Value::as_u64).unwrap_or(0);
    TokenUsage {
        input: field("input"),
        output: field("output"),
        cache_read: field("cache_read"),
        cache_creation: field("cache_creation"),
    }
}

impl BackendAdapter for GenericJsonAdapter {
    fn name(&self) -> &str {
        "generic"
    }

    fn executable_path(&self) -> PathBuf {
        self.executable.clone()
    }

    fn build_args(&self, request: &RunnerRequest) -> Vec<String> {
        let mut args = self.base_args.clone();
        if let Some(model) = &request.model {
            args.extend(["--model".to_string(), model.clone()]);
        }
        if let Some(session_id) = request.resume_session() {
            args.extend(["--resume".to_string(), session_id.to_string()]);
        }
        if !self.prompt_via_stdin {
            args.push(request.prompt.clone());
        }
        args
    }

    fn requires_stdin_input(&self) -> bool {
        self.prompt_via_stdin
    }

    fn extract_session_id(&self, raw: &Value) -> Option<String> {
        raw.get("session_id")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
    }

    fn parse_event(&self, raw: &Value) -> Option<StandardEvent> {
        let event_type = raw.get("type").and_then(Value::as_str)?;
        match event_type {
            "init" => Some(StandardEvent::Init {
                session_id: str_field(raw, &["session_id"]).unwrap_or_default().to_string(),
                model: str_field(raw, &["model"]).unwrap_or("unknown").to_string(),
            }),
            "text" => Some(StandardEvent::Text {
                text: str_field(raw, &["text"])?.to_string(),
                is_streaming: raw["streaming"].as_bool().unwrap_or(false),
            }),
            "thinking" => Some(StandardEvent::Thinking {
                text: str_field(raw, &["text"])?.to_string(),
                is_streaming: raw["streaming"].as_bool().unwrap_or(false),
            }),
            "tool_start" => Some(StandardEvent::ToolStart {
                tool_name: str_field(raw, &["tool", "name"])?.to_string(),
                tool_input: raw.get("input").cloned().unwrap_or(Value::Null),
            }),
            "tool_result" => Some(StandardEvent::ToolResult {
                tool_output: match raw.get("output") {
                    Some(Value::String(s)) => s.clone(),
                    Some(other) => other.to_string(),
                    None => String::new(),
                },
            }),
            "result" => Some(StandardEvent::StepComplete {
                tokens: parse_tokens(raw),
                cost: raw.get("cost").and_then(Value::as_f64),
                model_usage: raw.get("model_usage").filter(|v| !v.is_null()).cloned(),
            }),
            "error" => Some(StandardEvent::Error {
                message: str_field(raw, &["message", "error"])
                    .unwrap_or("unknown error")
                    .to_string(),
            }),
            "context" => Some(StandardEvent::ContextStats { raw: raw.clone() }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> GenericJsonAdapter {
        GenericJsonAdapter::new("/bin/agent", vec!["--json".to_string()])
    }

    #[test]
    fn init_maps_session_and_model() {
        let raw = json!({"type":"init","session_id":"s1","model":"m"});
        let a = adapter();
        assert_eq!(a.extract_session_id(&raw).as_deref(), Some("s1"));
        assert_eq!(
            a.parse_event(&raw),
            Some(StandardEvent::Init {
                session_id: "s1".to_string(),
                model: "m".to_string()
            })
        );
    }

    #[test]
    fn result_maps_tokens_with_missing_cache_fields() {
        let raw = json!({"type":"result","tokens":{"input":10,"output":5}});
        match adapter().parse_event(&raw) {
            Some(StandardEvent::StepComplete { tokens, cost, model_usage }) => {
                assert_eq!(tokens, TokenUsage::new(10, 5));
                assert_eq!(cost, None);
                assert_eq!(model_usage, None);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_type_is_not_user_visible() {
        let raw = json!({"type":"heartbeat","session_id":"s2"});
        let a = adapter();
        assert_eq!(a.parse_event(&raw), None);
        assert_eq!(a.extract_session_id(&raw).as_deref(), Some("s2"));
    }

    #[test]
    fn build_args_skips_resume_for_forced_new_session() {
        let mut req = RunnerRequest::new("a1", "hello", "/tmp").with_session("s1");
        assert_eq!(
            adapter().build_args(&req),
            vec!["--json", "--resume", "s1", "hello"]
        );
        req.force_new_session = true;
        assert_eq!(adapter().build_args(&req), vec!["--json", "hello"]);
    }

    #[test]
    fn stdin_mode_keeps_prompt_out_of_argv() {
        let a = adapter().with_stdin_prompt();
        let req = RunnerRequest::new("a1", "hello", "/tmp");
        assert!(a.requires_stdin_input());
        assert_eq!(a.build_args(&req), vec!["--json"]);
        assert_eq!(a.format_stdin_input("hello"), "hello\n");
    }
}
