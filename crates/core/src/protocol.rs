#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One tool invocation requested by the model. Arguments stay opaque JSON;
/// the tool's own `validate` decides whether they make sense.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ToolCallRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_arguments")]
    pub arguments: Value,
}

fn default_arguments() -> Value {
    Value::Object(serde_json::Map::new())
}

/// The strict JSON envelope the model must emit:
/// `{"tool_calls":[{"name":...,"arguments":{...}}],"final_answer":"..."}`.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct ToolProtocol {
    #[serde(default)]
    pub tool_calls: Vec<ToolCallRequest>,
    #[serde(default)]
    pub final_answer: String,
}

/// Parse a model reply as the tool protocol. Strict JSON first; on failure,
/// scan for the outermost balanced `{...}` so fenced or markdown-wrapped
/// replies still parse. `None` means the reply carries no protocol at all.
pub fn parse_tool_protocol(content: &str) -> Option<ToolProtocol> {
    let trimmed = content.trim();
    if let Ok(parsed) = serde_json::from_str::<ToolProtocol>(trimmed) {
        return Some(parsed);
    }
    let object = extract_json_object(trimmed)?;
    serde_json::from_str::<ToolProtocol>(&object).ok()
}

/// Return the first outermost brace-balanced object in `content`, honoring
/// string literals and escapes.
fn extract_json_object(content: &str) -> Option<String> {
    let s = content.trim();
    let start = s.find('{')?;
    let bytes = s.as_bytes();
    let mut in_string = false;
    let mut escape_next = false;
    let mut depth = 0usize;
    for (i, &ch) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escape_next {
                escape_next = false;
                continue;
            }
            match ch {
                b'\\' => escape_next = true,
                b'"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(s[start..=i].to_string());
                }
            }
            _ => {}
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_strict_json() {
        let parsed = parse_tool_protocol(r#"{"tool_calls":[],"final_answer":"done"}"#).unwrap();
        assert!(parsed.tool_calls.is_empty());
        assert_eq!(parsed.final_answer, "done");
    }

    #[test]
    fn parses_tool_calls_with_arguments() {
        let parsed = parse_tool_protocol(
            r#"{"tool_calls":[{"name":"ls","arguments":{"path":"."}}],"final_answer":""}"#,
        )
        .unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "ls");
        assert_eq!(parsed.tool_calls[0].arguments["path"], json!("."));
    }

    #[test]
    fn parses_markdown_fenced_json() {
        let content = "```json\n{\"tool_calls\":[],\"final_answer\":\"ok\"}\n```";
        let parsed = parse_tool_protocol(content).unwrap();
        assert_eq!(parsed.final_answer, "ok");
    }

    #[test]
    fn parses_prose_wrapped_json() {
        let content = "Sure, here is the result: {\"tool_calls\":[],\"final_answer\":\"wrapped\"} hope that helps";
        let parsed = parse_tool_protocol(content).unwrap();
        assert_eq!(parsed.final_answer, "wrapped");
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scanner() {
        let content = r#"```{"tool_calls":[],"final_answer":"a } b { c"}```"#;
        let parsed = parse_tool_protocol(content).unwrap();
        assert_eq!(parsed.final_answer, "a } b { c");
    }

    #[test]
    fn rejects_non_json() {
        assert!(parse_tool_protocol("plain text answer").is_none());
        assert!(parse_tool_protocol("").is_none());
        assert!(parse_tool_protocol("{not closed").is_none());
    }

    #[test]
    fn round_trips_canonical_envelope() {
        let envelope = ToolProtocol {
            tool_calls: vec![ToolCallRequest {
                name: "grep".to_string(),
                arguments: json!({"path": ".", "pattern": "fn main"}),
            }],
            final_answer: String::new(),
        };
        let text = serde_json::to_string(&envelope).unwrap();
        let parsed = parse_tool_protocol(&text).unwrap();
        assert_eq!(parsed.tool_calls.len(), 1);
        assert_eq!(parsed.tool_calls[0].name, "grep");
        assert_eq!(
            parsed.tool_calls[0].arguments,
            json!({"path": ".", "pattern": "fn main"})
        );
        assert_eq!(parsed.final_answer, "");
    }
}
