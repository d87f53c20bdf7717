//! Response normalization across Ollama API versions.
//!
//! Two wire shapes carry the model's text: the chat API nests it under
//! `message.content`, the legacy generate API puts it in a top-level
//! `response`. Precedence is `message.content` > `response` > empty string.
//! A key holding an empty string yields to the next one.

use serde_json::Value;

use super::types::{ContentSource, Role, TokenUsage};

/// Content and bookkeeping extracted from one upstream JSON object.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedBody {
    pub role: Role,
    pub content: String,
    pub source: ContentSource,
    /// A content key was present but null or not a string.
    pub coerced: bool,
    pub model: Option<String>,
    pub done: bool,
    pub done_reason: Option<String>,
    pub usage: Option<TokenUsage>,
    /// In-band error reported by the server.
    pub error: Option<String>,
}

/// What a single content key held.
enum Slot<'a> {
    Absent,
    Text(&'a str),
    Other,
}

fn slot(value: Option<&Value>) -> Slot<'_> {
    match value {
        None => Slot::Absent,
        Some(Value::String(s)) => Slot::Text(s),
        Some(_) => Slot::Other,
    }
}

/// Normalize an upstream body. Never fails; any JSON value is accepted.
pub fn normalize(body: &Value) -> NormalizedBody {
    let message = body.get("message");
    let nested = slot(message.and_then(|m| m.get("content")));
    let legacy = slot(body.get("response"));

    let coerced = matches!(nested, Slot::Other) || matches!(legacy, Slot::Other);

    let (content, source) = match (nested, legacy) {
        (Slot::Text(s), _) if !s.is_empty() => (s.to_string(), ContentSource::MessageContent),
        (_, Slot::Text(s)) if !s.is_empty() => (s.to_string(), ContentSource::Response),
        _ => (String::new(), ContentSource::Empty),
    };

    let role = message
        .and_then(|m| m.get("role"))
        .and_then(Value::as_str)
        .and_then(Role::parse)
        .unwrap_or(Role::Assistant);

    let usage = match (
        body.get("prompt_eval_count").and_then(Value::as_u64),
        body.get("eval_count").and_then(Value::as_u64),
    ) {
        (None, None) => None,
        (prompt, completion) => Some(TokenUsage {
            prompt_tokens: prompt.unwrap_or(0),
            completion_tokens: completion.unwrap_or(0),
        }),
    };

    NormalizedBody {
        role,
        content,
        source,
        coerced,
        model: body.get("model").and_then(Value::as_str).map(str::to_string),
        done: body.get("done").and_then(Value::as_bool).unwrap_or(false),
        done_reason: body
            .get("done_reason")
            .and_then(Value::as_str)
            .map(str::to_string),
        usage,
        error: body.get("error").and_then(Value::as_str).map(str::to_string),
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_chat_shape() {
        let n = normalize(&json!({"message": {"content": "hi"}}));
        assert_eq!(n.content, "hi");
        assert_eq!(n.source, ContentSource::MessageContent);
        assert_eq!(n.role, Role::Assistant);
        assert!(!n.coerced);
    }

    #[test]
    fn test_legacy_generate_shape() {
        let n = normalize(&json!({"response": "hi"}));
        assert_eq!(n.content, "hi");
        assert_eq!(n.source, ContentSource::Response);
    }

    #[test]
    fn test_empty_object() {
        let n = normalize(&json!({}));
        assert_eq!(n.content, "");
        assert_eq!(n.source, ContentSource::Empty);
        assert!(!n.coerced);
        assert!(!n.done);
    }

    #[test]
    fn test_message_content_wins_over_response() {
        let n = normalize(&json!({"message": {"content": "chat"}, "response": "legacy"}));
        assert_eq!(n.content, "chat");
    }

    #[test]
    fn test_empty_message_content_falls_back_to_response() {
        let n = normalize(&json!({"message": {"content": ""}, "response": "legacy"}));
        assert_eq!(n.content, "legacy");
        assert_eq!(n.source, ContentSource::Response);
    }

    #[test]
    fn test_null_and_non_string_are_coerced() {
        let n = normalize(&json!({"message": {"content": null}}));
        assert_eq!(n.content, "");
        assert!(n.coerced);

        let n = normalize(&json!({"message": {"content": 42}, "response": ["x"]}));
        assert_eq!(n.content, "");
        assert_eq!(n.source, ContentSource::Empty);
        assert!(n.coerced);
    }

    #[test]
    fn test_message_not_an_object() {
        let n = normalize(&json!({"message": "oops", "response": "ok"}));
        assert_eq!(n.content, "ok");
    }

    #[test]
    fn test_non_object_body() {
        let n = normalize(&json!([1, 2, 3]));
        assert_eq!(n.content, "");
        assert_eq!(n.source, ContentSource::Empty);
    }

    #[test]
    fn test_role_and_final_metadata() {
        let n = normalize(&json!({
            "model": "llama3.1:8b",
            "message": {"role": "assistant", "content": "done"},
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 26,
            "eval_count": 298
        }));
        assert_eq!(n.model.as_deref(), Some("llama3.1:8b"));
        assert!(n.done);
        assert_eq!(n.done_reason.as_deref(), Some("stop"));
        assert_eq!(
            n.usage,
            Some(TokenUsage {
                prompt_tokens: 26,
                completion_tokens: 298
            })
        );
    }

    #[test]
    fn test_unknown_role_defaults_to_assistant() {
        let n = normalize(&json!({"message": {"role": "narrator", "content": "x"}}));
        assert_eq!(n.role, Role::Assistant);
    }

    #[test]
    fn test_in_band_error() {
        let n = normalize(&json!({"error": "model 'nope' not found"}));
        assert_eq!(n.error.as_deref(), Some("model 'nope' not found"));
        assert_eq!(n.content, "");
    }
}
