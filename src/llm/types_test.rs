use super::*;
use crate::error::ErrorCode;

// =============================================================================
// LlmError
// =============================================================================

#[test]
fn error_codes_are_stable() {
    assert_eq!(LlmError::ConfigParse("bad".into()).error_code(), "E_CONFIG_PARSE");
    assert_eq!(LlmError::MissingApiKey { var: "K".into() }.error_code(), "E_MISSING_API_KEY");
    assert_eq!(LlmError::ApiRequest("timeout".into()).error_code(), "E_API_REQUEST");
    assert_eq!(LlmError::ApiResponse { status: 500, body: String::new() }.error_code(), "E_API_RESPONSE");
    assert_eq!(LlmError::ApiParse("json".into()).error_code(), "E_API_PARSE");
    assert_eq!(LlmError::HttpClientBuild("tls".into()).error_code(), "E_HTTP_CLIENT_BUILD");
}

#[test]
fn transport_and_server_errors_are_retryable() {
    assert!(LlmError::ApiRequest("conn refused".into()).retryable());
    assert!(LlmError::ApiResponse { status: 429, body: String::new() }.retryable());
    assert!(LlmError::ApiResponse { status: 503, body: String::new() }.retryable());
}

#[test]
fn client_errors_are_not_retryable() {
    assert!(!LlmError::ApiResponse { status: 400, body: String::new() }.retryable());
    assert!(!LlmError::ApiResponse { status: 401, body: String::new() }.retryable());
    assert!(!LlmError::ApiParse("json".into()).retryable());
    assert!(!LlmError::MissingApiKey { var: "K".into() }.retryable());
}

#[test]
fn display_includes_detail() {
    let err = LlmError::MissingApiKey { var: "MY_KEY".into() };
    assert!(err.to_string().contains("MY_KEY"));
}

// =============================================================================
// Message / ChatResponse
// =============================================================================

#[test]
fn message_constructors_set_roles() {
    assert_eq!(Message::user("hi").role, ROLE_USER);
    assert_eq!(Message::assistant("hello").role, ROLE_ASSISTANT);
}

#[test]
fn response_text_skips_thinking_and_unknown() {
    let resp = ChatResponse {
        content: vec![
            ContentBlock::Thinking { thinking: "hmm".into() },
            ContentBlock::Text { text: "node.set_attr(\"a\", \"b\");".into() },
            ContentBlock::Unknown,
            ContentBlock::Text { text: "node.remove_attr(\"c\");".into() },
        ],
        model: "m".into(),
        stop_reason: "end_turn".into(),
        input_tokens: 0,
        output_tokens: 0,
    };
    assert_eq!(resp.text(), "node.set_attr(\"a\", \"b\");\nnode.remove_attr(\"c\");");
}

#[test]
fn content_block_unknown_type_deserializes() {
    let block: ContentBlock = serde_json::from_str(r#"{"type":"tool_use","id":"x"}"#).unwrap();
    assert!(matches!(block, ContentBlock::Unknown));
}
