use super::*;

#[test]
fn bare_script_is_final() {
    let raw = "node.add_class(\"big\");\n";
    assert_eq!(AgentResponse::parse(raw), AgentResponse::Final("node.add_class(\"big\");".into()));
}

#[test]
fn object_with_code_is_a_directive() {
    let raw = r#"{ "iterate": true, "code": "node.children()", "reason": "inspect the list" }"#;
    assert_eq!(
        AgentResponse::parse(raw),
        AgentResponse::Iterate { code: "node.children()".into(), reason: "inspect the list".into() }
    );
}

#[test]
fn reason_is_optional() {
    let raw = r#"{"code": "node.markup()"}"#;
    assert_eq!(
        AgentResponse::parse(raw),
        AgentResponse::Iterate { code: "node.markup()".into(), reason: String::new() }
    );
}

#[test]
fn fenced_directive_is_unwrapped() {
    let raw = "```json\n{\"iterate\": true, \"code\": \"node.text()\"}\n```";
    assert!(matches!(AgentResponse::parse(raw), AgentResponse::Iterate { code, .. } if code == "node.text()"));
}

#[test]
fn fenced_script_is_unwrapped() {
    let raw = "```rhai\nnode.set_style(\"color\", \"blue\");\nnode.add_class(\"x\");\n```";
    assert_eq!(
        AgentResponse::parse(raw),
        AgentResponse::Final("node.set_style(\"color\", \"blue\");\nnode.add_class(\"x\");".into())
    );
}

#[test]
fn structured_text_without_string_code_is_final() {
    for raw in [r#"{"reason": "no code"}"#, r#"{"code": 42}"#, r#"[{"code": "x"}]"#] {
        assert_eq!(AgentResponse::parse(raw), AgentResponse::Final(raw.into()), "{raw}");
    }
}

#[test]
fn unterminated_fence_is_left_alone() {
    let raw = "```\nnode.remove();";
    assert_eq!(AgentResponse::parse(raw), AgentResponse::Final(raw.into()));
}
