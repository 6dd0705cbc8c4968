use super::*;

#[test]
fn edit_errors_carry_their_code() {
    let err = CliError::from(EditError::EmptyPrompt);
    assert!(matches!(err, CliError::Edit(EditError::EmptyPrompt)));
    assert_eq!(err.to_string(), format!("[E_EMPTY_PROMPT] {}", EditError::EmptyPrompt));
}

#[test]
fn unknown_selection_names_the_id() {
    let spec: NodeSpec = serde_json::from_str(r#"{"tag": "body", "attributes": {"id": "root"}}"#).unwrap();
    let doc = Document::from_spec(&spec).unwrap();
    assert_eq!(resolve_targets(&doc, &["root".to_owned()]).unwrap().len(), 1);
    let err = resolve_targets(&doc, &["missing".to_owned()]).unwrap_err();
    assert_eq!(err.to_string(), "no element with id `missing`");
}
