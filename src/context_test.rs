use super::*;
use crate::doc::test_helpers::{by_id, sample_document};

#[test]
fn wraps_selection_in_ancestor_tags() {
    let doc = sample_document();
    let title = by_id(&doc, "title");
    let text = AncestorContext { max_depth: 3 }.describe(&doc, title).unwrap();
    assert_eq!(
        text,
        concat!(
            "<body>\n",
            "  <main class=\"card\" id=\"main\">\n",
            "    <!-- selected element -->\n",
            "    <h1 id=\"title\">Hello</h1>\n",
            "  </main>\n",
            "</body>",
        )
    );
}

#[test]
fn depth_limits_the_ancestor_chain() {
    let doc = sample_document();
    let title = by_id(&doc, "title");
    let text = AncestorContext { max_depth: 1 }.describe(&doc, title).unwrap();
    assert!(text.starts_with("<main class=\"card\" id=\"main\">\n"));
    assert!(!text.contains("<body>"));
    assert!(text.ends_with("</main>"));
}

#[test]
fn zero_depth_is_just_the_selection() {
    let doc = sample_document();
    let side = by_id(&doc, "side");
    let text = AncestorContext { max_depth: 0 }.describe(&doc, side).unwrap();
    assert_eq!(text, format!("{SELECTED_MARKER}\n<aside id=\"side\">Side</aside>"));
}

#[test]
fn unknown_node_is_an_error() {
    let doc = sample_document();
    let missing = uuid::Uuid::new_v4();
    let err = AncestorContext::default().describe(&doc, missing).unwrap_err();
    assert_eq!(err, DocError::NodeNotFound(missing));
}
