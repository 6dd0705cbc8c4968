use super::*;
use crate::context::{AncestorContext, SELECTED_MARKER};
use crate::doc::test_helpers::{by_id, shared_sample};
use crate::doc::{Mutation, SharedDocument};
use crate::error::ErrorCode;
use crate::llm::types::LlmError;
use crate::services::sandbox::RhaiRuntime;
use crate::services::test_helpers::{MockLlm, Reply, directive, test_config};

struct Fixture {
    llm: MockLlm,
    runtime: RhaiRuntime,
    context: AncestorContext,
    config: EditorConfig,
}

impl Fixture {
    fn new(llm: MockLlm) -> Self {
        Self { llm, runtime: RhaiRuntime::default(), context: AncestorContext::default(), config: test_config() }
    }

    fn driver(&self) -> IterationDriver<'_> {
        IterationDriver { llm: &self.llm, runtime: &self.runtime, context: &self.context, config: &self.config }
    }
}

fn markup(doc: &SharedDocument) -> String {
    let guard = doc.lock();
    guard.outer_markup(guard.root()).unwrap()
}

fn channel() -> (mpsc::Sender<String>, mpsc::Receiver<String>) {
    mpsc::channel(64)
}

const FINAL: &str = "node.set_style(\"color\", \"blue\");";

// =============================================================================
// final scripts + message shape
// =============================================================================

#[tokio::test]
async fn final_reply_ends_resolution() {
    let fx = Fixture::new(MockLlm::new([FINAL]));
    let mut session = Session::new(shared_sample());
    let title = by_id(&session.document().lock(), "title");
    let (tx, _rx) = channel();

    let script = fx
        .driver()
        .resolve(&mut session, title, "make it blue", &CancellationToken::new(), &tx)
        .await
        .unwrap();
    assert_eq!(script, FINAL);

    let conversation = session.conversation();
    assert_eq!(conversation.len(), 2);
    assert!(conversation[0].content.contains("Reply in exactly one of two shapes"));
    assert!(conversation[0].content.contains(SELECTED_MARKER));
    assert!(conversation[0].content.contains("<h1 id=\"title\">Hello</h1>"));
    assert!(conversation[0].content.ends_with("Instruction: make it blue"));
    assert_eq!(conversation[1], Message::assistant(FINAL));
}

#[tokio::test]
async fn follow_up_for_known_node_sends_only_the_instruction() {
    let fx = Fixture::new(MockLlm::new([FINAL, FINAL]));
    let mut session = Session::new(shared_sample());
    let title = by_id(&session.document().lock(), "title");
    let (tx, _rx) = channel();
    let cancel = CancellationToken::new();

    fx.driver().resolve(&mut session, title, "first", &cancel, &tx).await.unwrap();
    fx.driver().resolve(&mut session, title, "second", &cancel, &tx).await.unwrap();

    let conversation = session.conversation();
    assert_eq!(conversation[2], Message::user("Instruction: second"));
    // the generator sees the whole conversation on every call
    assert_eq!(fx.llm.calls()[1].len(), 3);
}

#[tokio::test]
async fn new_node_in_same_session_gets_context_without_format_text() {
    let fx = Fixture::new(MockLlm::new([FINAL, FINAL]));
    let mut session = Session::new(shared_sample());
    let (title, side) = {
        let d = session.document().lock();
        (by_id(&d, "title"), by_id(&d, "side"))
    };
    let (tx, _rx) = channel();
    let cancel = CancellationToken::new();

    fx.driver().resolve(&mut session, title, "a", &cancel, &tx).await.unwrap();
    fx.driver().resolve(&mut session, side, "a", &cancel, &tx).await.unwrap();

    let second = &session.conversation()[2].content;
    assert!(second.contains("<aside id=\"side\">Side</aside>"));
    assert!(!second.contains("Reply in exactly one of two shapes"));
}

// =============================================================================
// speculative iterations
// =============================================================================

#[tokio::test]
async fn directives_are_previewed_then_reverted() {
    let fx = Fixture::new(MockLlm::new([
        directive("node.set_style(\"color\", \"green\"); node.add_class(\"x\"); node.child_count()"),
        directive("node.remove_attr(\"id\"); let t = node.create_text(\"!\"); node.append_child(t);"),
        FINAL.to_owned(),
    ]));
    let doc = shared_sample();
    let before = markup(&doc);
    let mut session = Session::new(doc.clone());
    let title = by_id(&doc.lock(), "title");
    let (tx, _rx) = channel();

    let script = fx
        .driver()
        .resolve(&mut session, title, "style it", &CancellationToken::new(), &tx)
        .await
        .unwrap();
    assert_eq!(script, FINAL);
    assert_eq!(markup(&doc), before);

    let conversation = session.conversation();
    assert_eq!(conversation.len(), 6);
    let first_feedback = &conversation[2].content;
    assert!(first_feedback.starts_with("Iteration 1."));
    assert!(first_feedback.contains("Result: 1"));
    assert!(first_feedback.contains("<h1 id=\"title\" class=\"x\" style=\"color: green\">Hello</h1>"));
    // the second preview builds on the first; both are still live until resolution ends
    let second_feedback = &conversation[4].content;
    assert!(second_feedback.contains("Result: no return value"));
    assert!(second_feedback.contains("<h1 class=\"x\" style=\"color: green\">Hello!</h1>"));
}

#[tokio::test]
async fn invalid_directive_code_becomes_feedback() {
    let fx = Fixture::new(MockLlm::new([directive("eval(\"node.remove()\")"), directive("let x = ;"), FINAL.into()]));
    let doc = shared_sample();
    let before = markup(&doc);
    let mut session = Session::new(doc.clone());
    let intro = by_id(&doc.lock(), "intro");
    let (tx, _rx) = channel();

    let script = fx
        .driver()
        .resolve(&mut session, intro, "x", &CancellationToken::new(), &tx)
        .await
        .unwrap();
    assert_eq!(script, FINAL);
    assert_eq!(markup(&doc), before);

    let conversation = session.conversation();
    assert!(conversation[2].content.contains("not run because it is invalid"));
    assert!(conversation[2].content.contains("eval("));
    assert!(conversation[4].content.contains("syntax error"));
}

#[tokio::test]
async fn execution_errors_are_reported_back() {
    let fx = Fixture::new(MockLlm::new([directive("node.set_attr(\"lang\", \"en\"); let me = node; node.move_child(me, 0);"), FINAL.into()]));
    let doc = shared_sample();
    let before = markup(&doc);
    let mut session = Session::new(doc.clone());
    let list = by_id(&doc.lock(), "list");
    let (tx, _rx) = channel();

    fx.driver()
        .resolve(&mut session, list, "x", &CancellationToken::new(), &tx)
        .await
        .unwrap();

    let feedback = &session.conversation()[2].content;
    assert!(feedback.contains("Execution error:"));
    // the partial change is visible in the preview, then reverted
    assert!(feedback.contains("lang=\"en\""));
    assert_eq!(markup(&doc), before);
}

#[tokio::test]
async fn directive_removing_the_node_is_reverted_immediately() {
    let fx = Fixture::new(MockLlm::new([directive("node.remove();"), FINAL.into()]));
    let doc = shared_sample();
    let before = markup(&doc);
    let mut session = Session::new(doc.clone());
    let side = by_id(&doc.lock(), "side");
    let (tx, _rx) = channel();

    fx.driver()
        .resolve(&mut session, side, "x", &CancellationToken::new(), &tx)
        .await
        .unwrap();

    assert!(session.conversation()[2].content.contains("removed the element"));
    assert_eq!(markup(&doc), before);
}

#[tokio::test]
async fn iteration_limit_fails_and_reverts() {
    let step = directive("node.add_class(\"step\");");
    let fx = Fixture::new(MockLlm::new([step.clone(), step.clone(), step.clone(), step, FINAL.into()]));
    let doc = shared_sample();
    let before = markup(&doc);
    let mut session = Session::new(doc.clone());
    let intro = by_id(&doc.lock(), "intro");
    let (tx, _rx) = channel();

    let err = fx
        .driver()
        .resolve(&mut session, intro, "x", &CancellationToken::new(), &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, EditError::MaxIterations { limit: 3 }));
    assert_eq!(fx.llm.calls().len(), 4);
    assert_eq!(markup(&doc), before);
}

#[tokio::test]
async fn vanished_node_aborts_speculation() {
    let fx = Fixture::new(MockLlm::new([directive("node.add_class(\"x\");")]));
    let doc = shared_sample();
    let mut session = Session::new(doc.clone());
    let side = by_id(&doc.lock(), "side");
    doc.lock().apply(Mutation::Detach { node: side }).unwrap();
    let (tx, _rx) = channel();

    let err = fx
        .driver()
        .resolve(&mut session, side, "x", &CancellationToken::new(), &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, EditError::NodeVanished(id) if id == side));
    assert_eq!(doc.lock().attribute(side, "class").unwrap(), None);
}

// =============================================================================
// waiting: progress, cancellation, transport errors
// =============================================================================

#[tokio::test]
async fn progress_ticks_while_waiting() {
    let fx = Fixture::new(MockLlm::new([FINAL]).delayed(Duration::from_millis(80)));
    let mut session = Session::new(shared_sample());
    let title = by_id(&session.document().lock(), "title");
    let (tx, mut rx) = channel();

    fx.driver()
        .resolve(&mut session, title, "x", &CancellationToken::new(), &tx)
        .await
        .unwrap();

    let tick = rx.try_recv().unwrap();
    assert!(tick.starts_with(PROGRESS_PREFIX), "{tick}");
    assert!(tick.ends_with('s'));
}

#[tokio::test]
async fn cancellation_aborts_and_reverts_previews() {
    // the second call never answers
    let fx = Fixture::new(MockLlm::new([directive("node.set_attr(\"hidden\", \"\");")]));
    let doc = shared_sample();
    let before = markup(&doc);
    let mut session = Session::new(doc.clone());
    let intro = by_id(&doc.lock(), "intro");
    let (tx, _rx) = channel();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let err = fx
        .driver()
        .resolve(&mut session, intro, "x", &cancel, &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, EditError::Cancelled));
    assert_eq!(fx.llm.calls().len(), 2);
    assert_eq!(markup(&doc), before);
}

#[tokio::test]
async fn cancelled_token_stops_before_calling_out() {
    let fx = Fixture::new(MockLlm::new([FINAL]));
    let mut session = Session::new(shared_sample());
    let title = by_id(&session.document().lock(), "title");
    let (tx, _rx) = channel();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = fx.driver().resolve(&mut session, title, "x", &cancel, &tx).await.unwrap_err();
    assert!(matches!(err, EditError::Cancelled));
    assert!(fx.llm.calls().is_empty());
}

#[tokio::test]
async fn dropped_resolution_reverts_previews() {
    let fx = Fixture::new(MockLlm::new([directive("node.clear();")]));
    let doc = shared_sample();
    let before = markup(&doc);
    let mut session = Session::new(doc.clone());
    let list = by_id(&doc.lock(), "list");
    let (tx, _rx) = channel();
    let cancel = CancellationToken::new();

    let outcome = tokio::time::timeout(
        Duration::from_millis(50),
        fx.driver().resolve(&mut session, list, "x", &cancel, &tx),
    )
    .await;
    assert!(outcome.is_err());
    assert_eq!(markup(&doc), before);
}

#[tokio::test]
async fn generator_failure_surfaces() {
    let fx = Fixture::new(MockLlm::with_replies(vec![Reply::Fail(503)]));
    let mut session = Session::new(shared_sample());
    let title = by_id(&session.document().lock(), "title");
    let (tx, _rx) = channel();

    let err = fx
        .driver()
        .resolve(&mut session, title, "x", &CancellationToken::new(), &tx)
        .await
        .unwrap_err();
    assert!(matches!(err, EditError::Generator(LlmError::ApiResponse { status: 503, .. })));
    assert!(err.retryable());
    // the instruction stays in the conversation
    assert_eq!(session.conversation().len(), 1);
}
