use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::config::EditorConfig;
use crate::context::AncestorContext;
use crate::llm::LlmChat;
use crate::llm::types::{ChatResponse, ContentBlock, LlmError, Message};
use crate::services::orchestrator::Editor;
use crate::services::sandbox::RhaiRuntime;

// =========================================================================
// MockLlm
// =========================================================================

pub(crate) enum Reply {
    Text(String),
    Fail(u16),
}

/// Scripted generator. Replies are served in order; once they run out,
/// calls never complete.
pub(crate) struct MockLlm {
    replies: Mutex<VecDeque<Reply>>,
    calls: Mutex<Vec<Vec<Message>>>,
    delay: Duration,
}

impl MockLlm {
    pub(crate) fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::with_replies(replies.into_iter().map(|r| Reply::Text(r.into())).collect())
    }

    pub(crate) fn with_replies(replies: Vec<Reply>) -> Self {
        Self { replies: Mutex::new(replies.into()), calls: Mutex::new(Vec::new()), delay: Duration::ZERO }
    }

    pub(crate) fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Message lists received, one per call.
    pub(crate) fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

#[async_trait::async_trait]
impl LlmChat for MockLlm {
    async fn chat(&self, _max_tokens: u32, _system: &str, messages: &[Message]) -> Result<ChatResponse, LlmError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(messages.to_vec());
        let next = self
            .replies
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match next {
            Some(Reply::Text(text)) => Ok(ChatResponse {
                content: vec![ContentBlock::Text { text }],
                model: "mock".into(),
                stop_reason: "end_turn".into(),
                input_tokens: 0,
                output_tokens: 0,
            }),
            Some(Reply::Fail(status)) => Err(LlmError::ApiResponse { status, body: "mock failure".into() }),
            None => std::future::pending().await,
        }
    }
}

/// An iterate-directive reply running `code`.
pub(crate) fn directive(code: &str) -> String {
    serde_json::json!({ "iterate": true, "code": code, "reason": "preview" }).to_string()
}

pub(crate) fn test_config() -> EditorConfig {
    EditorConfig { max_iterations: 3, progress_interval: Duration::from_millis(10), ..EditorConfig::default() }
}

pub(crate) fn test_editor(llm: Arc<MockLlm>) -> Editor {
    Editor::new(llm, Arc::new(RhaiRuntime::default()), Arc::new(AncestorContext::default()), test_config())
}
