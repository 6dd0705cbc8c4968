//! Iteration protocol driver — resolves one node to a final script.
//!
//! DESIGN
//! ======
//! For each target node the driver talks to the generator until it answers
//! with a final script. The generator may instead send iterate-directives:
//! code that is validated, run against the live node through a fresh
//! recorder, and reported back (result or error, plus the node's markup).
//! Invalid directive code is reported back as feedback and does not abort.
//!
//! Directive runs are exploration only. Their passes collect in a
//! `SpeculativeRollback` that is rolled back before `resolve` returns,
//! whatever the outcome, and again on drop if the resolution future is
//! abandoned mid-await. A directive that removes the node from the
//! document is reverted on the spot.
//!
//! Waiting on the generator is the only suspension point. The wait emits
//! "still waiting" progress ticks and stops immediately on cancellation.

use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ledger::Session;
use super::recorder::{Recorder, SpeculativeRollback};
use super::response::AgentResponse;
use super::sandbox::ScriptRuntime;
use super::validator::validate;
use crate::config::EditorConfig;
use crate::context::ContextBuilder;
use crate::doc::NodeId;
use crate::error::EditError;
use crate::llm::LlmChat;
use crate::llm::types::{ChatResponse, Message};

// =============================================================================
// PROMPTS
// =============================================================================

pub const SYSTEM_PROMPT: &str = "\
You edit elements of a live HTML document by writing Rhai scripts.

A script runs with one variable in scope, `node`, the selected element. \
Strings use double quotes. The script's last expression is its result.

Node methods:
- reads: tag(), id(), attr(name), has_attr(name), attrs(), style(property), \
text(), markup(), parent(), children(), child_count(), find_all(tag), is_connected()
- attributes: set_attr(name, value), remove_attr(name), add_class(name), \
remove_class(name), toggle_class(name)
- presentation: set_style(property, value), remove_style(property)
- custom data: set_data(key, value), remove_data(key) (stored as data-* attributes)
- structure: create_element(tag), create_text(text), append_child(child), \
prepend_child(child), insert_child(index, child), insert_before(new, reference), \
remove_child(child), replace_child(new, old), move_child(child, index), remove(), \
replace_with(other), set_text(text), clear()

Use set_style for inline styles; the style attribute cannot be set directly. \
There is no network, cookie, or eval access. Keep the selected element in the \
document: do not remove or replace it.";

const RESPONSE_FORMAT: &str = "\
Reply in exactly one of two shapes:
1. Final script: only the Rhai script that performs the edit. It is applied for real.
2. Iterate-directive: only a JSON object \
{\"iterate\": true, \"code\": \"<rhai script>\", \"reason\": \"<why>\"}. \
The code runs against the element, you receive its result and the element's \
resulting markup, and the change is discarded. Use this to inspect the element \
or preview an approach before sending the final script.";

pub const PROGRESS_PREFIX: &str = "Waiting for generator...";

// =============================================================================
// DRIVER
// =============================================================================

pub struct IterationDriver<'a> {
    pub llm: &'a dyn LlmChat,
    pub runtime: &'a dyn ScriptRuntime,
    pub context: &'a dyn ContextBuilder,
    pub config: &'a EditorConfig,
}

impl IterationDriver<'_> {
    /// Exchange messages with the generator until it sends a final script for
    /// `node`. Every speculative change is reverted before this returns.
    ///
    /// # Errors
    ///
    /// Returns [`EditError::Cancelled`], [`EditError::Generator`],
    /// [`EditError::MaxIterations`], or [`EditError::NodeVanished`].
    pub async fn resolve(
        &self,
        session: &mut Session,
        node: NodeId,
        prompt: &str,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<String>,
    ) -> Result<String, EditError> {
        let mut speculative = SpeculativeRollback::new();
        let result = self
            .run(session, node, prompt, cancel, progress, &mut speculative)
            .await;
        let reverted = speculative.rollback();
        if reverted > 0 {
            debug!(%node, passes = reverted, "edit: speculative passes reverted");
        }
        result
    }

    async fn run(
        &self,
        session: &mut Session,
        node: NodeId,
        prompt: &str,
        cancel: &CancellationToken,
        progress: &mpsc::Sender<String>,
        speculative: &mut SpeculativeRollback,
    ) -> Result<String, EditError> {
        let mut outgoing = self.opening_message(session, node, prompt)?;
        let mut iterations = 0;
        loop {
            session.append_message(Message::user(outgoing));
            let reply = self.exchange(session.conversation(), cancel, progress).await?;
            let text = reply.text();
            session.append_message(Message::assistant(text.clone()));

            match AgentResponse::parse(&text) {
                AgentResponse::Final(script) => {
                    info!(%node, iterations, "edit: final script received");
                    return Ok(script);
                }
                AgentResponse::Iterate { code, reason } => {
                    iterations += 1;
                    if iterations > self.config.max_iterations {
                        warn!(%node, limit = self.config.max_iterations, "edit: iteration limit reached");
                        return Err(EditError::MaxIterations { limit: self.config.max_iterations });
                    }
                    info!(%node, iteration = iterations, %reason, "edit: speculative step");
                    outgoing = self.speculate(session, node, &code, iterations, speculative)?;
                }
            }
        }
    }

    /// First message for `node` in this request: the response-shape
    /// explanation on the session's first message, the node's context the
    /// first time the node is addressed, then the instruction.
    fn opening_message(&self, session: &mut Session, node: NodeId, prompt: &str) -> Result<String, EditError> {
        let mut parts = Vec::new();
        if session.conversation().is_empty() {
            parts.push(RESPONSE_FORMAT.to_owned());
        }
        if session.introduce(node) {
            let context = self.context.describe(&session.document().lock(), node)?;
            parts.push(format!(
                "Selected element (marked in its surrounding markup):\n```html\n{context}\n```"
            ));
        }
        parts.push(format!("Instruction: {prompt}"));
        Ok(parts.join("\n\n"))
    }

    /// Run one directive and build the feedback message for the generator.
    fn speculate(
        &self,
        session: &Session,
        node: NodeId,
        code: &str,
        iteration: usize,
        speculative: &mut SpeculativeRollback,
    ) -> Result<String, EditError> {
        let doc = session.document();
        if !doc.lock().is_connected(node) {
            return Err(EditError::NodeVanished(node));
        }

        let validation = validate(self.runtime, code);
        if let Some(error) = validation.error {
            debug!(%node, iteration, %error, "edit: directive rejected");
            return Ok(format!(
                "Iteration {iteration}: your code was not run because it is invalid: {error}\n\
                 Fix it and send another iterate-directive or the final script."
            ));
        }

        let recorder = Recorder::new(doc.clone());
        let outcome = self.runtime.execute(&recorder, node, &validation.sanitized);
        let pass = recorder.finish();

        if !doc.lock().is_connected(node) {
            warn!(%node, iteration, "edit: directive removed the element; reverting");
            if let Err(e) = pass.undo() {
                warn!(%node, error = %e, "edit: revert of removing directive incomplete");
            }
            return Ok(format!(
                "Iteration {iteration}: your code removed the element from the document, so the change \
                 was reverted. The element must stay in the document."
            ));
        }
        speculative.push(pass);

        let markup = doc.lock().outer_markup(node)?;
        let result = match outcome {
            Ok(value) => format!("Result: {value}"),
            Err(error) => format!("Execution error: {error}"),
        };
        Ok(format!(
            "Iteration {iteration}.\n{result}\nElement markup after running your code:\n```html\n{markup}\n```\n\
             This preview will be discarded. Send another iterate-directive or the final script."
        ))
    }

    /// Await the generator, ticking progress until it answers or `cancel` fires.
    async fn exchange(
        &self,
        messages: &[Message],
        cancel: &CancellationToken,
        progress: &mpsc::Sender<String>,
    ) -> Result<ChatResponse, EditError> {
        let started = Instant::now();
        let call = self.llm.chat(self.config.max_tokens, SYSTEM_PROMPT, messages);
        tokio::pin!(call);

        let period = self.config.progress_interval.max(Duration::from_millis(1));
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    info!("edit: generator exchange cancelled");
                    return Err(EditError::Cancelled);
                }
                result = &mut call => return result.map_err(EditError::from),
                _ = ticker.tick() => {
                    let secs = started.elapsed().as_secs();
                    report(progress, format!("{PROGRESS_PREFIX} {secs}s"));
                }
            }
        }
    }
}

/// Best-effort progress delivery; a full or closed channel drops the message.
pub(crate) fn report(progress: &mpsc::Sender<String>, message: String) {
    if let Err(e) = progress.try_send(message) {
        debug!(error = %e, "edit: progress message dropped");
    }
}

#[cfg(test)]
#[path = "iteration_test.rs"]
mod tests;
