//! Request orchestrator — resolves every target, then commits atomically.
//!
//! DESIGN
//! ======
//! A request is a prompt plus an ordered list of target nodes. Targets are
//! resolved one at a time through the iteration driver, so only one
//! generator exchange is ever in flight. Nothing touches the live tree for
//! real until every target has a final script.
//!
//! The commit (`commit_scripts`) is all-or-nothing: it re-checks that every
//! target is still in the document, then validates and runs each script in
//! order through a fresh recorder. The first validation failure, execution
//! error, or script that removes its own target rolls back every pass made
//! so far, in reverse order. Redo reuses the same commit.
//!
//! On success the ledger gets the composite transaction and the diff
//! artifact is built against each node's session baseline.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use super::iteration::{IterationDriver, report};
use super::ledger::Session;
use super::recorder::{CompositeTransaction, Recorder};
use super::sandbox::ScriptRuntime;
use super::validator::validate;
use crate::config::EditorConfig;
use crate::context::ContextBuilder;
use crate::doc::{NodeId, SharedDocument};
use crate::error::EditError;
use crate::llm::LlmChat;

// =============================================================================
// TYPES
// =============================================================================

/// A node's accepted final script. Committed scripts are stored sanitized.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AcceptedScript {
    pub node: NodeId,
    pub script: String,
}

/// Baseline and post-request markup of one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeDiff {
    pub node: NodeId,
    pub baseline: String,
    pub current: String,
}

impl NodeDiff {
    #[must_use]
    pub fn changed(&self) -> bool {
        self.baseline != self.current
    }
}

/// Result of a committed request, handed to delivery collaborators.
#[derive(Debug, Clone, Serialize)]
pub struct DiffArtifact {
    pub request_id: Uuid,
    pub nodes: Vec<NodeDiff>,
    /// Every prompt accepted in the session so far, oldest first.
    pub prompts: Vec<String>,
}

impl DiffArtifact {
    /// Markdown rendering: the prompt history, then before/after markup per
    /// element.
    #[must_use]
    pub fn to_markdown(&self) -> String {
        let mut out = String::from("## Requested changes\n\n");
        for (i, prompt) in self.prompts.iter().enumerate() {
            out.push_str(&format!("{}. {prompt}\n", i + 1));
        }
        for (i, diff) in self.nodes.iter().enumerate() {
            let status = if diff.changed() { "" } else { " (unchanged)" };
            out.push_str(&format!(
                "\n## Element {}{status}\n\n### Before\n\n```html\n{}\n```\n\n### After\n\n```html\n{}\n```\n",
                i + 1,
                diff.baseline,
                diff.current
            ));
        }
        out
    }
}

// =============================================================================
// COMMIT
// =============================================================================

/// Validate and run `scripts` against their nodes as one unit.
///
/// Returns the composite transaction and the sanitized scripts. On error the
/// document is left as it was before the call.
///
/// # Errors
///
/// Returns an [`EditError::AtNode`] wrapping `NodeVanished`, `Validation`,
/// or `Execution` for the first failing node.
pub fn commit_scripts(
    doc: &SharedDocument,
    runtime: &dyn ScriptRuntime,
    scripts: &[AcceptedScript],
) -> Result<(CompositeTransaction, Vec<AcceptedScript>), EditError> {
    {
        let live = doc.lock();
        if let Some((index, missing)) = scripts
            .iter()
            .enumerate()
            .find(|(_, s)| !live.is_connected(s.node))
        {
            return Err(EditError::NodeVanished(missing.node).at_node(index, missing.node));
        }
    }

    let mut transaction = CompositeTransaction::default();
    let mut committed = Vec::with_capacity(scripts.len());
    for (index, accepted) in scripts.iter().enumerate() {
        let node = accepted.node;
        let sanitized = match validate(runtime, &accepted.script).into_result() {
            Ok(sanitized) => sanitized,
            Err(e) => {
                rollback(transaction);
                return Err(EditError::Validation(e).at_node(index, node));
            }
        };

        let recorder = Recorder::new(doc.clone());
        let outcome = runtime.execute(&recorder, node, &sanitized);
        let pass = recorder.finish();
        let failure = match outcome {
            Err(message) => Some(EditError::Execution(message)),
            Ok(_) if !doc.lock().is_connected(node) => {
                Some(EditError::Execution("script removed the target element from the document".into()))
            }
            Ok(_) => None,
        };
        if let Some(error) = failure {
            transaction.push(node, pass);
            rollback(transaction);
            return Err(error.at_node(index, node));
        }

        transaction.push(node, pass);
        committed.push(AcceptedScript { node, script: sanitized });
    }
    Ok((transaction, committed))
}

fn rollback(transaction: CompositeTransaction) {
    let passes = transaction.len();
    if let Err(e) = transaction.revert() {
        warn!(passes, error = %e, "edit: commit rollback incomplete");
    }
}

// =============================================================================
// EDITOR
// =============================================================================

/// Entry point for edit requests.
pub struct Editor {
    llm: Arc<dyn LlmChat>,
    runtime: Arc<dyn ScriptRuntime>,
    context: Arc<dyn ContextBuilder>,
    config: EditorConfig,
}

impl Editor {
    #[must_use]
    pub fn new(
        llm: Arc<dyn LlmChat>,
        runtime: Arc<dyn ScriptRuntime>,
        context: Arc<dyn ContextBuilder>,
        config: EditorConfig,
    ) -> Self {
        Self { llm, runtime, context, config }
    }

    #[must_use]
    pub fn config(&self) -> &EditorConfig {
        &self.config
    }

    fn driver(&self) -> IterationDriver<'_> {
        IterationDriver {
            llm: self.llm.as_ref(),
            runtime: self.runtime.as_ref(),
            context: self.context.as_ref(),
            config: &self.config,
        }
    }

    /// Resolve `prompt` for each target in order, then commit all of them or
    /// none. Progress messages go to `progress`; `cancel` aborts the
    /// outstanding generator exchange.
    ///
    /// # Errors
    ///
    /// Returns `EmptyPrompt` or `NoTargets` up front; otherwise the first
    /// resolution or commit failure, attributed to its node. The document is
    /// unchanged on every error.
    pub async fn run_request(
        &self,
        session: &mut Session,
        prompt: &str,
        targets: &[NodeId],
        cancel: &CancellationToken,
        progress: &mpsc::Sender<String>,
    ) -> Result<DiffArtifact, EditError> {
        let prompt = prompt.trim();
        if prompt.is_empty() {
            return Err(EditError::EmptyPrompt);
        }
        let mut seen = HashSet::new();
        let targets: Vec<NodeId> = targets.iter().copied().filter(|id| seen.insert(*id)).collect();
        if targets.is_empty() {
            return Err(EditError::NoTargets);
        }

        let request_id = Uuid::new_v4();
        info!(session = %session.id(), %request_id, targets = targets.len(), prompt_len = prompt.len(), "edit: request received");

        for (index, node) in targets.iter().copied().enumerate() {
            if !session.document().lock().is_connected(node) {
                return Err(EditError::NodeVanished(node).at_node(index, node));
            }
            session.baseline(node).map_err(|e| EditError::from(e).at_node(index, node))?;
        }

        let mut accepted = Vec::with_capacity(targets.len());
        for (index, node) in targets.iter().copied().enumerate() {
            report(progress, format!("Working on element {} of {}", index + 1, targets.len()));
            let script = self
                .driver()
                .resolve(session, node, prompt, cancel, progress)
                .await
                .map_err(|e| {
                    warn!(%request_id, %node, error = %e, "edit: resolution failed");
                    e.at_node(index, node)
                })?;
            accepted.push(AcceptedScript { node, script });
        }

        let (transaction, scripts) = commit_scripts(session.document(), self.runtime.as_ref(), &accepted)
            .inspect_err(|e| warn!(%request_id, error = %e, "edit: commit failed"))?;
        session.append_prompt(prompt);
        session.push_committed(request_id, scripts, transaction);
        info!(%request_id, undo_depth = session.undo_depth(), "edit: request committed");

        let mut nodes = Vec::with_capacity(targets.len());
        for node in targets {
            let baseline = session.baseline(node)?;
            let current = session.document().lock().outer_markup(node)?;
            nodes.push(NodeDiff { node, baseline, current });
        }
        Ok(DiffArtifact { request_id, nodes, prompts: session.prompts().to_vec() })
    }

    /// Revert the session's most recent request.
    ///
    /// # Errors
    ///
    /// See [`Session::undo`].
    pub fn undo(&self, session: &mut Session) -> Result<Option<Uuid>, EditError> {
        session.undo()
    }

    /// Re-apply the most recently undone request.
    ///
    /// # Errors
    ///
    /// See [`Session::redo`].
    pub fn redo(&self, session: &mut Session) -> Result<Option<Uuid>, EditError> {
        session.redo(self.runtime.as_ref())
    }

    #[must_use]
    pub fn can_undo(&self, session: &Session) -> bool {
        session.can_undo()
    }

    #[must_use]
    pub fn can_redo(&self, session: &Session) -> bool {
        session.can_redo()
    }
}

#[cfg(test)]
#[path = "orchestrator_test.rs"]
mod tests;
