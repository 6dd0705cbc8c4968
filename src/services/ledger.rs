//! Session ledger — per-session history, baselines, and undo/redo stacks.
//!
//! DESIGN
//! ======
//! The ledger is bookkeeping only. It records prompts and the generator
//! conversation, pins each node's baseline markup the first time the node is
//! touched, and keeps two stacks of committed requests.
//!
//! Undo replays a request's composite transaction and moves the request to
//! the redo stack. Redo does not restore a snapshot: it re-runs the request's
//! accepted scripts through the same atomic commit as a fresh request, so it
//! fails cleanly if a target has left the document. A failed redo leaves the
//! request on the redo stack.

use std::collections::{HashMap, HashSet};

use tracing::{info, warn};
use uuid::Uuid;

use super::orchestrator::{AcceptedScript, commit_scripts};
use super::recorder::CompositeTransaction;
use super::sandbox::ScriptRuntime;
use crate::doc::{DocError, NodeId, SharedDocument};
use crate::error::EditError;
use crate::llm::types::Message;

/// A request on the undo stack: its scripts and the inverses of their run.
#[derive(Debug)]
struct CommittedRequest {
    request_id: Uuid,
    scripts: Vec<AcceptedScript>,
    transaction: CompositeTransaction,
}

/// A request on the redo stack.
#[derive(Debug)]
struct UndoneRequest {
    request_id: Uuid,
    scripts: Vec<AcceptedScript>,
}

#[derive(Debug)]
pub struct Session {
    id: Uuid,
    doc: SharedDocument,
    prompts: Vec<String>,
    conversation: Vec<Message>,
    baselines: HashMap<NodeId, String>,
    introduced: HashSet<NodeId>,
    undo_stack: Vec<CommittedRequest>,
    redo_stack: Vec<UndoneRequest>,
}

impl Session {
    #[must_use]
    pub fn new(doc: SharedDocument) -> Self {
        Self {
            id: Uuid::new_v4(),
            doc,
            prompts: Vec::new(),
            conversation: Vec::new(),
            baselines: HashMap::new(),
            introduced: HashSet::new(),
            undo_stack: Vec::new(),
            redo_stack: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    // =========================================================================
    // HISTORY
    // =========================================================================

    pub fn append_prompt(&mut self, prompt: impl Into<String>) {
        self.prompts.push(prompt.into());
    }

    #[must_use]
    pub fn prompts(&self) -> &[String] {
        &self.prompts
    }

    pub fn append_message(&mut self, message: Message) {
        self.conversation.push(message);
    }

    #[must_use]
    pub fn conversation(&self) -> &[Message] {
        &self.conversation
    }

    /// Mark `node` as described to the generator. Returns `true` the first
    /// time a node is introduced in this session.
    pub fn introduce(&mut self, node: NodeId) -> bool {
        self.introduced.insert(node)
    }

    // =========================================================================
    // BASELINES
    // =========================================================================

    /// Markup of `node` as it was when first touched in this session.
    /// Captured on the first call; later calls return the stored copy.
    ///
    /// # Errors
    ///
    /// Returns a [`DocError`] if the node has no baseline yet and cannot be
    /// serialized.
    pub fn baseline(&mut self, node: NodeId) -> Result<String, DocError> {
        if let Some(markup) = self.baselines.get(&node) {
            return Ok(markup.clone());
        }
        let markup = self.doc.lock().outer_markup(node)?;
        self.baselines.insert(node, markup.clone());
        Ok(markup)
    }

    /// The stored baseline, if `node` has been touched.
    #[must_use]
    pub fn baseline_of(&self, node: NodeId) -> Option<&str> {
        self.baselines.get(&node).map(String::as_str)
    }

    // =========================================================================
    // UNDO / REDO
    // =========================================================================

    /// Push a freshly committed request. Clears the redo stack.
    pub fn push_committed(&mut self, request_id: Uuid, scripts: Vec<AcceptedScript>, transaction: CompositeTransaction) {
        if !self.redo_stack.is_empty() {
            info!(session = %self.id, dropped = self.redo_stack.len(), "ledger: redo history cleared");
            self.redo_stack.clear();
        }
        self.undo_stack.push(CommittedRequest { request_id, scripts, transaction });
    }

    /// Revert the most recent request. Returns its id, or `None` when there is
    /// nothing to undo. The request moves to the redo stack even when an
    /// inverse fails.
    ///
    /// # Errors
    ///
    /// Returns [`EditError::PartialUndo`] if any inverse could not be applied.
    pub fn undo(&mut self) -> Result<Option<Uuid>, EditError> {
        let Some(entry) = self.undo_stack.pop() else {
            return Ok(None);
        };
        let CommittedRequest { request_id, scripts, transaction } = entry;
        let result = transaction.revert();
        self.redo_stack.push(UndoneRequest { request_id, scripts });
        match result {
            Ok(()) => {
                info!(session = %self.id, %request_id, "ledger: undo");
                Ok(Some(request_id))
            }
            Err(source) => {
                warn!(session = %self.id, %request_id, error = %source, "ledger: undo incomplete");
                Err(EditError::PartialUndo { request_id, source })
            }
        }
    }

    /// Re-run the most recently undone request's scripts. Returns its id, or
    /// `None` when there is nothing to redo.
    ///
    /// # Errors
    ///
    /// Returns the commit error; the request stays on the redo stack and the
    /// document is left as it was.
    pub fn redo(&mut self, runtime: &dyn ScriptRuntime) -> Result<Option<Uuid>, EditError> {
        let Some(entry) = self.redo_stack.pop() else {
            return Ok(None);
        };
        match commit_scripts(&self.doc, runtime, &entry.scripts) {
            Ok((transaction, scripts)) => {
                info!(session = %self.id, request_id = %entry.request_id, "ledger: redo");
                let request_id = entry.request_id;
                self.undo_stack.push(CommittedRequest { request_id, scripts, transaction });
                Ok(Some(request_id))
            }
            Err(e) => {
                warn!(session = %self.id, request_id = %entry.request_id, error = %e, "ledger: redo failed");
                self.redo_stack.push(entry);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn can_undo(&self) -> bool {
        !self.undo_stack.is_empty()
    }

    #[must_use]
    pub fn can_redo(&self) -> bool {
        !self.redo_stack.is_empty()
    }

    #[must_use]
    pub fn undo_depth(&self) -> usize {
        self.undo_stack.len()
    }

    #[must_use]
    pub fn redo_depth(&self) -> usize {
        self.redo_stack.len()
    }
}

#[cfg(test)]
#[path = "ledger_test.rs"]
mod tests;
