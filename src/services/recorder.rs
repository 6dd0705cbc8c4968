//! Mutation recorder — pairs every document change with its inverse.
//!
//! DESIGN
//! ======
//! A `Recorder` is created for one apply-pass of one script against one
//! node. Every mutation the script performs goes through `Recorder::record`,
//! which applies it and appends the returned inverse to the pass log. The
//! inverse is only logged after the mutation succeeded, so a failing
//! mutation leaves both the tree and the log as they were, and everything
//! recorded before it stays invertible.
//!
//! `RecordedPass::undo` replays the log newest-first: later mutations may
//! depend on structure created by earlier ones.
//!
//! Nodes a pass creates are tracked too. Once its inverses have run, undo
//! drops the pass's created nodes from the arena, so speculative and
//! rolled-back passes leave no orphans behind.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::warn;

use crate::doc::{DocError, Mutation, NodeId, SharedDocument};

// =============================================================================
// RECORDER
// =============================================================================

/// Records inverses for one apply-pass. Clones share the same log.
#[derive(Debug, Clone)]
pub struct Recorder {
    doc: SharedDocument,
    log: Arc<Mutex<Vec<Mutation>>>,
    created: Arc<Mutex<Vec<NodeId>>>,
}

impl Recorder {
    #[must_use]
    pub fn new(doc: SharedDocument) -> Self {
        Self { doc, log: Arc::new(Mutex::new(Vec::new())), created: Arc::new(Mutex::new(Vec::new())) }
    }

    #[must_use]
    pub fn document(&self) -> &SharedDocument {
        &self.doc
    }

    /// Apply `mutation` and log its inverse.
    ///
    /// # Errors
    ///
    /// Returns the document error unchanged; nothing is logged in that case.
    pub fn record(&self, mutation: Mutation) -> Result<(), DocError> {
        let inverse = self.doc.lock().apply(mutation)?;
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(inverse);
        Ok(())
    }

    /// Create a detached element owned by this pass.
    ///
    /// # Errors
    ///
    /// Returns [`DocError::InvalidName`] for an unusable tag.
    pub fn create_element(&self, tag: &str) -> Result<NodeId, DocError> {
        let id = self.doc.lock().create_element(tag)?;
        self.track(id);
        Ok(id)
    }

    /// Create a detached text node owned by this pass.
    pub fn create_text(&self, text: &str) -> NodeId {
        let id = self.doc.lock().create_text(text);
        self.track(id);
        id
    }

    fn track(&self, id: NodeId) {
        self.created
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(id);
    }

    /// Number of mutations recorded so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.log.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the pass and take its inverse log.
    #[must_use]
    pub fn finish(self) -> RecordedPass {
        let inverses = std::mem::take(&mut *self.log.lock().unwrap_or_else(PoisonError::into_inner));
        let created = std::mem::take(&mut *self.created.lock().unwrap_or_else(PoisonError::into_inner));
        RecordedPass { doc: self.doc, inverses, created }
    }
}

// =============================================================================
// RECORDED PASS
// =============================================================================

/// The inverse log of a finished pass.
#[derive(Debug)]
pub struct RecordedPass {
    doc: SharedDocument,
    inverses: Vec<Mutation>,
    created: Vec<NodeId>,
}

impl RecordedPass {
    #[must_use]
    pub fn len(&self) -> usize {
        self.inverses.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inverses.is_empty()
    }

    /// Replay the inverses newest-first, restoring the pre-pass state, then
    /// drop the nodes the pass created. A created node that is still
    /// attached or still has children after a failed inverse is kept.
    ///
    /// Keeps going past a failing inverse so as much state as possible is
    /// restored, then reports the first failure.
    ///
    /// # Errors
    ///
    /// Returns the first [`DocError`] encountered.
    pub fn undo(self) -> Result<(), DocError> {
        let mut doc = self.doc.lock();
        let mut first_error = None;
        for inverse in self.inverses.into_iter().rev() {
            let target = inverse.target();
            if let Err(e) = doc.apply(inverse) {
                warn!(node = %target, error = %e, "recorder: inverse failed");
                first_error.get_or_insert(e);
            }
        }
        let kept = self.created.into_iter().rev().filter(|id| !doc.discard(*id)).count();
        if kept > 0 {
            warn!(kept, "recorder: created nodes left in the arena");
        }
        first_error.map_or(Ok(()), Err)
    }
}

// =============================================================================
// COMPOSITE TRANSACTION
// =============================================================================

/// Passes for all nodes of one request, in commit order.
#[derive(Debug, Default)]
pub struct CompositeTransaction {
    passes: Vec<(NodeId, RecordedPass)>,
}

impl CompositeTransaction {
    pub fn push(&mut self, node: NodeId, pass: RecordedPass) {
        self.passes.push((node, pass));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Nodes covered, in commit order.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.passes.iter().map(|(node, _)| *node)
    }

    /// Undo every pass, last-committed first.
    ///
    /// # Errors
    ///
    /// Returns the first [`DocError`]; remaining passes are still undone.
    pub fn revert(self) -> Result<(), DocError> {
        let mut first_error = None;
        for (node, pass) in self.passes.into_iter().rev() {
            if let Err(e) = pass.undo() {
                warn!(%node, error = %e, "recorder: composite revert incomplete");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

// =============================================================================
// SPECULATIVE ROLLBACK
// =============================================================================

/// Scope guard over speculative passes.
///
/// `rollback` is called on every normal exit. `Drop` performs the same
/// revert, which covers a resolution future dropped mid-await.
#[derive(Debug, Default)]
pub struct SpeculativeRollback {
    passes: Vec<RecordedPass>,
}

impl SpeculativeRollback {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, pass: RecordedPass) {
        self.passes.push(pass);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.passes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.passes.is_empty()
    }

    /// Undo all speculative passes, newest first. Returns how many were undone.
    pub fn rollback(&mut self) -> usize {
        let count = self.passes.len();
        while let Some(pass) = self.passes.pop() {
            if let Err(e) = pass.undo() {
                warn!(error = %e, "recorder: speculative rollback incomplete");
            }
        }
        count
    }
}

impl Drop for SpeculativeRollback {
    fn drop(&mut self) {
        if !self.passes.is_empty() {
            warn!(passes = self.passes.len(), "recorder: reverting speculative passes on drop");
            self.rollback();
        }
    }
}

#[cfg(test)]
#[path = "recorder_test.rs"]
mod tests;
