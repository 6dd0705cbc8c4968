//! Context builder — renders a node and its nearest ancestors for prompts.
//!
//! The generator never sees the whole document. It gets the selected node's
//! full markup wrapped in up to `max_depth` ancestor tags, with a marker
//! comment in front of the selection. The text is used verbatim in prompts.

use crate::doc::{DocError, Document, NodeId};

/// Marker placed directly before the selected node's markup.
pub const SELECTED_MARKER: &str = "<!-- selected element -->";

pub trait ContextBuilder: Send + Sync {
    /// Serialize `node` with its bounded ancestor chain.
    ///
    /// # Errors
    ///
    /// Returns a [`DocError`] if `node` is not in the document.
    fn describe(&self, doc: &Document, node: NodeId) -> Result<String, DocError>;
}

#[derive(Debug, Clone, Copy)]
pub struct AncestorContext {
    pub max_depth: usize,
}

impl Default for AncestorContext {
    fn default() -> Self {
        Self { max_depth: crate::config::DEFAULT_CONTEXT_DEPTH }
    }
}

impl ContextBuilder for AncestorContext {
    fn describe(&self, doc: &Document, node: NodeId) -> Result<String, DocError> {
        let mut ancestors = Vec::new();
        let mut current = doc.parent(node)?;
        while let Some(id) = current {
            if ancestors.len() == self.max_depth {
                break;
            }
            ancestors.push(id);
            current = doc.parent(id)?;
        }
        ancestors.reverse();

        let mut out = String::new();
        for (depth, id) in ancestors.iter().enumerate() {
            out.push_str(&indent(depth));
            out.push_str(&doc.open_tag(*id)?);
            out.push('\n');
        }
        let depth = ancestors.len();
        out.push_str(&indent(depth));
        out.push_str(SELECTED_MARKER);
        out.push('\n');
        out.push_str(&indent(depth));
        out.push_str(&doc.outer_markup(node)?);
        for (depth, id) in ancestors.iter().enumerate().rev() {
            let tag = doc.node(*id)?.tag().unwrap_or_default();
            out.push('\n');
            out.push_str(&indent(depth));
            out.push_str("</");
            out.push_str(tag);
            out.push('>');
        }
        Ok(out)
    }
}

fn indent(depth: usize) -> String {
    "  ".repeat(depth)
}

#[cfg(test)]
#[path = "context_test.rs"]
mod tests;
