//! Request-level error taxonomy and stable error codes.
//!
//! Every layer owns a `thiserror` enum; `EditError` is what callers of the
//! editor see. `ErrorCode` gives each variant a stable `E_*` code for
//! delivery surfaces that should not match on display strings.

use uuid::Uuid;

use crate::doc::{DocError, NodeId};
use crate::llm::types::LlmError;
use crate::services::validator::ValidationError;

pub trait ErrorCode: std::fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EditError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("no target elements selected")]
    NoTargets,
    #[error("element {0} is no longer in the document")]
    NodeVanished(NodeId),
    #[error("generator error: {0}")]
    Generator(#[from] LlmError),
    #[error("request cancelled")]
    Cancelled,
    #[error("generator did not produce a final script within {limit} iterations")]
    MaxIterations { limit: usize },
    #[error("script rejected: {0}")]
    Validation(#[from] ValidationError),
    #[error("script failed: {0}")]
    Execution(String),
    #[error("document error: {0}")]
    Document(#[from] DocError),
    #[error("element {position} ({node}): {source}")]
    AtNode {
        /// 1-based position of the element in the request.
        position: usize,
        node: NodeId,
        #[source]
        source: Box<EditError>,
    },
    #[error("undo of request {request_id} was incomplete: {source}")]
    PartialUndo {
        request_id: Uuid,
        #[source]
        source: DocError,
    },
}

impl EditError {
    /// Attribute this error to the element at `index` (0-based) of a request.
    #[must_use]
    pub fn at_node(self, index: usize, node: NodeId) -> Self {
        match self {
            already @ Self::AtNode { .. } => already,
            other => Self::AtNode { position: index + 1, node, source: Box::new(other) },
        }
    }

    /// The underlying error with any node attribution removed.
    #[must_use]
    pub fn root_cause(&self) -> &Self {
        match self {
            Self::AtNode { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl ErrorCode for EditError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyPrompt => "E_EMPTY_PROMPT",
            Self::NoTargets => "E_NO_TARGETS",
            Self::NodeVanished(_) => "E_NODE_VANISHED",
            Self::Generator(_) => "E_GENERATOR",
            Self::Cancelled => "E_CANCELLED",
            Self::MaxIterations { .. } => "E_MAX_ITERATIONS",
            Self::Validation(_) => "E_VALIDATION",
            Self::Execution(_) => "E_EXECUTION",
            Self::Document(e) => e.error_code(),
            Self::AtNode { source, .. } => source.error_code(),
            Self::PartialUndo { .. } => "E_PARTIAL_UNDO",
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Generator(e) => e.retryable(),
            Self::AtNode { source, .. } => source.retryable(),
            _ => false,
        }
    }
}
