//! Agent-driven element editing for a live HTML document.
//!
//! A caller selects elements, writes a natural-language instruction, and the
//! editor asks a remote generator for a script per element. Scripts run in a
//! sandbox against a recorded document, so every change can be previewed,
//! rolled back, undone, and redone.
//!
//! ## Module layout
//!
//! | Module | Role |
//! |--------|------|
//! | [`doc`] | Document tree, mutations, and markup rendering |
//! | [`context`] | Ancestor context shown to the generator |
//! | [`services`] | Recorder, validator, sandbox, iteration driver, orchestrator, ledger |
//! | [`llm`] | Generator clients (Anthropic, `OpenAI`) |
//! | [`config`] | Editor tunables from the environment |
//! | [`error`] | Request error taxonomy and error codes |

pub mod config;
pub mod context;
pub mod doc;
pub mod error;
pub mod llm;
pub mod services;

pub use config::EditorConfig;
pub use context::AncestorContext;
pub use doc::{Document, NodeId, NodeSpec, SharedDocument};
pub use error::{EditError, ErrorCode};
pub use llm::LlmClient;
pub use services::ledger::Session;
pub use services::orchestrator::{DiffArtifact, Editor};
pub use services::sandbox::RhaiRuntime;
