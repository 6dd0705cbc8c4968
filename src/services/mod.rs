//! Edit engine services: recording, validation, iteration, and commit.
//!
//! ARCHITECTURE
//! ============
//! `orchestrator` owns the request lifecycle and drives `iteration` once per
//! target. Scripts pass through `validator` before `sandbox` runs them, and
//! every sandbox mutation goes through a `recorder` so it can be undone.
//! `ledger` keeps per-session history and the undo/redo stacks.

pub mod iteration;
pub mod ledger;
pub mod orchestrator;
pub mod recorder;
pub mod response;
pub mod sandbox;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_helpers;
