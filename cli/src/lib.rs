//! Imagetest CLI library.
//!
//! Thin front-end over the runtime crate: loads a YAML tests-spec,
//! runs the orchestrator, and renders diagnostics.

pub mod commands;
