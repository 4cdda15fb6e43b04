//! CoachAI is a terminal client for chatting with AI coaching personas.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the free-tier quota gate, the conversation protocol that
//!   turns a persona and its history into completion requests, the
//!   per-conversation session controller, the persona catalog, entitlements
//!   and persistence.
//! - [`api`] defines the OpenAI-compatible chat completion payloads.
//! - [`cli`] parses arguments and runs the one-shot and interactive commands.
//! - [`logging`] sets up diagnostics and the optional transcript file.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`], which bootstraps [`core::app::App`] and
//! dispatches to the command handlers.

pub mod api;
pub mod cli;
pub mod core;
pub mod logging;
