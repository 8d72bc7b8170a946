//! # conductor
//!
//! Execution engine for declarative AI agent graphs.
//!
//! An *agent* is a typed, declarative unit of execution: an LLM prompt,
//! a tool-routing decision loop, sandboxed logic, an HTTP call, an image
//! generation, a composition of other agents, or a bridge to an external
//! platform or protocol server. This crate executes those definitions -
//! it does not author, persist or transport them.
//!
//! ## Architecture
//!
//! ```text
//!        ┌───────────────────────────────────┐
//!        │            Dispatcher             │
//!        │  (kind → strategy, identity       │
//!        │   inheritance, depth guard)       │
//!        └────────────────┬──────────────────┘
//!                         │
//!                         ▼
//!        ┌───────────────────────────────────┐
//!        │         Executor lifecycle        │
//!        │  inputs → cache → strategy →      │
//!        │  validate → memory → events       │
//!        └────────────────┬──────────────────┘
//!                         │
//!          ┌──────────────┼───────────────┐
//!          ▼              ▼               ▼
//!     LLM / Router    Function /     Call-Agent /
//!     strategies      HTTP / Image   Parallel / ...
//! ```
//!
//! ## Execution flow
//! 1. The host resolves an [`AgentDefinition`] and builds an
//!    [`ExecutionContext`] from its collaborators (model backends, agent
//!    resolver, memory, secrets, cache, platforms, event sink)
//! 2. [`Dispatcher::execute`](engine::dispatcher::Dispatcher::execute)
//!    runs the definition; nested agent references recurse through the
//!    dispatcher as child tasks
//! 3. Progress streams continuously to the event sink; the validated
//!    output object returns up the call stack
//!
//! ## Modules
//! - `definition`: the declarative agent model
//! - `engine`: dispatcher, executor lifecycle, context, events, cache,
//!   schemas, task ids, secret scanning
//! - `strategies`: one execution strategy per agent kind
//! - `llm`, `memory`, `secrets`, `platform`, `protocol`: collaborator
//!   boundaries the engine consumes but never reimplements

pub mod definition;
pub mod engine;
pub mod llm;
pub mod memory;
pub mod platform;
pub mod protocol;
pub mod retry;
pub mod secrets;
pub mod strategies;
pub mod template;

/// JSON object map used for inputs, outputs and variable scopes.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

pub use definition::{AgentDefinition, AgentKind, AgentSelection, Identity};
pub use engine::context::{AgentResolver, Collaborators, ExecutionContext, SessionInfo};
pub use engine::dispatcher::{Dispatcher, ExecuteOptions, ParentLink};
pub use engine::error::EngineError;
pub use engine::events::{EventSink, ExecutePhase, ExecutionEvent};
pub use engine::task::TaskId;
