//! The execution engine.
//!
//! One public operation - [`Dispatcher::execute`](dispatcher::Dispatcher::execute) -
//! runs a declarative agent definition against an
//! [`ExecutionContext`](context::ExecutionContext) of collaborator
//! handles, producing validated outputs while streaming
//! [`ExecutionEvent`](events::ExecutionEvent)s to the context's sink.
//!
//! ```text
//!   caller ──▶ Dispatcher ──▶ executor lifecycle ──▶ Strategy (per kind)
//!                 ▲                 │
//!                 └─────────────────┘
//!            nested agent references recurse through the dispatcher,
//!            correlated by parent/child task ids (the call tree)
//! ```

pub mod cache;
pub mod context;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod schema;
pub mod secret_scan;
pub mod task;

mod executor;
pub(crate) mod inputs;
