#![deny(unsafe_code)]

//! repodoc core runtime.
//!
//! Provides the documentation agent (a bounded tool-calling loop over a
//! repository snapshot), its audit and cost ledger, the model hub that is
//! the only network boundary, and the retrieval index behind the chat mode.

use std::future::Future;
use std::pin::Pin;

/// A type-erased, `Send`-safe, boxed future, the return type of async trait
/// methods that must be callable through `dyn Trait`.
///
/// Native `async fn` in traits produces opaque return types that are not
/// object-safe, so traits such as [`llm::LlmProvider`] return this instead.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Documentation agent: run context, state machine, artifact and replay.
pub mod agent;
/// Append-only audit and cost ledger of a run.
pub mod ledger;
/// Model hub: provider adapters, normalized replies and caller-side retry.
pub mod llm;
/// Run log layer writing `info.log` into the run directory.
pub mod logging;
/// Chunking, embedding, persistence and querying of document indexes.
pub mod retrieval;
/// Sandboxed tool catalog operating on a repository snapshot.
pub mod tools;

pub use agent::{AgentSettings, CancelToken, DocAgent, DocumentationArtifact, RunContext, RunError};
pub use ledger::{Ledger, RateTable};
pub use llm::{LlmError, LlmProvider, ModelHub};
pub use logging::{RunLog, RunLogHandle};
pub use retrieval::{ChatSession, IndexStore, RetrievalError, RetrievalIndex, RetrievalSettings};
pub use tools::{Snapshot, ToolError, ToolRegistry};
