#![deny(unsafe_code)]

//! Shared test utilities for the repodoc workspace.
//!
//! Provides reusable fixtures, config builders, model stubs and tracing
//! helpers so that integration tests stay concise and consistent.
//!
//! Add this crate as a `[dev-dependency]` in any workspace member:
//!
//! ```toml
//! [dev-dependencies]
//! repodoc-test-utils = { workspace = true }
//! ```

pub mod config;
pub mod embedder;
pub mod script;
pub mod snapshot;
pub mod tracing_setup;
