//! # Orchestrator Testing Utils
//!
//! Shared test doubles and builders for the orchestrator workspace.
//!
//! - **Builders**: `ResourceBuilder` for resources in any lifecycle position
//! - **Mocks**: a grant-table policy gate, a scripted execution pipeline and
//!   recording notifier / event publisher
//! - **Helpers**: polling helpers for asynchronous assertions
//!
//! ```toml
//! [dev-dependencies]
//! orchestrator-testing-utils = { path = "../testing-utils" }
//! ```

pub mod builders;
pub mod helpers;
pub mod mocks;

pub use builders::*;
pub use helpers::*;
pub use mocks::*;
