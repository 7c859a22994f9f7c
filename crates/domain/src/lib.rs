//! Shared domain types for the agentmill workspace: conversation messages,
//! runs and iterations, tool executions, agent definitions, the model
//! endpoint contract, and the error taxonomy.
//!
//! Everything here is plain data plus a handful of pure functions. The
//! database lives in `mill-store`; the workers live in `mill-client`.

pub mod agent;
pub mod config;
pub mod error;
pub mod instance;
pub mod message;
pub mod model;
pub mod retry;
pub mod run;
pub mod schema;
pub mod session;
pub mod tool;

pub use error::{Error, ErrorKind, Result};
