#![forbid(unsafe_code)]

//! Session protocol layer for a coding-assistant engine driven over stdio.
//!
//! The engine is an external program that reads and writes newline-delimited
//! JSON. This crate frames and resolves its output, owns the subprocess,
//! multiplexes queries over the single connection with FIFO admission,
//! correlates tool invocations for auditing, and carries the control
//! protocol.

pub mod audit;
pub mod config;
pub mod errors;
pub mod protocol;
pub mod session;
pub mod transport;

pub use config::EngineConfig;
pub use errors::{AppError, Result};
pub use session::Session;
