//! Multi-model chat client: persistent sessions, an OpenRouter-compatible
//! dispatcher with retry, and a display pipeline for progressive reveal,
//! block formatting and search.

pub mod catalog;
pub mod cli;
pub mod dispatcher;
pub mod error;
pub mod orchestrator;
pub mod render;
pub mod server;
pub mod session;
pub mod settings;
pub mod storage;

#[cfg(test)]
mod testing;

pub use error::{ChatError, ErrorKind, Result};
pub use orchestrator::ChatService;
