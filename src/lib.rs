//! sparkchat is the chat session core of a dating client: one conversation
//! with a match, kept in sync over either of two delivery backends.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the message model, the pure history merge, the session
//!   controller state machine, and the async runtime that drives it. It also
//!   holds configuration, the identity store, and ledger signing keys.
//! - [`transport`] implements the conventional backend (REST history plus a
//!   websocket live channel) and the ledger backend (signed submissions
//!   confirmed by polling), both behind one `Transport` trait.
//! - [`utils`] holds endpoint URL helpers.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`], which resolves identity and configuration and
//! runs a line-oriented chat against [`core::runtime::SessionRuntime`].

pub mod cli;
pub mod core;
pub mod transport;
pub mod utils;
