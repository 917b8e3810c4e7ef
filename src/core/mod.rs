pub mod config;
pub mod conversation;
pub mod credentials;
pub mod identity;
pub mod keyring;
pub mod message;
pub mod runtime;
pub mod session;
