//! Core building blocks shared by the formhook crates.
//!
//! - [`config`]: layered application configuration (defaults, file, env)
//! - [`store`]: the key-value JSON persistence contract and its backends

pub mod config;
pub mod error;
pub mod store;

pub use config::*;
pub use error::*;
pub use store::{FileKeyValueStore, InMemoryKeyValueStore, KeyValueStore};
