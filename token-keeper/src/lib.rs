//! token-keeper library crate.
//!
//! Encrypted storage, caching and coordinated refresh of third-party OAuth
//! tokens, plus the maintenance jobs that keep them current.

pub mod cache;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod database;
pub mod domain;
pub mod error;
pub mod logging;
pub mod maintenance;
pub mod services;
pub mod vault;

pub use error::{Error, Result};
