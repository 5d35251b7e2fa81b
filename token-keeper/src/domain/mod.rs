//! Core value types shared by the vault, cache and refresh coordinator.

pub mod token;

pub use token::{TokenData, TokenState};
