//! Service layer module.
//!
//! Wires the credential services together and owns their lifecycle.

pub mod container;

pub use container::{CredentialMetrics, CredentialServices, ServiceOptions};
