//! Deterministic logic shared by the provisioning stages.
//!
//! Core modules never talk to the provider or to remote hosts. They operate on
//! in-memory data and return deterministic outputs suitable for tests; the only
//! side effect allowed here is the sleep between poll attempts.

pub mod failure;
pub mod policy;
pub mod poll;
pub mod settings;
pub mod types;
