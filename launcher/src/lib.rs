//! Single-host cloud provisioning.
//!
//! A run connects to the provider, makes sure the project's security group
//! exists, launches one instance with rendered first-boot data, waits for the
//! host to report ready over SSH, and optionally creates, attaches and mounts a
//! block volume. The crate keeps a strict split:
//!
//! - **[`core`]**: settings resolution, resource types, ingress policy, polling
//!   and failure classification. No provider or SSH calls.
//! - **[`io`]**: the provider client, the SSH transport, child processes, the
//!   config file and template rendering. Behind traits so tests can script them.
//!
//! The stage modules ([`groups`], [`instance`], [`volume`], [`converge`]) combine
//! the two, and [`run`] sequences them into one outcome.

pub mod converge;
pub mod core;
pub mod exit_codes;
pub mod groups;
pub mod instance;
pub mod io;
pub mod logging;
pub mod run;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod volume;
