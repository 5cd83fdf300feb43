//! Side-effecting adapters: config files, child processes, the cloud provider
//! and remote shells.

pub mod config;
pub mod process;
pub mod provider;
pub mod remote;
pub mod userdata;
