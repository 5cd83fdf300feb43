//! Failure taxonomy for provisioning stages.
//!
//! Stage functions return `anyhow::Result`. When a failure belongs to a known
//! category it carries a [`ProvisionError`], which callers recover with
//! `downcast_ref` to branch on the broad [`FailureKind`].

use std::fmt;

use serde::Serialize;

/// Broad failure category. Callers branch on this, never on message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Required configuration is missing or malformed.
    Config,
    /// A control-plane call (connect, create, launch, attach, describe) failed.
    Provider,
    /// A poll budget was exhausted before the awaited state appeared.
    Timeout,
    /// A remote command failed where the caller asked to abort on error.
    Remote,
    /// An operation was invoked with its preconditions unmet.
    Precondition,
}

impl FailureKind {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureKind::Config => "config",
            FailureKind::Provider => "provider",
            FailureKind::Timeout => "timeout",
            FailureKind::Remote => "remote",
            FailureKind::Precondition => "precondition",
        }
    }

    /// Timeouts describe resources that may still converge on their own.
    pub fn is_retryable(self) -> bool {
        matches!(self, FailureKind::Timeout)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tagged provisioning failure: category plus a message naming the operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionError {
    pub kind: FailureKind,
    pub message: String,
}

impl ProvisionError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Config, message)
    }

    pub fn provider(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Provider, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Remote, message)
    }

    pub fn precondition(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Precondition, message)
    }
}

impl fmt::Display for ProvisionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failure: {}", self.kind, self.message)
    }
}

impl std::error::Error for ProvisionError {}

/// Classify an error chain. Untagged errors come from provider plumbing.
pub fn failure_kind(err: &anyhow::Error) -> FailureKind {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ProvisionError>())
        .map(|tagged| tagged.kind)
        .unwrap_or(FailureKind::Provider)
}
