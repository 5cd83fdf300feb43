//! Stable exit codes for the `launch` binary.

/// Every stage completed. Unconfirmed readiness does not change this.
pub const OK: i32 = 0;
/// A stage failed; resources created before it are left in place.
pub const FAILED: i32 = 1;
/// The config file or command line was unusable; nothing was provisioned.
pub const INVALID: i32 = 2;
