//! Remote convergence: one-off commands, filesystem setup and readiness checks.
//!
//! Exit statuses are data here, not errors. A nonzero status usually means
//! "not yet" (the device is not visible, the marker is not written), so only the
//! callers that asked for abort-on-error turn it into a failure.

use anyhow::Result;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::core::failure::ProvisionError;
use crate::core::poll::{Poll, PollExit, PollPolicy};
use crate::io::remote::{RemoteShell, TRANSPORT_FAILURE};

pub const DEFAULT_FS_TYPE: &str = "ext3";
pub const DEFAULT_FS_LABEL: &str = "CACHE2";

/// Check that `value` can be pasted into a remote command line as one word.
///
/// Only plain path characters are accepted; anything the remote shell would
/// split, expand or redirect on is a config error.
pub fn shell_word<'a>(setting: &str, value: &'a str) -> Result<&'a str> {
    let plain = |c: char| c.is_ascii_alphanumeric() || "/._-+:@=,".contains(c);
    if value.is_empty() || !value.chars().all(plain) {
        return Err(ProvisionError::config(format!(
            "{setting} {value:?} must be a plain path or word"
        ))
        .into());
    }
    Ok(value)
}

/// Hosts that did and did not write the readiness marker in time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReadinessReport {
    pub confirmed: Vec<String>,
    pub pending: Vec<String>,
}

impl ReadinessReport {
    pub fn all_ready(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Drives remote hosts through a [`RemoteShell`].
#[derive(Debug)]
pub struct RemoteDriver<R> {
    shell: R,
    format_poll: PollPolicy,
    readiness_poll: PollPolicy,
    fs_type: String,
    fs_label: String,
}

impl<R: RemoteShell> RemoteDriver<R> {
    pub fn new(shell: R, format_poll: PollPolicy, readiness_poll: PollPolicy) -> Self {
        Self {
            shell,
            format_poll,
            readiness_poll,
            fs_type: DEFAULT_FS_TYPE.to_string(),
            fs_label: DEFAULT_FS_LABEL.to_string(),
        }
    }

    pub fn with_filesystem(mut self, fs_type: impl Into<String>, label: impl Into<String>) -> Self {
        self.fs_type = fs_type.into();
        self.fs_label = label.into();
        self
    }

    pub fn shell(&self) -> &R {
        &self.shell
    }

    /// Run `command` on `host` and return its exit status.
    ///
    /// Transport failures map to [`TRANSPORT_FAILURE`].
    pub fn run_command(&self, host: &str, command: &str) -> i32 {
        match self.shell.exec(host, command) {
            Ok(output) => {
                let status = output.status();
                if status == 0 {
                    debug!(host, command, "remote command ok");
                } else {
                    warn!(
                        host,
                        command,
                        status,
                        timed_out = output.timed_out,
                        output = %output.output.trim_end(),
                        "remote command failed"
                    );
                }
                status
            }
            Err(err) => {
                warn!(host, command, error = %format!("{err:#}"), "remote command did not run");
                TRANSPORT_FAILURE
            }
        }
    }

    /// Run `commands` in order and return the status of the last one run.
    ///
    /// With `abort_on_error` the first nonzero status stops the sequence.
    pub fn run_commands(&self, host: &str, commands: &[String], abort_on_error: bool) -> i32 {
        let mut status = 0;
        for command in commands {
            status = self.run_command(host, command);
            if status != 0 && abort_on_error {
                break;
            }
        }
        status
    }

    /// Optionally create a filesystem on `device`, then mount it at `mount_point`.
    #[instrument(skip(self))]
    pub fn format_and_mount(
        &self,
        host: &str,
        device: &str,
        mount_point: &str,
        run_mkfs: bool,
    ) -> Result<()> {
        self.require_identity()?;
        let device = shell_word("device", device)?;
        let mount_point = shell_word("mount point", mount_point)?;

        if run_mkfs {
            let mkfs = format!(
                "mkfs -F -L {} -m 10 -t {} {device}",
                shell_word("filesystem label", &self.fs_label)?,
                shell_word("filesystem type", &self.fs_type)?,
            );
            self.format_poll
                .run(|attempt| {
                    if self.run_command(host, &mkfs) == 0 {
                        Poll::Ready(())
                    } else {
                        debug!(attempt, device, "device not ready for mkfs");
                        Poll::Pending
                    }
                })
                .map_err(|exit| match exit {
                    PollExit::Exhausted { attempts } => ProvisionError::timeout(format!(
                        "mkfs on {host}:{device} did not succeed after {attempts} attempts"
                    )),
                    PollExit::Aborted(err) => ProvisionError::remote(format!("{err:#}")),
                })?;
            info!(host, device, fs_type = %self.fs_type, "created filesystem");
        }

        let commands = [
            format!("mkdir -p {mount_point}"),
            format!("mount {device} {mount_point}"),
        ];
        let status = self.run_commands(host, &commands, true);
        if status != 0 {
            return Err(ProvisionError::remote(format!(
                "mounting {device} at {mount_point} on {host} exited with {status}"
            ))
            .into());
        }
        info!(host, device, mount_point, "mounted volume");
        Ok(())
    }

    /// Poll every host for `marker` until all confirm or the sweep budget runs out.
    ///
    /// Unconfirmed hosts are reported, not treated as a failure.
    #[instrument(skip(self, hosts), fields(hosts = hosts.len()))]
    pub fn wait_for_readiness(&self, hosts: &[String], marker: &str) -> Result<ReadinessReport> {
        self.require_identity()?;
        let marker = shell_word("ready marker", marker)?;

        let mut pending: Vec<String> = Vec::new();
        for host in hosts {
            if !pending.contains(host) {
                pending.push(host.clone());
            }
        }
        let mut confirmed = Vec::new();
        let check = format!("cat {marker}");

        let outcome = self.readiness_poll.run(|sweep| {
            pending.retain(|host| {
                if self.run_command(host, &check) == 0 {
                    info!(host = %host, sweep, "host ready");
                    confirmed.push(host.clone());
                    false
                } else {
                    true
                }
            });
            if pending.is_empty() {
                Poll::Ready(())
            } else {
                debug!(sweep, remaining = pending.len(), "waiting for hosts");
                Poll::Pending
            }
        });

        if let Err(PollExit::Exhausted { attempts }) = outcome {
            warn!(sweeps = attempts, hosts = ?pending, "hosts never reported ready");
        }
        Ok(ReadinessReport { confirmed, pending })
    }

    fn require_identity(&self) -> Result<()> {
        if self.shell.identity().is_none() {
            return Err(ProvisionError::precondition("no ssh key configured").into());
        }
        Ok(())
    }
}
