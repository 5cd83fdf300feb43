//! Launcher configuration file (TOML).
//!
//! Every table is a settings section and `[default]` is the fallback section.
//! Top-level scalar keys belong to `[default]`. The `[launcher]` table is not a
//! settings section: it holds the timeouts and poll budgets of the run.
//!
//! ```toml
//! [default]
//! project_name = "maps"
//! aws_ami = "ami-0123abcd"
//! aws_security_groups = ["web", "gmond"]
//!
//! [webserver]
//! aws_type = "c1.medium"
//! userdata_files = "base.sh,web.sh"
//!
//! [launcher]
//! instance_poll_attempts = 40
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::failure::ProvisionError;
use crate::core::poll::PollPolicy;
use crate::core::settings::{DEFAULT_SECTION, Settings};

/// Reserved table name for run tuning.
pub const LAUNCHER_TABLE: &str = "launcher";

/// Timeouts and poll budgets for one run.
///
/// Missing fields take the documented defaults; every attempt budget is a hard
/// ceiling, since a run has no other way to stop waiting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LauncherConfig {
    /// Wall-clock limit for a single `aws` or `ssh` invocation.
    pub command_timeout_secs: u64,

    /// Truncate captured SSH stdout/stderr beyond this many bytes.
    pub output_limit_bytes: usize,

    /// Cap on one `aws` response. Provider output is parsed as JSON, so a
    /// response past this cap fails the call instead of being truncated.
    pub provider_output_limit_bytes: usize,

    pub instance_poll_interval_secs: u64,
    pub instance_poll_attempts: u32,

    pub volume_create_interval_secs: u64,
    pub volume_create_attempts: u32,

    pub volume_attach_interval_secs: u64,
    pub volume_attach_attempts: u32,

    /// Pause between `mkfs` attempts while the device is not yet visible.
    pub format_interval_secs: u64,
    pub format_attempts: u32,

    /// Pause between readiness sweeps over all unconfirmed hosts.
    pub readiness_interval_secs: u64,
    pub readiness_sweeps: u32,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            command_timeout_secs: 120,
            output_limit_bytes: 100_000,
            provider_output_limit_bytes: 64 * 1024 * 1024,
            instance_poll_interval_secs: 5,
            instance_poll_attempts: 20,
            volume_create_interval_secs: 10,
            volume_create_attempts: 30,
            volume_attach_interval_secs: 15,
            volume_attach_attempts: 40,
            format_interval_secs: 15,
            format_attempts: 40,
            readiness_interval_secs: 30,
            readiness_sweeps: 100,
        }
    }
}

impl LauncherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.provider_output_limit_bytes == 0 {
            return Err(anyhow!("provider_output_limit_bytes must be > 0"));
        }
        for (name, attempts) in [
            ("instance_poll_attempts", self.instance_poll_attempts),
            ("volume_create_attempts", self.volume_create_attempts),
            ("volume_attach_attempts", self.volume_attach_attempts),
            ("format_attempts", self.format_attempts),
            ("readiness_sweeps", self.readiness_sweeps),
        ] {
            if attempts == 0 {
                return Err(anyhow!("{name} must be > 0"));
            }
        }
        Ok(())
    }

    pub fn command_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.command_timeout_secs)
    }

    pub fn instance_poll(&self) -> PollPolicy {
        PollPolicy::from_secs(self.instance_poll_interval_secs, self.instance_poll_attempts)
    }

    pub fn volume_create_poll(&self) -> PollPolicy {
        PollPolicy::from_secs(self.volume_create_interval_secs, self.volume_create_attempts)
    }

    pub fn volume_attach_poll(&self) -> PollPolicy {
        PollPolicy::from_secs(self.volume_attach_interval_secs, self.volume_attach_attempts)
    }

    pub fn format_poll(&self) -> PollPolicy {
        PollPolicy::from_secs(self.format_interval_secs, self.format_attempts)
    }

    pub fn readiness_poll(&self) -> PollPolicy {
        PollPolicy::from_secs(self.readiness_interval_secs, self.readiness_sweeps)
    }
}

/// A parsed configuration file.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub path: PathBuf,
    pub settings: Settings,
    pub launcher: LauncherConfig,
}

impl LoadedConfig {
    /// Directory that relative template paths are resolved against.
    pub fn base_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }
}

/// Load and validate the configuration file at `path`.
pub fn load_config(path: &Path) -> Result<LoadedConfig> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let (settings, launcher) =
        parse_config(&contents).with_context(|| format!("parse {}", path.display()))?;
    debug!(
        path = %path.display(),
        sections = settings.sections().len(),
        "loaded config"
    );
    Ok(LoadedConfig {
        path: path.to_path_buf(),
        settings,
        launcher,
    })
}

/// Split a TOML document into settings sections and launcher tuning.
pub fn parse_config(contents: &str) -> Result<(Settings, LauncherConfig)> {
    let table: toml::Table = toml::from_str(contents).context("parse toml")?;
    let mut settings = Settings::new();
    let mut launcher = LauncherConfig::default();

    for (name, value) in table {
        match value {
            toml::Value::Table(inner) if name == LAUNCHER_TABLE => {
                launcher = toml::Value::Table(inner)
                    .try_into()
                    .context("parse [launcher] table")?;
            }
            toml::Value::Table(inner) => {
                let section = settings.section_mut(&name);
                for (key, value) in inner {
                    let text = scalar_to_string(&value)
                        .with_context(|| format!("setting '{name}.{key}'"))?;
                    section.set(key, text);
                }
            }
            scalar => {
                let text =
                    scalar_to_string(&scalar).with_context(|| format!("setting '{name}'"))?;
                settings.section_mut(DEFAULT_SECTION).set(name, text);
            }
        }
    }

    launcher.validate()?;
    Ok((settings, launcher))
}

/// Settings are strings; arrays of scalars become comma-separated lists.
fn scalar_to_string(value: &toml::Value) -> Result<String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        toml::Value::Datetime(dt) => Ok(dt.to_string()),
        toml::Value::Array(items) => {
            let parts = items
                .iter()
                .map(|item| match item {
                    toml::Value::Array(_) | toml::Value::Table(_) => {
                        Err(anyhow!("nested lists are not supported"))
                    }
                    scalar => scalar_to_string(scalar),
                })
                .collect::<Result<Vec<_>>>()?;
            Ok(parts.join(","))
        }
        toml::Value::Table(_) => {
            Err(ProvisionError::config("nested tables are not supported").into())
        }
    }
}
