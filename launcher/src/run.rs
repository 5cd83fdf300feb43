//! One provisioning run: connect, project group, launch, readiness, volume.
//!
//! Stages run in order and the first failure stops the run. Nothing created by
//! earlier stages is torn down; the outcome records what exists so an operator
//! can clean up or retry by hand.

use std::fmt;
use std::path::Path;

use anyhow::Result;
use serde::Serialize;
use tracing::{error, info, instrument};

use crate::converge::{
    DEFAULT_FS_LABEL, DEFAULT_FS_TYPE, ReadinessReport, RemoteDriver, shell_word,
};
use crate::core::failure::{FailureKind, ProvisionError, failure_kind};
use crate::core::settings::Settings;
use crate::core::types::{Instance, Volume};
use crate::groups::{EnsureOptions, GroupCache};
use crate::instance::{ImageCache, LaunchContext, LaunchRequest, launch_instance};
use crate::io::config::LauncherConfig;
use crate::io::provider::Provider;
use crate::io::remote::RemoteShell;
use crate::io::userdata::DEFAULT_READY_MARKER;
use crate::volume::{VolumePolls, VolumeRequest, setup_volume};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Connect,
    SecurityGroup,
    Launch,
    Readiness,
    Volume,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Connect => "connect",
            Stage::SecurityGroup => "security-group",
            Stage::Launch => "launch",
            Stage::Readiness => "readiness",
            Stage::Volume => "volume",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub class: String,
    pub extra_groups: Vec<String>,
}

/// Lookups shared across the stages of a run.
#[derive(Debug, Default)]
pub struct RunCaches {
    pub images: ImageCache,
    pub groups: GroupCache,
}

/// Settings and tuning a run reads.
#[derive(Debug, Clone, Copy)]
pub struct RunContext<'a> {
    pub settings: &'a Settings,
    pub base_dir: &'a Path,
    pub launcher: &'a LauncherConfig,
}

#[derive(Debug)]
pub struct StageFailure {
    pub stage: Stage,
    pub error: anyhow::Error,
}

impl StageFailure {
    pub fn kind(&self) -> FailureKind {
        failure_kind(&self.error)
    }
}

/// Everything a run produced, plus the stage that stopped it, if any.
#[derive(Debug, Default)]
pub struct RunOutcome {
    pub instance: Option<Instance>,
    pub readiness: Option<ReadinessReport>,
    pub volume: Option<Volume>,
    pub failure: Option<StageFailure>,
}

/// Serializable view of a [`RunOutcome`], printed by the binary.
#[derive(Debug, Serialize)]
pub struct RunSummary<'a> {
    pub succeeded: bool,
    pub instance: Option<&'a Instance>,
    pub readiness: Option<&'a ReadinessReport>,
    pub volume: Option<&'a Volume>,
    pub failure: Option<FailureSummary>,
}

#[derive(Debug, Serialize)]
pub struct FailureSummary {
    pub stage: Stage,
    pub kind: FailureKind,
    pub retryable: bool,
    pub message: String,
}

impl RunOutcome {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn summary(&self) -> RunSummary<'_> {
        RunSummary {
            succeeded: self.succeeded(),
            instance: self.instance.as_ref(),
            readiness: self.readiness.as_ref(),
            volume: self.volume.as_ref(),
            failure: self.failure.as_ref().map(|f| FailureSummary {
                stage: f.stage,
                kind: f.kind(),
                retryable: f.kind().is_retryable(),
                message: format!("{:#}", f.error),
            }),
        }
    }

    fn fail(mut self, stage: Stage, error: anyhow::Error) -> Self {
        let kind = failure_kind(&error);
        error!(
            stage = stage.as_str(),
            kind = kind.as_str(),
            retryable = kind.is_retryable(),
            error = %format!("{error:#}"),
            "stage failed"
        );
        self.failure = Some(StageFailure { stage, error });
        self
    }
}

/// Build the remote driver for `class` from settings and tuning.
pub fn remote_driver<R: RemoteShell>(
    shell: R,
    settings: &Settings,
    class: &str,
    launcher: &LauncherConfig,
) -> RemoteDriver<R> {
    let section = Some(class);
    RemoteDriver::new(shell, launcher.format_poll(), launcher.readiness_poll()).with_filesystem(
        settings.resolve("ebs_fs_type", section).unwrap_or(DEFAULT_FS_TYPE),
        settings.resolve("ebs_fs_label", section).unwrap_or(DEFAULT_FS_LABEL),
    )
}

/// Run every stage for `request`.
///
/// `connect` is called once, first; a failure there is the connect stage's.
/// Every run, failed or not, ends with one `done` event.
#[instrument(skip_all, fields(class = %request.class))]
pub fn run_provisioning<P, R, C>(
    connect: C,
    driver: &RemoteDriver<R>,
    ctx: &RunContext<'_>,
    caches: &mut RunCaches,
    request: &RunRequest,
) -> RunOutcome
where
    P: Provider,
    R: RemoteShell,
    C: FnOnce() -> Result<P>,
{
    let outcome = run_stages(connect, driver, ctx, caches, request);
    info!(
        succeeded = outcome.succeeded(),
        failed_stage = outcome.failure.as_ref().map(|f| f.stage.as_str()),
        instance = outcome.instance.as_ref().map(|i| i.id.as_str()),
        "done"
    );
    outcome
}

fn run_stages<P, R, C>(
    connect: C,
    driver: &RemoteDriver<R>,
    ctx: &RunContext<'_>,
    caches: &mut RunCaches,
    request: &RunRequest,
) -> RunOutcome
where
    P: Provider,
    R: RemoteShell,
    C: FnOnce() -> Result<P>,
{
    let mut outcome = RunOutcome::default();
    let settings = ctx.settings;
    let class = Some(request.class.as_str());

    let provider = match connect() {
        Ok(provider) => provider,
        Err(err) => return outcome.fail(Stage::Connect, err),
    };

    let project = settings
        .require("project_name", class)
        .and_then(|name| {
            caches.groups.ensure(
                &provider,
                name,
                EnsureOptions {
                    default_ports: true,
                },
            )
        });
    if let Err(err) = project {
        return outcome.fail(Stage::SecurityGroup, err);
    }

    let marker = settings
        .resolve("ready_marker", class)
        .unwrap_or(DEFAULT_READY_MARKER);
    if let Err(err) = shell_word("ready_marker", marker) {
        return outcome.fail(Stage::Launch, err);
    }
    let launch_ctx = LaunchContext {
        settings,
        base_dir: ctx.base_dir,
        poll: ctx.launcher.instance_poll(),
        ready_marker: marker,
    };
    let launch = LaunchRequest {
        class: request.class.clone(),
        extra_groups: request.extra_groups.clone(),
    };
    let instance = match launch_instance(
        &provider,
        &launch_ctx,
        &mut caches.images,
        &mut caches.groups,
        &launch,
    ) {
        Ok(instance) => instance,
        Err(err) => return outcome.fail(Stage::Launch, err),
    };
    outcome.instance = Some(instance.clone());

    let Some(host) = instance.ssh_host() else {
        let err = ProvisionError::precondition(format!(
            "instance {} has no public address",
            instance.id
        ));
        return outcome.fail(Stage::Readiness, err.into());
    };
    match driver.wait_for_readiness(&[host.to_string()], marker) {
        Ok(report) => outcome.readiness = Some(report),
        Err(err) => return outcome.fail(Stage::Readiness, err),
    }

    if settings.resolve_flag("ebs_attach_volume", class) {
        let polls = VolumePolls {
            create: ctx.launcher.volume_create_poll(),
            attach: ctx.launcher.volume_attach_poll(),
        };
        let volume = VolumeRequest::from_settings(settings, class)
            .and_then(|req| setup_volume(&provider, driver, polls, &instance, &req));
        match volume {
            Ok(volume) => outcome.volume = Some(volume),
            Err(err) => return outcome.fail(Stage::Volume, err),
        }
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};

    use crate::core::types::{InstanceState, VolumeState};
    use crate::test_support::{
        ProviderCall, ScriptedProvider, ScriptedShell, TEST_AMI, fast_launcher_config,
    };

    /// Log sink shared between a test and its scoped subscriber.
    #[derive(Clone, Default)]
    struct LogBuffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for LogBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("log buffer").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Run `f` under an info-level subscriber and return what it logged.
    fn with_logs<T>(f: impl FnOnce() -> T) -> (T, Vec<String>) {
        let buffer = LogBuffer::default();
        let writer = buffer.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::INFO)
            .finish();
        let value = tracing::subscriber::with_default(subscriber, f);
        let logs = String::from_utf8_lossy(&buffer.0.lock().expect("log buffer"))
            .lines()
            .map(str::to_string)
            .collect();
        (value, logs)
    }

    fn count_lines(logs: &[String], needles: &[&str]) -> usize {
        logs.iter()
            .filter(|line| needles.iter().all(|n| line.contains(n)))
            .count()
    }

    fn settings() -> Settings {
        Settings::new()
            .with("default", "aws_ami", TEST_AMI)
            .with("default", "project_name", "maps")
    }

    fn run(
        provider: &ScriptedProvider,
        shell: ScriptedShell,
        settings: &Settings,
    ) -> (RunOutcome, RemoteDriver<ScriptedShell>) {
        run_in(Path::new("."), provider, shell, settings)
    }

    fn run_in(
        base_dir: &Path,
        provider: &ScriptedProvider,
        shell: ScriptedShell,
        settings: &Settings,
    ) -> (RunOutcome, RemoteDriver<ScriptedShell>) {
        let launcher = fast_launcher_config();
        let driver = remote_driver(shell, settings, "default", &launcher);
        let ctx = RunContext {
            settings,
            base_dir,
            launcher: &launcher,
        };
        let request = RunRequest {
            class: "default".to_string(),
            extra_groups: Vec::new(),
        };
        let outcome = run_provisioning(
            || Ok(provider),
            &driver,
            &ctx,
            &mut RunCaches::default(),
            &request,
        );
        (outcome, driver)
    }

    fn booting() -> ScriptedProvider {
        ScriptedProvider::new().with_instance_polls(vec![
            Ok(InstanceState::Pending),
            Ok(InstanceState::Running),
        ])
    }

    #[test]
    fn happy_path_without_volume() {
        let provider = booting();

        let (outcome, driver) = run(&provider, ScriptedShell::new(), &settings());

        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        assert!(outcome.instance.is_some());
        assert!(outcome.readiness.as_ref().is_some_and(ReadinessReport::all_ready));
        assert!(outcome.volume.is_none());
        assert_eq!(driver.shell().commands(), vec!["cat /etc/ec2/created"]);
    }

    #[test]
    fn project_group_gets_default_ports_once() {
        let provider = booting();

        run(&provider, ScriptedShell::new(), &settings());

        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::CreateSecurityGroup(_))),
            1
        );
        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::AuthorizeIngress { .. })),
            4
        );
    }

    #[test]
    fn connect_failure_stops_before_any_call() {
        let launcher = fast_launcher_config();
        let settings = settings();
        let driver = remote_driver(ScriptedShell::new(), &settings, "default", &launcher);
        let ctx = RunContext {
            settings: &settings,
            base_dir: Path::new("."),
            launcher: &launcher,
        };
        let request = RunRequest {
            class: "default".to_string(),
            extra_groups: Vec::new(),
        };

        let outcome = run_provisioning(
            || -> Result<ScriptedProvider> { Err(ProvisionError::provider("bad credentials").into()) },
            &driver,
            &ctx,
            &mut RunCaches::default(),
            &request,
        );

        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Connect);
        assert_eq!(failure.kind(), FailureKind::Provider);
        assert!(driver.shell().commands().is_empty());
    }

    #[test]
    fn launch_failure_short_circuits_later_stages() {
        let provider = ScriptedProvider::new().failing_launch();

        let (outcome, driver) = run(&provider, ScriptedShell::new(), &settings());

        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Launch);
        assert!(outcome.instance.is_none());
        assert!(driver.shell().commands().is_empty());
    }

    #[test]
    fn failed_image_lookup_fails_launch_before_any_remote_command() {
        let provider = booting().failing_image();

        let (outcome, driver) = run(&provider, ScriptedShell::new(), &settings());

        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Launch);
        assert_eq!(failure.kind(), FailureKind::Provider);
        assert!(outcome.instance.is_none());
        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::RunInstances(_))),
            0
        );
        assert!(driver.shell().commands().is_empty());
    }

    #[test]
    fn every_run_logs_done_once() {
        let (outcome, logs) = with_logs(|| run(&booting(), ScriptedShell::new(), &settings()).0);
        assert!(outcome.succeeded());
        assert_eq!(count_lines(&logs, &["done", "succeeded=true"]), 1);

        let (outcome, logs) = with_logs(|| {
            run(&ScriptedProvider::new().failing_launch(), ScriptedShell::new(), &settings()).0
        });
        assert!(!outcome.succeeded());
        assert_eq!(
            count_lines(&logs, &["done", "succeeded=false", "failed_stage=\"launch\""]),
            1
        );
    }

    #[test]
    fn ready_marker_is_resolved_once_per_run() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join("boot.sh"), "echo boot\n").expect("write");
        let settings = settings().with("default", "userdata_files", "boot.sh");
        let provider = booting();

        let ((outcome, driver), logs) =
            with_logs(|| run_in(temp.path(), &provider, ScriptedShell::new(), &settings));

        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        assert_eq!(
            count_lines(&logs, &["undefined config", "ready_marker"]),
            1
        );
        let launched = provider
            .calls()
            .into_iter()
            .find_map(|c| match c {
                ProviderCall::RunInstances(req) => req.user_data,
                _ => None,
            })
            .expect("user data");
        assert!(launched.ends_with(&format!("> {DEFAULT_READY_MARKER}\n")));
        assert_eq!(driver.shell().commands(), vec![format!("cat {DEFAULT_READY_MARKER}")]);
    }

    #[test]
    fn unsafe_ready_marker_fails_before_launch() {
        let provider = booting();
        let settings = settings().with("default", "ready_marker", "/tmp/ready; reboot");

        let (outcome, driver) = run(&provider, ScriptedShell::new(), &settings);

        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Launch);
        assert_eq!(failure.kind(), FailureKind::Config);
        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::RunInstances(_))),
            0
        );
        assert!(driver.shell().commands().is_empty());
    }

    #[test]
    fn slow_hosts_do_not_fail_the_run() {
        let provider = booting();
        let shell = ScriptedShell::new().with_exit_codes("cat", vec![1]);

        let (outcome, _) = run(&provider, shell, &settings());

        assert!(outcome.succeeded());
        let report = outcome.readiness.expect("report");
        assert_eq!(report.pending.len(), 1);
    }

    #[test]
    fn missing_ssh_key_fails_readiness_but_keeps_instance() {
        let provider = booting();

        let (outcome, _) = run(&provider, ScriptedShell::new().without_identity(), &settings());

        assert!(outcome.instance.is_some());
        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Readiness);
        assert_eq!(failure.kind(), FailureKind::Precondition);
    }

    #[test]
    fn volume_stage_runs_when_flag_is_truthy() {
        let provider = booting()
            .with_create_states(vec![VolumeState::Available])
            .with_attach_states(vec![VolumeState::InUse]);
        let settings = settings()
            .with("default", "ebs_attach_volume", "Yes")
            .with("default", "ebs_fs_type", "ext4");

        let (outcome, driver) = run(&provider, ScriptedShell::new(), &settings);

        assert!(outcome.succeeded(), "{:?}", outcome.failure);
        assert_eq!(
            outcome.volume.map(|v| v.state),
            Some(VolumeState::InUse)
        );
        assert!(
            driver
                .shell()
                .commands()
                .iter()
                .any(|c| c.contains("-t ext4 /dev/sdf"))
        );
    }

    #[test]
    fn volume_failure_is_reported_against_volume_stage() {
        let provider = booting();
        let settings = settings()
            .with("default", "ebs_attach_volume", "on")
            .with("default", "ebs_volume_id", "vol-missing");

        let (outcome, _) = run(&provider, ScriptedShell::new(), &settings);

        let failure = outcome.failure.expect("failure");
        assert_eq!(failure.stage, Stage::Volume);
        assert!(outcome.readiness.is_some());
        assert!(format!("{:#}", failure.error).contains("vol-missing"));
    }

    #[test]
    fn summary_serializes_stage_and_kind() {
        let provider = ScriptedProvider::new().failing_launch();

        let (outcome, _) = run(&provider, ScriptedShell::new(), &settings());

        let json = serde_json::to_value(outcome.summary()).expect("json");
        assert_eq!(json["succeeded"], false);
        assert_eq!(json["failure"]["stage"], "launch");
        assert_eq!(json["failure"]["kind"], "provider");
        assert!(json["instance"].is_null());
    }
}
