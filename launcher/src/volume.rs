//! Block volume creation, attachment and hand-off to remote mounting.

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::converge::{RemoteDriver, shell_word};
use crate::core::failure::ProvisionError;
use crate::core::poll::{Poll, PollExit, PollPolicy};
use crate::core::settings::Settings;
use crate::core::types::{Instance, Volume, VolumeState};
use crate::io::provider::Provider;
use crate::io::remote::RemoteShell;

pub const DEFAULT_SIZE_GB: u32 = 1;
pub const DEFAULT_DEVICE: &str = "/dev/sdf";
pub const DEFAULT_MOUNT_POINT: &str = "/ebs";

/// Where the volume comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VolumeSource {
    /// Attach an existing, already formatted volume.
    Existing(String),
    /// Create and format a new volume. `zone` must match the instance if set.
    Create { size_gb: u32, zone: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRequest {
    pub source: VolumeSource,
    pub device: String,
    pub mount_point: String,
}

impl VolumeRequest {
    /// Build a request from the `ebs_*` settings of `section`.
    pub fn from_settings(settings: &Settings, section: Option<&str>) -> Result<Self> {
        let source = match settings.resolve("ebs_volume_id", section) {
            Some(id) if !id.trim().is_empty() => VolumeSource::Existing(id.trim().to_string()),
            _ => {
                let size_gb = match settings.resolve("ebs_volume_size", section) {
                    Some(raw) => parse_size(raw)?,
                    None => DEFAULT_SIZE_GB,
                };
                VolumeSource::Create {
                    size_gb,
                    zone: settings.resolve("ebs_volume_zone", section).map(str::to_string),
                }
            }
        };
        let device = settings.resolve("ebs_device", section).unwrap_or(DEFAULT_DEVICE);
        let mount_point = settings
            .resolve("ebs_mount_point", section)
            .unwrap_or(DEFAULT_MOUNT_POINT);
        Ok(Self {
            source,
            device: shell_word("ebs_device", device)?.to_string(),
            mount_point: shell_word("ebs_mount_point", mount_point)?.to_string(),
        })
    }
}

fn parse_size(raw: &str) -> Result<u32> {
    raw.trim()
        .parse::<u32>()
        .ok()
        .filter(|gb| *gb > 0)
        .ok_or_else(|| {
            ProvisionError::config(format!("ebs_volume_size {raw:?} is not a positive integer"))
                .into()
        })
}

/// Poll budgets for the two provider-side waits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VolumePolls {
    pub create: PollPolicy,
    pub attach: PollPolicy,
}

/// Create or look up a volume, attach it to `instance` and mount it.
///
/// New volumes are formatted before mounting; existing ones are not.
#[instrument(skip_all, fields(instance = %instance.id))]
pub fn setup_volume<P: Provider, R: RemoteShell>(
    provider: &P,
    driver: &RemoteDriver<R>,
    polls: VolumePolls,
    instance: &Instance,
    request: &VolumeRequest,
) -> Result<Volume> {
    let host = instance.ssh_host().ok_or_else(|| {
        ProvisionError::precondition(format!("instance {} has no public address", instance.id))
    })?;

    let (volume_id, created) = match &request.source {
        VolumeSource::Existing(id) => (id.clone(), false),
        VolumeSource::Create { size_gb, zone } => {
            let volume = create_volume(provider, polls.create, instance, *size_gb, zone.as_deref())?;
            (volume.id, true)
        }
    };

    let volume = attach_volume(provider, polls.attach, instance, &volume_id, &request.device)?;
    driver.format_and_mount(host, &request.device, &request.mount_point, created)?;
    Ok(volume)
}

/// Create a volume in the instance's zone and wait until it is available.
pub fn create_volume<P: Provider>(
    provider: &P,
    poll: PollPolicy,
    instance: &Instance,
    size_gb: u32,
    zone: Option<&str>,
) -> Result<Volume> {
    if let Some(zone) = zone.filter(|z| *z != instance.zone) {
        return Err(ProvisionError::precondition(format!(
            "volume zone {zone} differs from instance zone {}",
            instance.zone
        ))
        .into());
    }

    let volume = provider
        .create_volume(size_gb, &instance.zone)
        .map_err(|err| ProvisionError::provider(format!("create volume: {err:#}")))?;
    info!(volume = %volume.id, size_gb, zone = %instance.zone, "volume requested");

    let volume = wait_for_state(provider, poll, &volume.id, &VolumeState::Available)?;
    info!(volume = %volume.id, "volume available");
    Ok(volume)
}

/// Attach an available volume in the instance's zone and wait until it is in use.
pub fn attach_volume<P: Provider>(
    provider: &P,
    poll: PollPolicy,
    instance: &Instance,
    volume_id: &str,
    device: &str,
) -> Result<Volume> {
    let volume = fetch_volume(provider, volume_id)?
        .ok_or_else(|| ProvisionError::provider(format!("volume {volume_id} not found")))?;
    if volume.state != VolumeState::Available {
        return Err(ProvisionError::precondition(format!(
            "volume {volume_id} is {}, not available",
            volume.state.as_str()
        ))
        .into());
    }
    if volume.zone != instance.zone {
        return Err(ProvisionError::precondition(format!(
            "volume {volume_id} is in {}, instance {} is in {}",
            volume.zone, instance.id, instance.zone
        ))
        .into());
    }

    let state = provider
        .attach_volume(volume_id, &instance.id, device)
        .map_err(|err| ProvisionError::provider(format!("attach {volume_id}: {err:#}")))?;
    debug!(volume = volume_id, device, state = state.as_str(), "attach requested");

    let volume = wait_for_state(provider, poll, volume_id, &VolumeState::InUse)?;
    info!(volume = volume_id, instance = %instance.id, device, "volume attached");
    Ok(volume)
}

fn fetch_volume<P: Provider>(provider: &P, volume_id: &str) -> Result<Option<Volume>> {
    let found = provider
        .get_volumes(&[volume_id.to_string()])
        .map_err(|err| ProvisionError::provider(format!("describe {volume_id}: {err:#}")))?;
    Ok(found.into_iter().next())
}

/// Poll until `volume_id` reports `wanted`. An `error` state stops polling.
fn wait_for_state<P: Provider>(
    provider: &P,
    poll: PollPolicy,
    volume_id: &str,
    wanted: &VolumeState,
) -> Result<Volume> {
    poll.run(|attempt| match fetch_volume(provider, volume_id) {
        Ok(Some(volume)) if volume.state == *wanted => Poll::Ready(volume),
        Ok(Some(volume)) if volume.state == VolumeState::Error => Poll::Abort(
            ProvisionError::provider(format!("volume {volume_id} entered error state")).into(),
        ),
        Ok(Some(volume)) => {
            debug!(attempt, volume = volume_id, state = volume.state.as_str(), "waiting for volume");
            Poll::Pending
        }
        Ok(None) => {
            warn!(attempt, volume = volume_id, "volume not visible");
            Poll::Pending
        }
        Err(err) => {
            warn!(attempt, volume = volume_id, error = %format!("{err:#}"), "volume poll failed");
            Poll::Pending
        }
    })
    .map_err(|exit| match exit {
        PollExit::Exhausted { attempts } => anyhow::Error::from(ProvisionError::timeout(format!(
            "volume {volume_id} not {} after {attempts} polls",
            wanted.as_str()
        ))),
        PollExit::Aborted(err) => err,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::core::failure::{FailureKind, failure_kind};
    use crate::core::types::InstanceState;
    use crate::test_support::{ProviderCall, ScriptedProvider, ScriptedShell, TEST_ZONE, instance, volume};

    const POLLS: VolumePolls = VolumePolls {
        create: PollPolicy::new(Duration::ZERO, 30),
        attach: PollPolicy::new(Duration::ZERO, 40),
    };

    fn driver() -> RemoteDriver<ScriptedShell> {
        let fast = PollPolicy::new(Duration::ZERO, 5);
        RemoteDriver::new(ScriptedShell::new(), fast, fast)
    }

    fn running() -> Instance {
        instance("i-0001", InstanceState::Running)
    }

    fn create_request() -> VolumeRequest {
        VolumeRequest {
            source: VolumeSource::Create {
                size_gb: 1,
                zone: None,
            },
            device: DEFAULT_DEVICE.to_string(),
            mount_point: DEFAULT_MOUNT_POINT.to_string(),
        }
    }

    fn existing_request(id: &str) -> VolumeRequest {
        VolumeRequest {
            source: VolumeSource::Existing(id.to_string()),
            ..create_request()
        }
    }

    fn attach_calls(provider: &ScriptedProvider) -> Vec<ProviderCall> {
        provider
            .calls()
            .into_iter()
            .filter(|c| matches!(c, ProviderCall::AttachVolume { .. }))
            .collect()
    }

    #[test]
    fn request_defaults_to_creating_one_gib() {
        let request = VolumeRequest::from_settings(&Settings::new(), None).expect("request");
        assert_eq!(request, create_request());
    }

    #[test]
    fn request_prefers_existing_volume_id() {
        let settings = Settings::new()
            .with("default", "ebs_volume_id", "vol-abc")
            .with("default", "ebs_mount_point", "/data");
        let request = VolumeRequest::from_settings(&settings, None).expect("request");
        assert_eq!(request.source, VolumeSource::Existing("vol-abc".to_string()));
        assert_eq!(request.mount_point, "/data");
    }

    #[test]
    fn invalid_size_is_a_config_failure() {
        let settings = Settings::new().with("default", "ebs_volume_size", "lots");
        let err = VolumeRequest::from_settings(&settings, None).unwrap_err();
        assert_eq!(failure_kind(&err), FailureKind::Config);
    }

    #[test]
    fn mount_point_with_shell_syntax_is_a_config_failure() {
        for mount_point in ["/mnt/my data", "/data;reboot"] {
            let settings = Settings::new().with("default", "ebs_mount_point", mount_point);
            let err = VolumeRequest::from_settings(&settings, None).unwrap_err();
            assert_eq!(failure_kind(&err), FailureKind::Config, "{mount_point:?}");
            assert!(format!("{err:#}").contains("ebs_mount_point"));
        }
        let settings = Settings::new().with("default", "ebs_device", "/dev/sdf && id");
        assert!(VolumeRequest::from_settings(&settings, None).is_err());
    }

    #[test]
    fn existing_volume_is_mounted_without_mkfs() {
        let provider = ScriptedProvider::new()
            .with_volume(volume("vol-1", VolumeState::Available, TEST_ZONE))
            .with_attach_states(vec![VolumeState::Attaching, VolumeState::InUse]);
        let driver = driver();

        let attached = setup_volume(&provider, &driver, POLLS, &running(), &existing_request("vol-1"))
            .expect("setup");

        assert_eq!(attached.state, VolumeState::InUse);
        assert_eq!(
            driver.shell().commands(),
            vec!["mkdir -p /ebs", "mount /dev/sdf /ebs"]
        );
    }

    #[test]
    fn created_volume_is_attached_only_once_available() {
        let provider = ScriptedProvider::new()
            .with_create_states(vec![VolumeState::Creating, VolumeState::Available])
            .with_attach_states(vec![VolumeState::InUse]);
        let driver = driver();

        setup_volume(&provider, &driver, POLLS, &running(), &create_request()).expect("setup");

        let attaches = attach_calls(&provider);
        assert_eq!(attaches.len(), 1);
        assert!(matches!(
            &attaches[0],
            ProviderCall::AttachVolume { state_at_attach: VolumeState::Available, device, .. }
                if device == DEFAULT_DEVICE
        ));
        assert!(driver.shell().commands()[0].starts_with("mkfs"));
    }

    #[test]
    fn stuck_creation_times_out_after_thirty_polls() {
        let provider = ScriptedProvider::new().with_create_states(vec![VolumeState::Creating]);
        let driver = driver();

        let err = setup_volume(&provider, &driver, POLLS, &running(), &create_request())
            .unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Timeout);
        assert!(failure_kind(&err).is_retryable());
        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::GetVolumes(_))),
            30
        );
        assert!(attach_calls(&provider).is_empty());
        assert!(driver.shell().commands().is_empty());
    }

    #[test]
    fn error_state_stops_creation_polling() {
        let provider = ScriptedProvider::new()
            .with_create_states(vec![VolumeState::Creating, VolumeState::Error]);

        let err = create_volume(&provider, POLLS.create, &running(), 1, None).unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Provider);
        assert_eq!(
            provider.count_calls(|c| matches!(c, ProviderCall::GetVolumes(_))),
            2
        );
    }

    #[test]
    fn zone_mismatch_is_rejected_before_any_call() {
        let provider = ScriptedProvider::new();

        let err = create_volume(&provider, POLLS.create, &running(), 1, Some("eu-west-1a"))
            .unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Precondition);
        assert!(provider.calls().is_empty());
    }

    #[test]
    fn existing_volume_in_other_zone_is_not_attached() {
        let provider =
            ScriptedProvider::new().with_volume(volume("vol-1", VolumeState::Available, "eu-west-1a"));

        let err = attach_volume(&provider, POLLS.attach, &running(), "vol-1", DEFAULT_DEVICE)
            .unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Precondition);
        assert!(attach_calls(&provider).is_empty());
    }

    #[test]
    fn busy_volume_is_a_precondition_failure() {
        let provider =
            ScriptedProvider::new().with_volume(volume("vol-1", VolumeState::InUse, TEST_ZONE));

        let err = attach_volume(&provider, POLLS.attach, &running(), "vol-1", DEFAULT_DEVICE)
            .unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Precondition);
    }

    #[test]
    fn unknown_volume_is_a_provider_failure() {
        let provider = ScriptedProvider::new();

        let err = attach_volume(&provider, POLLS.attach, &running(), "vol-404", DEFAULT_DEVICE)
            .unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Provider);
    }

    #[test]
    fn attach_that_never_completes_is_a_timeout() {
        let provider = ScriptedProvider::new()
            .with_volume(volume("vol-1", VolumeState::Available, TEST_ZONE))
            .with_attach_states(vec![VolumeState::Attaching]);

        let err = attach_volume(&provider, POLLS.attach, &running(), "vol-1", DEFAULT_DEVICE)
            .unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Timeout);
    }

    #[test]
    fn instance_without_address_is_a_precondition_failure() {
        let provider = ScriptedProvider::new();
        let instance = Instance {
            public_dns_name: None,
            public_ip: None,
            ..running()
        };

        let err = setup_volume(&provider, &driver(), POLLS, &instance, &create_request())
            .unwrap_err();

        assert_eq!(failure_kind(&err), FailureKind::Precondition);
        assert!(provider.calls().is_empty());
    }
}
