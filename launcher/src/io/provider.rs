//! Cloud control-plane client.
//!
//! The [`Provider`] trait is the boundary between provisioning logic and the
//! cloud API. [`AwsCliProvider`] drives the `aws` CLI with JSON output; tests
//! use scripted providers that replay lifecycle states without a cloud account.

use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, info, instrument, warn};

use crate::core::failure::ProvisionError;
use crate::core::settings::Settings;
use crate::core::types::{
    Image, Instance, InstanceState, IngressRule, Reservation, RuleSource, SecurityGroup, Volume,
    VolumeState,
};
use crate::io::process::run_command_with_timeout;

/// Parameters for a launch call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInstancesRequest {
    pub image_id: String,
    pub count: u32,
    pub min_count: u32,
    pub max_count: u32,
    pub keypair: Option<String>,
    pub security_groups: Vec<String>,
    pub user_data: Option<String>,
    pub placement: Option<String>,
    pub instance_type: Option<String>,
}

/// Abstract cloud control plane.
pub trait Provider {
    fn get_image(&self, image_id: &str) -> Result<Image>;
    /// The group called `name`, if the account has one.
    fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>>;
    fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup>;
    fn authorize_ingress(&self, group: &SecurityGroup, rule: &IngressRule) -> Result<()>;
    fn run_instances(&self, request: &RunInstancesRequest) -> Result<Reservation>;
    fn get_instances(&self, ids: &[String]) -> Result<Vec<Instance>>;
    fn create_volume(&self, size_gb: u32, zone: &str) -> Result<Volume>;
    fn get_volumes(&self, ids: &[String]) -> Result<Vec<Volume>>;
    /// Start attaching; returns the attachment state reported by the call.
    fn attach_volume(&self, volume_id: &str, instance_id: &str, device: &str)
    -> Result<VolumeState>;
}

impl<P: Provider + ?Sized> Provider for &P {
    fn get_image(&self, image_id: &str) -> Result<Image> {
        (**self).get_image(image_id)
    }
    fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>> {
        (**self).find_security_group(name)
    }
    fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        (**self).create_security_group(name, description)
    }
    fn authorize_ingress(&self, group: &SecurityGroup, rule: &IngressRule) -> Result<()> {
        (**self).authorize_ingress(group, rule)
    }
    fn run_instances(&self, request: &RunInstancesRequest) -> Result<Reservation> {
        (**self).run_instances(request)
    }
    fn get_instances(&self, ids: &[String]) -> Result<Vec<Instance>> {
        (**self).get_instances(ids)
    }
    fn create_volume(&self, size_gb: u32, zone: &str) -> Result<Volume> {
        (**self).create_volume(size_gb, zone)
    }
    fn get_volumes(&self, ids: &[String]) -> Result<Vec<Volume>> {
        (**self).get_volumes(ids)
    }
    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeState> {
        (**self).attach_volume(volume_id, instance_id, device)
    }
}

/// Provider backed by the `aws` command-line client.
#[derive(Debug, Clone)]
pub struct AwsCliProvider {
    program: String,
    region: Option<String>,
    credentials: Option<(String, String)>,
    timeout: Duration,
    output_limit_bytes: usize,
}

impl AwsCliProvider {
    /// Resolve credentials and region from `settings` and verify the account is reachable.
    ///
    /// Without an `aws_key`/`aws_secret` pair the CLI's own credential chain applies.
    #[instrument(skip_all)]
    pub fn connect(settings: &Settings, timeout: Duration, output_limit_bytes: usize) -> Result<Self> {
        let credentials = match (
            settings.resolve("aws_key", None),
            settings.resolve("aws_secret", None),
        ) {
            (Some(key), Some(secret)) => Some((key.to_string(), secret.to_string())),
            (None, None) => None,
            _ => {
                return Err(ProvisionError::config(
                    "aws_key and aws_secret must be set together",
                )
                .into());
            }
        };
        let provider = Self {
            program: "aws".to_string(),
            region: settings.resolve("aws_region", None).map(str::to_string),
            credentials,
            timeout,
            output_limit_bytes,
        };

        let identity: CallerIdentity = provider
            .call(&["sts", "get-caller-identity"])
            .map_err(|err| ProvisionError::provider(format!("failed to connect: {err:#}")))?;
        info!(
            account = identity.account.as_deref().unwrap_or("unknown"),
            region = provider.region.as_deref().unwrap_or("default"),
            "connected to provider"
        );
        Ok(provider)
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(args).arg("--output").arg("json");
        if let Some(region) = &self.region {
            cmd.arg("--region").arg(region);
        }
        if let Some((key, secret)) = &self.credentials {
            cmd.env("AWS_ACCESS_KEY_ID", key)
                .env("AWS_SECRET_ACCESS_KEY", secret);
        }
        cmd
    }

    /// Run `aws <args>` and return stdout.
    ///
    /// Fails on timeout, nonzero exit, or stdout past `output_limit_bytes`; a
    /// cut-off JSON document is never handed to the parser.
    fn call_raw(&self, args: &[&str]) -> Result<String> {
        let label = args.iter().take(2).copied().collect::<Vec<_>>().join(" ");
        debug!(call = %label, "aws call");
        let output = run_command_with_timeout(
            self.command(args),
            self.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run aws {label}"))?;
        if output.timed_out {
            return Err(anyhow!("aws {label} timed out after {:?}", self.timeout));
        }
        if !output.success() {
            warn!(call = %label, exit_code = ?output.status.code(), "aws call failed");
            return Err(anyhow!(
                "aws {label} failed with status {:?}: {}",
                output.status.code(),
                output.combined()
            ));
        }
        if output.stdout_truncated > 0 {
            return Err(ProvisionError::provider(format!(
                "aws {label} output truncated: {} bytes past the {} byte limit",
                output.stdout_truncated, self.output_limit_bytes
            ))
            .into());
        }
        Ok(output.stdout_lossy())
    }

    fn call<T: DeserializeOwned>(&self, args: &[&str]) -> Result<T> {
        let raw = self.call_raw(args)?;
        serde_json::from_str(&raw).with_context(|| format!("parse aws {} response", args.join(" ")))
    }
}

impl Provider for AwsCliProvider {
    #[instrument(skip(self))]
    fn get_image(&self, image_id: &str) -> Result<Image> {
        let resp: DescribeImages = self.call(&["ec2", "describe-images", "--image-ids", image_id])?;
        resp.images
            .into_iter()
            .next()
            .map(AwsImage::into_image)
            .ok_or_else(|| anyhow!("image {image_id} not found"))
    }

    fn find_security_group(&self, name: &str) -> Result<Option<SecurityGroup>> {
        let filter = format!("Name=group-name,Values={name}");
        let resp: DescribeSecurityGroups =
            self.call(&["ec2", "describe-security-groups", "--filters", &filter])?;
        Ok(resp
            .security_groups
            .into_iter()
            .map(AwsSecurityGroup::into_group)
            .find(|g| g.name == name))
    }

    #[instrument(skip(self))]
    fn create_security_group(&self, name: &str, description: &str) -> Result<SecurityGroup> {
        let resp: CreateSecurityGroup = self.call(&[
            "ec2",
            "create-security-group",
            "--group-name",
            name,
            "--description",
            description,
        ])?;
        Ok(SecurityGroup {
            id: resp.group_id,
            name: name.to_string(),
            description: description.to_string(),
            rules: Vec::new(),
        })
    }

    #[instrument(skip_all, fields(group = %group.name, rule = %rule))]
    fn authorize_ingress(&self, group: &SecurityGroup, rule: &IngressRule) -> Result<()> {
        let permissions = ip_permissions(group, rule).to_string();
        self.call_raw(&[
            "ec2",
            "authorize-security-group-ingress",
            "--group-id",
            &group.id,
            "--ip-permissions",
            &permissions,
        ])?;
        Ok(())
    }

    #[instrument(skip_all, fields(image = %request.image_id))]
    fn run_instances(&self, request: &RunInstancesRequest) -> Result<Reservation> {
        let count = format!("{}:{}", request.min_count, request.max_count);
        let mut args: Vec<String> = vec![
            "ec2".into(),
            "run-instances".into(),
            "--image-id".into(),
            request.image_id.clone(),
            "--count".into(),
            count,
        ];
        if let Some(keypair) = &request.keypair {
            args.extend(["--key-name".into(), keypair.clone()]);
        }
        if !request.security_groups.is_empty() {
            args.push("--security-groups".into());
            args.extend(request.security_groups.iter().cloned());
        }
        if let Some(user_data) = &request.user_data {
            args.extend(["--user-data".into(), user_data.clone()]);
        }
        if let Some(zone) = &request.placement {
            args.extend(["--placement".into(), format!("AvailabilityZone={zone}")]);
        }
        if let Some(instance_type) = &request.instance_type {
            args.extend(["--instance-type".into(), instance_type.clone()]);
        }
        let argv: Vec<&str> = args.iter().map(String::as_str).collect();
        let resp: AwsReservation = self.call(&argv)?;
        Ok(resp.into_reservation())
    }

    fn get_instances(&self, ids: &[String]) -> Result<Vec<Instance>> {
        let mut args = vec!["ec2", "describe-instances", "--instance-ids"];
        args.extend(ids.iter().map(String::as_str));
        let resp: DescribeInstances = self.call(&args)?;
        Ok(resp
            .reservations
            .into_iter()
            .flat_map(|r| r.instances)
            .map(AwsInstance::into_instance)
            .collect())
    }

    #[instrument(skip(self))]
    fn create_volume(&self, size_gb: u32, zone: &str) -> Result<Volume> {
        let size = size_gb.to_string();
        let resp: AwsVolume = self.call(&[
            "ec2",
            "create-volume",
            "--size",
            &size,
            "--availability-zone",
            zone,
        ])?;
        Ok(resp.into_volume())
    }

    fn get_volumes(&self, ids: &[String]) -> Result<Vec<Volume>> {
        let mut args = vec!["ec2", "describe-volumes", "--volume-ids"];
        args.extend(ids.iter().map(String::as_str));
        let resp: DescribeVolumes = self.call(&args)?;
        Ok(resp.volumes.into_iter().map(AwsVolume::into_volume).collect())
    }

    #[instrument(skip(self))]
    fn attach_volume(
        &self,
        volume_id: &str,
        instance_id: &str,
        device: &str,
    ) -> Result<VolumeState> {
        let resp: AwsAttachment = self.call(&[
            "ec2",
            "attach-volume",
            "--volume-id",
            volume_id,
            "--instance-id",
            instance_id,
            "--device",
            device,
        ])?;
        Ok(VolumeState::parse(&resp.state))
    }
}

/// Build the `--ip-permissions` JSON for one rule.
fn ip_permissions(group: &SecurityGroup, rule: &IngressRule) -> serde_json::Value {
    let mut permission = json!({
        "IpProtocol": rule.protocol.as_str(),
        "FromPort": rule.from_port,
        "ToPort": rule.to_port,
    });
    match &rule.source {
        RuleSource::Cidr(cidr) => {
            permission["IpRanges"] = json!([{ "CidrIp": cidr }]);
        }
        RuleSource::SameGroup => {
            permission["UserIdGroupPairs"] = json!([{ "GroupId": group.id }]);
        }
    }
    json!([permission])
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CallerIdentity {
    account: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeImages {
    #[serde(default)]
    images: Vec<AwsImage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsImage {
    image_id: String,
    name: Option<String>,
    state: Option<String>,
}

impl AwsImage {
    fn into_image(self) -> Image {
        Image {
            id: self.image_id,
            name: self.name,
            state: self.state,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeSecurityGroups {
    #[serde(default)]
    security_groups: Vec<AwsSecurityGroup>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsSecurityGroup {
    group_id: String,
    group_name: String,
    #[serde(default)]
    description: String,
}

impl AwsSecurityGroup {
    fn into_group(self) -> SecurityGroup {
        SecurityGroup {
            id: self.group_id,
            name: self.group_name,
            description: self.description,
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateSecurityGroup {
    group_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeInstances {
    #[serde(default)]
    reservations: Vec<AwsReservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsReservation {
    #[serde(default)]
    reservation_id: String,
    #[serde(default)]
    instances: Vec<AwsInstance>,
}

impl AwsReservation {
    fn into_reservation(self) -> Reservation {
        Reservation {
            id: self.reservation_id,
            instances: self
                .instances
                .into_iter()
                .map(AwsInstance::into_instance)
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsInstance {
    instance_id: String,
    state: AwsInstanceState,
    #[serde(default)]
    placement: AwsPlacement,
    public_dns_name: Option<String>,
    public_ip_address: Option<String>,
    private_ip_address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsInstanceState {
    name: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsPlacement {
    #[serde(default)]
    availability_zone: String,
}

impl AwsInstance {
    fn into_instance(self) -> Instance {
        Instance {
            id: self.instance_id,
            state: InstanceState::parse(&self.state.name),
            zone: self.placement.availability_zone,
            public_dns_name: self.public_dns_name.filter(|s| !s.is_empty()),
            public_ip: self.public_ip_address,
            private_ip: self.private_ip_address,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeVolumes {
    #[serde(default)]
    volumes: Vec<AwsVolume>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsVolume {
    volume_id: String,
    state: String,
    size: u32,
    availability_zone: String,
}

impl AwsVolume {
    fn into_volume(self) -> Volume {
        Volume {
            id: self.volume_id,
            state: VolumeState::parse(&self.state),
            size_gb: self.size,
            zone: self.availability_zone,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsAttachment {
    state: String,
}
