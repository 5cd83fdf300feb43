//! Instance launch: image, security groups, bootstrap data, launch call, boot wait.

use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::failure::ProvisionError;
use crate::core::poll::{Poll, PollExit, PollPolicy};
use crate::core::settings::Settings;
use crate::core::types::{Image, Instance, InstanceState};
use crate::groups::{EnsureOptions, GroupCache};
use crate::io::provider::{Provider, RunInstancesRequest};
use crate::io::userdata;

/// Images resolved during one run, keyed by id.
#[derive(Debug, Default)]
pub struct ImageCache {
    images: HashMap<String, Image>,
}

impl ImageCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the image with `image_id`, asking the provider at most once per id.
    pub fn load<P: Provider>(&mut self, provider: &P, image_id: &str) -> Result<Image> {
        if let Some(image) = self.images.get(image_id) {
            return Ok(image.clone());
        }
        let image = provider
            .get_image(image_id)
            .map_err(|err| ProvisionError::provider(format!("resolve image {image_id}: {err:#}")))?;
        debug!(image = image_id, name = ?image.name, "resolved image");
        self.images.insert(image_id.to_string(), image.clone());
        Ok(image)
    }
}

/// What to launch: the machine class and extra security groups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    /// Settings section consulted before `[default]`.
    pub class: String,
    pub extra_groups: Vec<String>,
}

impl LaunchRequest {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            class: class.into(),
            extra_groups: Vec::new(),
        }
    }
}

/// Inputs a launch reads besides the provider and caches.
#[derive(Debug, Clone, Copy)]
pub struct LaunchContext<'a> {
    pub settings: &'a Settings,
    /// Directory relative template paths are resolved against.
    pub base_dir: &'a Path,
    pub poll: PollPolicy,
    /// File the bootstrap trailer stamps once user data has run.
    pub ready_marker: &'a str,
}

/// Ordered, de-duplicated group names for a launch.
///
/// Starts from the configured list, adds the project group if missing, then
/// appends `extra`. Extra names must be non-empty and free of commas and
/// whitespace.
pub fn security_group_names(
    configured: Vec<String>,
    project: Option<&str>,
    extra: &[String],
) -> Result<Vec<String>> {
    for name in extra {
        if name.is_empty() || name.contains(',') || name.chars().any(char::is_whitespace) {
            return Err(
                ProvisionError::precondition(format!("invalid security group name {name:?}"))
                    .into(),
            );
        }
    }

    let mut names: Vec<String> = Vec::with_capacity(configured.len() + extra.len() + 1);
    let project = project.map(str::to_string);
    for name in configured.into_iter().chain(project).chain(extra.iter().cloned()) {
        if !names.contains(&name) {
            names.push(name);
        }
    }
    Ok(names)
}

/// Launch one instance for `request.class` and wait until it is running.
///
/// The returned instance comes from a fresh fetch after boot, so its network
/// addresses are populated.
#[instrument(skip_all, fields(class = %request.class))]
pub fn launch_instance<P: Provider>(
    provider: &P,
    ctx: &LaunchContext<'_>,
    images: &mut ImageCache,
    groups: &mut GroupCache,
    request: &LaunchRequest,
) -> Result<Instance> {
    let settings = ctx.settings;
    let class = Some(request.class.as_str());

    let image_id = settings.require("aws_ami", class)?;
    let image = images.load(provider, image_id)?;

    let group_names = security_group_names(
        settings.resolve_list("aws_security_groups", class),
        settings.resolve("project_name", class),
        &request.extra_groups,
    )?;
    for name in &group_names {
        groups.ensure(provider, name, EnsureOptions::default())?;
    }

    let user_data = render_user_data(ctx, &request.class)?;

    let launch = RunInstancesRequest {
        image_id: image.id.clone(),
        count: 1,
        min_count: 1,
        max_count: 1,
        keypair: settings.resolve("aws_keypair", class).map(str::to_string),
        security_groups: group_names,
        user_data,
        placement: settings.resolve("aws_zone", class).map(str::to_string),
        instance_type: settings.resolve("aws_type", class).map(str::to_string),
    };
    let reservation = provider
        .run_instances(&launch)
        .map_err(|err| ProvisionError::provider(format!("launch {}: {err:#}", image.id)))?;
    let id = reservation
        .instances
        .first()
        .map(|i| i.id.clone())
        .ok_or_else(|| {
            ProvisionError::provider(format!("reservation {} has no instances", reservation.id))
        })?;
    info!(instance = %id, reservation = %reservation.id, "launch requested");

    wait_for_running(provider, &id, ctx.poll)?;
    let instance = refresh_instance(provider, &id)?;
    log_instance_info(&request.class, &instance);
    Ok(instance)
}

fn render_user_data(ctx: &LaunchContext<'_>, class: &str) -> Result<Option<String>> {
    let files = ctx.settings.resolve_list("userdata_files", Some(class));
    if files.is_empty() {
        debug!("no userdata templates; launching without user data");
        return Ok(None);
    }
    let vars = userdata::substitutions(ctx.settings, class);
    let data = userdata::render(ctx.base_dir, &files, &vars, ctx.ready_marker)
        .context("render user data")?;
    Ok(Some(data))
}

/// Poll until `id` is running. Failed polls are logged and use up an attempt.
fn wait_for_running<P: Provider>(provider: &P, id: &str, poll: PollPolicy) -> Result<()> {
    let ids = vec![id.to_string()];
    poll.run(|attempt| match provider.get_instances(&ids) {
        Ok(found) => match found.into_iter().next() {
            Some(instance) if instance.state == InstanceState::Running => Poll::Ready(()),
            Some(instance) if instance.state.is_dead_end() => Poll::Abort(
                ProvisionError::provider(format!(
                    "instance {id} entered {} while booting",
                    instance.state.as_str()
                ))
                .into(),
            ),
            Some(instance) => {
                debug!(attempt, state = instance.state.as_str(), "instance not running yet");
                Poll::Pending
            }
            None => {
                warn!(attempt, instance = id, "instance not visible yet");
                Poll::Pending
            }
        },
        Err(err) => {
            warn!(attempt, instance = id, error = %format!("{err:#}"), "instance poll failed");
            Poll::Pending
        }
    })
    .map_err(|exit| match exit {
        PollExit::Exhausted { attempts } => anyhow::Error::from(ProvisionError::timeout(format!(
            "instance {id} not running after {attempts} polls"
        ))),
        PollExit::Aborted(err) => err,
    })
}

/// Fetch `id` once more; launch and poll responses may lack addresses.
pub fn refresh_instance<P: Provider>(provider: &P, id: &str) -> Result<Instance> {
    provider
        .get_instances(&[id.to_string()])
        .map_err(|err| ProvisionError::provider(format!("refresh instance {id}: {err:#}")))?
        .into_iter()
        .next()
        .ok_or_else(|| ProvisionError::provider(format!("instance {id} disappeared")).into())
}

pub fn log_instance_info(class: &str, instance: &Instance) {
    info!(
        class,
        instance = %instance.id,
        zone = %instance.zone,
        public_dns = instance.public_dns_name.as_deref().unwrap_or("-"),
        public_ip = instance.public_ip.as_deref().unwrap_or("-"),
        private_ip = instance.private_ip.as_deref().unwrap_or("-"),
        "instance running"
    );
}
