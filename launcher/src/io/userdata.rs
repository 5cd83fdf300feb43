//! First-boot script rendering.
//!
//! Template files are minijinja templates rendered against the flattened
//! settings (`{{ default_project_name }}`, `{{ webserver_aws_type }}`, ...) plus
//! `machine_class`. Undefined placeholders are errors, never empty strings.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use minijinja::{Environment, UndefinedBehavior};
use tracing::debug;

use crate::core::failure::ProvisionError;
use crate::core::settings::Settings;

/// Default readiness marker written by the script trailer.
pub const DEFAULT_READY_MARKER: &str = "/etc/ec2/created";

/// Build the substitution map for a launch of `class`.
pub fn substitutions(settings: &Settings, class: &str) -> BTreeMap<String, String> {
    let mut vars = settings.flatten();
    vars.insert("machine_class".to_string(), class.to_string());
    vars
}

/// Render the named templates, in order, followed by the readiness trailer.
///
/// Relative paths are resolved against `base_dir`.
pub fn render(
    base_dir: &Path,
    template_files: &[String],
    vars: &BTreeMap<String, String>,
    ready_marker: &str,
) -> Result<String> {
    let mut env = Environment::new();
    env.set_undefined_behavior(UndefinedBehavior::Strict);
    env.set_keep_trailing_newline(true);

    let mut data = String::new();
    for name in template_files {
        let path = base_dir.join(name);
        let source = fs::read_to_string(&path).map_err(|err| {
            ProvisionError::config(format!("read userdata template {}: {err}", path.display()))
        })?;
        let rendered = env
            .render_str(&source, vars)
            .map_err(|err| {
                ProvisionError::config(format!(
                    "render userdata template {}: {err}",
                    path.display()
                ))
            })
            .with_context(|| format!("template {name}"))?;
        debug!(template = %path.display(), bytes = rendered.len(), "rendered userdata template");
        data.push_str(&rendered);
        data.push('\n');
    }
    data.push_str(&trailer(ready_marker));
    Ok(data)
}

/// Shell lines that stamp the readiness marker with the boot-time epoch.
pub fn trailer(ready_marker: &str) -> String {
    let dir = Path::new(ready_marker)
        .parent()
        .map(|p| p.display().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "/".to_string());
    format!("mkdir -p {dir}\ndate \"+%s\" > {ready_marker}\n")
}
