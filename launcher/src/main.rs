//! `launch`: provision one cloud host from a config file.
//!
//! Prints a JSON run summary on stdout; diagnostics go to stderr.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;

use launcher::core::settings::DEFAULT_SECTION;
use launcher::exit_codes;
use launcher::io::config::load_config;
use launcher::io::provider::AwsCliProvider;
use launcher::io::remote::SshShell;
use launcher::logging;
use launcher::run::{RunCaches, RunContext, RunOutcome, RunRequest, remote_driver, run_provisioning};

const DEFAULT_SSH_USER: &str = "root";

#[derive(Parser, Debug)]
#[command(
    name = "launch",
    version,
    about = "Launch one cloud instance, wait for it to boot and optionally mount a volume"
)]
struct Cli {
    /// Settings file (TOML).
    #[arg(short, long)]
    config: PathBuf,

    /// Private key for SSH; readiness and volume mounting need it.
    #[arg(short = 's', long = "ssh-key")]
    ssh_key: Option<PathBuf>,

    /// Debug-level logging unless `RUST_LOG` is set.
    #[arg(short, long)]
    verbose: bool,

    /// Settings section consulted before `[default]`.
    #[arg(long, default_value = DEFAULT_SECTION)]
    class: String,

    /// Extra security group for the instance; repeatable.
    #[arg(short, long = "group")]
    groups: Vec<String>,
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);
    std::process::exit(run(&cli));
}

fn run(cli: &Cli) -> i32 {
    let loaded = match load_config(&cli.config) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("{err:#}");
            return exit_codes::INVALID;
        }
    };
    let settings = &loaded.settings;
    let launcher = &loaded.launcher;
    let class = cli.class.as_str();

    let user = settings
        .resolve("ssh_user", Some(class))
        .unwrap_or(DEFAULT_SSH_USER);
    let shell = SshShell::new(
        user,
        cli.ssh_key.clone(),
        launcher.command_timeout(),
        launcher.output_limit_bytes,
    );
    let driver = remote_driver(shell, settings, class, launcher);
    let ctx = RunContext {
        settings,
        base_dir: loaded.base_dir(),
        launcher,
    };
    let request = RunRequest {
        class: class.to_string(),
        extra_groups: cli.groups.clone(),
    };

    let outcome = run_provisioning(
        || {
            AwsCliProvider::connect(
                settings,
                launcher.command_timeout(),
                launcher.provider_output_limit_bytes,
            )
        },
        &driver,
        &ctx,
        &mut RunCaches::default(),
        &request,
    );

    if let Err(err) = print_json(&outcome.summary()) {
        eprintln!("{err:#}");
    }
    exit_code(&outcome)
}

fn exit_code(outcome: &RunOutcome) -> i32 {
    if outcome.succeeded() {
        exit_codes::OK
    } else {
        exit_codes::FAILED
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize run summary")?;
    println!("{payload}");
    Ok(())
}
