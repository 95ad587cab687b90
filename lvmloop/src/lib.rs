//! lvmloop: declarative loop-backed LVM provisioning.
//!
//! A backing file is bound to a kernel-assigned loop device, turned into exactly one
//! PV -> VG -> LV chain, formatted and mounted. Every step checks what already exists first,
//! so re-running a provision in idempotent mode changes nothing.

pub mod allocator;
pub mod cli;
pub mod config;
pub mod errors;
pub mod filesystem;
pub mod logging;
pub mod provisioner;
pub mod report;
pub mod size;
pub mod topology;

pub use errors::{ErrorCategory, ProvisionError, Stage};
pub use provisioner::{Provisioned, Provisioner};
pub use report::{Outcome, ProvisionReport, StepReport};

use anyhow::Context;
use cli::{Cli, Command};
use config::{PartialConfig, ProvisionConfig};
use lvmloop_hal::{LinuxHal, SystemHal};
use serde::Serialize;

/// Exit status for an error returned by [`run`].
pub fn exit_code_for(err: &anyhow::Error) -> u8 {
    err.downcast_ref::<ProvisionError>()
        .map(ProvisionError::exit_code)
        .unwrap_or(1)
}

/// Merge the config file (if any) with the command's flag overrides.
pub fn load_config(cli: &Cli) -> Result<ProvisionConfig, ProvisionError> {
    let file = match &cli.config {
        Some(path) => PartialConfig::load(path)?,
        None => PartialConfig::default(),
    };
    file.merge(cli.command.config_args().to_partial()).resolve()
}

pub fn run(cli: &Cli) -> anyhow::Result<()> {
    run_with(&LinuxHal::new(), cli)
}

pub fn run_with<H: SystemHal + ?Sized>(hal: &H, cli: &Cli) -> anyhow::Result<()> {
    let config = load_config(cli)?;
    log::debug!("effective config: {:?}", config);
    let provisioner = Provisioner::new(hal, cli.dry_run);

    match &cli.command {
        Command::Provision { .. } => {
            let provisioned = provisioner.provision(&config)?;
            emit(cli.json, &provisioned, &provisioned.report)
        }
        Command::Teardown {
            remove_backing_file,
            ..
        } => {
            let report = provisioner.teardown(&config, *remove_backing_file)?;
            emit(cli.json, &report, &report)
        }
        Command::Status { .. } => {
            let report = provisioner.status(&config)?;
            emit(cli.json, &report, &report)
        }
    }
}

fn emit<T: Serialize>(json: bool, value: &T, report: &ProvisionReport) -> anyhow::Result<()> {
    if json {
        let text = serde_json::to_string_pretty(value).context("failed to serialize report")?;
        println!("{text}");
    } else {
        print!("{report}");
    }
    Ok(())
}
