//! # Qube provisioning CLI
//!
//! Command line front end: list the catalog, run an installation workflow,
//! or create a qube through the admin API.

use std::ffi::OsString;
use std::io::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use clap::Parser;

use crate::admin::{PropertyValue, QvmTools};
use crate::catalog::Catalog;
use crate::config::{load_config, Config};
use crate::console::{LiveConsole, Tee};
use crate::executor::Executor;
use crate::generate::{generate, GenerateParams};
use crate::provision::{ProvisionOutcome, ProvisionTask, VmClass, VmRequest};
use crate::sandbox::{RunId, VmRef};
use crate::utils::async_task_with_spinner;

/// List the available installations
#[derive(Debug, Parser)]
pub(crate) struct ListOpts {
    /// Output the full catalog as JSON.
    #[clap(long)]
    pub(crate) json: bool,
}

/// Run an installation workflow
#[derive(Debug, Parser)]
pub(crate) struct InstallOpts {
    /// Catalog id of the installation.
    pub(crate) id: String,

    /// Disposable template the worker qube is derived from; defaults to
    /// `default-template` from the configuration.
    #[clap(long)]
    pub(crate) template: Option<String>,

    /// Name of the qube to create.
    #[clap(long)]
    pub(crate) name: Option<String>,

    /// Network provider for the new qube.
    #[clap(long)]
    pub(crate) netvm: Option<String>,

    /// Label of the new qube.
    #[clap(long)]
    pub(crate) label: Option<String>,

    /// Use this run id instead of generating one.  It must not be shared
    /// with any other running workflow.
    #[clap(long)]
    pub(crate) run_id: Option<String>,

    /// Print the generated script and exit without running it.
    #[clap(long)]
    pub(crate) print_script: bool,
}

/// Create a qube and grow its private volume
#[derive(Debug, Parser)]
pub(crate) struct CreateVmOpts {
    /// Name of the new qube.
    pub(crate) name: String,

    /// Qube class: AppVM, TemplateVM, StandaloneVM or DispVM.
    #[clap(long)]
    pub(crate) class: VmClass,

    /// Label of the new qube.
    #[clap(long)]
    pub(crate) label: String,

    /// Template to base the qube on.
    #[clap(long)]
    pub(crate) template: Option<String>,

    /// Storage pool for the qube's volumes.
    #[clap(long)]
    pub(crate) pool: Option<String>,

    /// Property to set after creation, as KEY=VALUE; may be repeated.
    #[clap(long = "property", value_parser = parse_property)]
    pub(crate) properties: Vec<(String, PropertyValue)>,
}

fn parse_property(s: &str) -> Result<(String, PropertyValue), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("Expected KEY=VALUE, found {s:?}"))?;
    if k.is_empty() {
        return Err(format!("Empty property name in {s:?}"));
    }
    Ok((k.to_owned(), PropertyValue::parse(v)))
}

/// Provision third-party qubes through disposable workers.
#[derive(Debug, Parser)]
#[clap(name = "qvm-provision")]
#[clap(rename_all = "kebab-case")]
#[clap(version, long_version = clap::crate_version!())]
pub(crate) enum Opt {
    /// List the installation catalog.
    List(ListOpts),
    /// Install a catalog entry.
    ///
    /// A disposable worker is created from the template, the artifact is
    /// fetched inside it and installed, and the worker is destroyed again
    /// even if the installation fails.
    Install(InstallOpts),
    /// Create a qube via the admin API.
    CreateVm(CreateVmOpts),
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    match config.catalog.as_deref() {
        Some(path) => Catalog::load(path),
        None => Catalog::builtin(),
    }
}

fn list(config: &Config, opts: ListOpts) -> Result<()> {
    let catalog = load_catalog(config)?;
    let mut out = std::io::stdout().lock();
    if opts.json {
        serde_json::to_writer_pretty(&mut out, catalog.list())?;
        writeln!(out)?;
        return Ok(());
    }
    for d in catalog.list() {
        match d.kind() {
            None => writeln!(out, "{}:", d.group_label)?,
            Some(kind) => writeln!(out, "  {} ({kind})", d.id)?,
        }
    }
    Ok(())
}

async fn install(config: &Config, opts: InstallOpts) -> Result<()> {
    let catalog = load_catalog(config)?;
    let template = opts
        .template
        .or_else(|| config.default_template.clone())
        .ok_or_else(|| anyhow!("No --template given and no default-template configured"))?;
    let run_id = match opts.run_id {
        Some(id) => RunId::new(id)?,
        None => RunId::generate(),
    };
    let params = GenerateParams {
        target_name: opts.name,
        network: opts.netvm.map(VmRef::new),
        label: opts.label,
        ..GenerateParams::new(run_id, VmRef::new(template))
    };
    let workflow = generate(&catalog, &opts.id, &params)?;
    if opts.print_script {
        print!("{}", workflow.linearize());
        return Ok(());
    }

    let executor = Executor::new(config.shell(), config.policy());
    let sink = Tee::new(std::io::stdout(), LiveConsole::new());
    let handle = executor.spawn(workflow, sink);
    let cancel = handle.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted; cleaning up");
            cancel.cancel();
        }
    });
    let (outcome, _) = handle.wait().await?;
    println!("{outcome}");
    if !outcome.is_success() {
        bail!("Installation of {} failed", opts.id);
    }
    Ok(())
}

async fn create_vm(config: &Config, opts: CreateVmOpts) -> Result<()> {
    let mut request = VmRequest::new(opts.class, opts.name, opts.label);
    request.template = opts.template;
    request.pool = opts.pool;
    request.properties.extend(opts.properties);
    request.validate()?;
    let task = ProvisionTask::new(Arc::new(QvmTools::default()))
        .with_volume_size(config.private_volume_size());
    let msg = format!("Creating {} {}", request.class, request.name);
    let handle = task.submit(request);
    match async_task_with_spinner(&msg, handle.wait()).await {
        ProvisionOutcome::Success => Ok(()),
        ProvisionOutcome::Error(e) => Err(anyhow!(e)),
    }
}

/// Parse the provided arguments and execute.
/// Calls [`clap::Error::exit`] on failure, printing the error message and aborting the program.
pub async fn run_from_iter<I>(args: I) -> Result<()>
where
    I: IntoIterator,
    I::Item: Into<OsString> + Clone,
{
    run_from_opt(Opt::parse_from(args)).await
}

/// Internal (non-generic/monomorphized) primary CLI entrypoint
async fn run_from_opt(opt: Opt) -> Result<()> {
    let config = load_config().context("Reading configuration")?;
    match opt {
        Opt::List(opts) => list(&config, opts),
        Opt::Install(opts) => install(&config, opts).await,
        Opt::CreateVm(opts) => create_vm(&config, opts).await,
    }
}
