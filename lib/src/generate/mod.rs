//! # Script generation
//!
//! Turns a catalog entry plus the caller's selections into a [`Workflow`].
//! Generation is pure: nothing here looks at the running system, every
//! runtime condition is compiled into the emitted shell text.

use thiserror::Error;

use crate::catalog::{Catalog, InstallKind, Installation};
use crate::sandbox::{bracket, RunId, VmRef};
use crate::step::Workflow;

mod fetch;
mod image;
mod media;
mod repo;

/// Reasons a workflow cannot be generated; nothing has been executed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum GenerateError {
    /// The id is not in the catalog.
    #[error("Unknown installation: {0}")]
    UnknownInstallation(String),
    /// The id names a group separator.
    #[error("{0} is a group separator, not an installation")]
    NotSelectable(String),
    /// The install kind needs a parameter the caller did not supply.
    #[error("Installation {id} ({kind}) requires a {param}")]
    MissingParameter {
        /// The installation id.
        id: String,
        /// Its install kind.
        kind: InstallKind,
        /// Name of the missing parameter.
        param: &'static str,
    },
    /// The run id cannot be used to derive qube names.
    #[error("Invalid run id {0:?}")]
    InvalidRunId(String),
    /// The target name is not a valid qube name.
    #[error("Invalid qube name {0:?}")]
    InvalidName(String),
}

/// The caller's selections for one provisioning request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerateParams {
    /// Correlation id of this run.
    pub run_id: RunId,
    /// Disposable template the worker is derived from.
    pub source_template: VmRef,
    /// Name of the qube to create, for kinds that create one.
    pub target_name: Option<String>,
    /// Network provider to attach; `None` keeps the system default.
    pub network: Option<VmRef>,
    /// Label of the qube to create.
    pub label: Option<String>,
}

impl GenerateParams {
    /// Parameters with only the mandatory fields set.
    pub fn new(run_id: RunId, source_template: VmRef) -> Self {
        Self {
            run_id,
            source_template,
            target_name: None,
            network: None,
            label: None,
        }
    }
}

/// Whether `name` is acceptable as a qube name.
pub(crate) fn is_valid_vm_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        && name.len() <= 31
}

/// Check the parameters `kind` depends on and return the target name, if any.
fn validate<'p>(
    id: &str,
    kind: InstallKind,
    params: &'p GenerateParams,
) -> Result<Option<&'p str>, GenerateError> {
    let missing = |param| GenerateError::MissingParameter {
        id: id.to_owned(),
        kind,
        param,
    };
    let name = if kind.needs_target_name() {
        let name = params
            .target_name
            .as_deref()
            .ok_or_else(|| missing("target name"))?;
        if !is_valid_vm_name(name) {
            return Err(GenerateError::InvalidName(name.to_owned()));
        }
        Some(name)
    } else {
        None
    };
    if kind.needs_label() && params.label.is_none() {
        return Err(missing("label"));
    }
    Ok(name)
}

/// Build the workflow installing `installation_id` with `params`.
///
/// The result always starts with the disposable worker's create step and
/// ends with its teardown step.
pub fn generate(
    catalog: &Catalog,
    installation_id: &str,
    params: &GenerateParams,
) -> Result<Workflow, GenerateError> {
    let descriptor = catalog
        .lookup(installation_id)
        .ok_or_else(|| GenerateError::UnknownInstallation(installation_id.to_owned()))?;
    let install = descriptor
        .install
        .as_ref()
        .ok_or_else(|| GenerateError::NotSelectable(installation_id.to_owned()))?;
    let name = validate(installation_id, install.kind(), params)?;
    let bracket = bracket(&params.source_template, &params.run_id);
    let worker = bracket.worker();
    tracing::debug!(
        "Generating {} workflow for {installation_id} (run {})",
        install.kind(),
        params.run_id
    );
    // Presence was checked by validate() for the kinds that use these
    let name = name.unwrap_or_default();
    let label = params.label.as_deref().unwrap_or_default();
    let body = match install {
        Installation::Image { source, kernel } => {
            image::body(worker, source, kernel, name, label, params.network.as_ref())
        }
        Installation::BootableMedia {
            repository,
            branch,
            packages,
        } => media::body(
            worker,
            installation_id,
            repository,
            branch,
            packages,
            name,
            params.network.as_ref(),
        ),
        Installation::PackageRepo {
            source,
            key_url,
            keyring,
        } => repo::body(worker, source, key_url, keyring),
    };
    Ok(Workflow::bracketed(bracket, body))
}
