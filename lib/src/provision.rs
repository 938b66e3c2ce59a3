//! # Background qube provisioning
//!
//! Creates a qube through an [`AdminApi`], assigns its properties one by
//! one and grows its private volume.  The work runs on a blocking thread;
//! the caller gets a [`ProvisionHandle`] and hears back exactly once, when
//! everything is done or something failed.
//!
//! Properties are applied individually and nothing is rolled back: if an
//! assignment fails, the qube exists with the properties set before it.

use std::collections::BTreeMap;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::admin::{AdminApi, NewVm, PropertyValue};

/// Size the private volume of a new qube is grown to: 60 GiB.
pub const DEFAULT_PRIVATE_VOLUME_SIZE: u64 = 60 * 1024 * 1024 * 1024;

/// Longest name the admin API accepts.
const VM_NAME_MAX: usize = 31;

/// The qube classes that can be provisioned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VmClass {
    /// A qube whose root filesystem comes from a template.
    AppVm,
    /// A template for other qubes.
    TemplateVm,
    /// A self-contained qube.
    StandaloneVm,
    /// A disposable template.
    DispVm,
}

impl VmClass {
    /// Whether a qube of this class cannot exist without a template.
    pub fn requires_template(&self) -> bool {
        matches!(self, VmClass::AppVm | VmClass::DispVm)
    }
}

impl Display for VmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            VmClass::AppVm => "AppVM",
            VmClass::TemplateVm => "TemplateVM",
            VmClass::StandaloneVm => "StandaloneVM",
            VmClass::DispVm => "DispVM",
        };
        f.write_str(s)
    }
}

impl FromStr for VmClass {
    type Err = RequestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            VmClass::AppVm,
            VmClass::TemplateVm,
            VmClass::StandaloneVm,
            VmClass::DispVm,
        ]
        .into_iter()
        .find(|c| c.to_string().eq_ignore_ascii_case(s))
        .ok_or_else(|| RequestError::UnknownClass(s.to_owned()))
    }
}

/// Ways a [`VmRequest`] can be malformed.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    /// Not one of the known classes.
    #[error("Unknown qube class {0:?}")]
    UnknownClass(String),
    /// The name contains characters other than ASCII alphanumerics, `_`
    /// and `-`, or is too long.
    #[error("Invalid qube name {0:?}")]
    InvalidName(String),
    /// The class needs a template and none was given.
    #[error("A template is required for {0}")]
    MissingTemplate(VmClass),
    /// Empty label.
    #[error("A label is required")]
    MissingLabel,
}

/// Everything needed to create one qube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmRequest {
    /// The class of qube.
    pub class: VmClass,
    /// Its name; uniqueness is checked by the admin API.
    pub name: String,
    /// Its label.
    pub label: String,
    /// Template to base it on.
    pub template: Option<String>,
    /// Properties to assign after creation.
    pub properties: BTreeMap<String, PropertyValue>,
    /// Storage pool; `None` for the default.
    pub pool: Option<String>,
}

impl VmRequest {
    /// A request with no properties in the default pool.
    pub fn new(class: VmClass, name: impl Into<String>, label: impl Into<String>) -> Self {
        Self {
            class,
            name: name.into(),
            label: label.into(),
            template: None,
            properties: BTreeMap::new(),
            pool: None,
        }
    }

    /// Check the request without contacting the admin API.
    pub fn validate(&self) -> Result<(), RequestError> {
        let name_ok = !self.name.is_empty()
            && self.name.len() <= VM_NAME_MAX
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'));
        if !name_ok {
            return Err(RequestError::InvalidName(self.name.clone()));
        }
        if self.label.is_empty() {
            return Err(RequestError::MissingLabel);
        }
        if self.class.requires_template() && self.template.is_none() {
            return Err(RequestError::MissingTemplate(self.class));
        }
        Ok(())
    }

    /// The properties actually assigned.  A standalone qube without a
    /// template boots its own kernel in HVM mode unless told otherwise.
    pub fn effective_properties(&self) -> BTreeMap<String, PropertyValue> {
        let mut props = self.properties.clone();
        if self.class == VmClass::StandaloneVm && self.template.is_none() {
            props
                .entry("virt_mode".into())
                .or_insert_with(|| PropertyValue::Str("hvm".into()));
            props
                .entry("kernel".into())
                .or_insert_with(|| PropertyValue::Str(String::new()));
        }
        props
    }

    fn new_vm(&self) -> NewVm {
        NewVm {
            class: self.class,
            name: self.name.clone(),
            label: self.label.clone(),
            template: self.template.clone(),
            pool: self.pool.clone(),
        }
    }
}

/// How a provisioning task ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProvisionOutcome {
    /// The qube was created and fully configured.
    Success,
    /// Something failed; the qube may exist in a partially configured state.
    Error(String),
}

impl ProvisionOutcome {
    /// Whether the task succeeded.
    pub fn is_success(&self) -> bool {
        matches!(self, ProvisionOutcome::Success)
    }
}

fn provision(api: &dyn AdminApi, request: &VmRequest, volume_size: u64) -> Result<()> {
    request.validate()?;
    let name = &request.name;
    tracing::info!("Creating {} {name}", request.class);
    api.create_vm(&request.new_vm())?;
    for (prop, value) in request.effective_properties() {
        tracing::debug!("Setting {name}.{prop} = {value}");
        // Earlier assignments stay applied if this one fails
        api.set_property(name, &prop, &value)
            .with_context(|| format!("Qube {name} was created but not fully configured"))?;
    }
    tracing::debug!("Resizing {name}:private to {volume_size}");
    api.resize_volume(name, "private", volume_size)
        .with_context(|| format!("Qube {name} was created but its volume was not resized"))?;
    tracing::info!("Provisioned {name}");
    Ok(())
}

/// Submits provisioning requests against one admin API.
#[derive(Debug, Clone)]
pub struct ProvisionTask {
    api: Arc<dyn AdminApi>,
    volume_size: u64,
}

impl ProvisionTask {
    /// Provision through `api`, growing private volumes to the default size.
    pub fn new(api: Arc<dyn AdminApi>) -> Self {
        Self {
            api,
            volume_size: DEFAULT_PRIVATE_VOLUME_SIZE,
        }
    }

    /// Override the private volume target size, in bytes.
    pub fn with_volume_size(mut self, size: u64) -> Self {
        self.volume_size = size;
        self
    }

    /// Start provisioning `request` in the background.
    pub fn submit(&self, request: VmRequest) -> ProvisionHandle {
        let api = Arc::clone(&self.api);
        let size = self.volume_size;
        let task = tokio::task::spawn_blocking(move || provision(api.as_ref(), &request, size));
        ProvisionHandle { task }
    }
}

/// A provisioning request running in the background.
#[derive(Debug)]
pub struct ProvisionHandle {
    task: JoinHandle<Result<()>>,
}

impl ProvisionHandle {
    /// Whether the task has completed.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for completion.  Errors, including a panic of the task, are
    /// returned as [`ProvisionOutcome::Error`].
    pub async fn wait(self) -> ProvisionOutcome {
        match self.task.await {
            Ok(Ok(())) => ProvisionOutcome::Success,
            Ok(Err(e)) => ProvisionOutcome::Error(format!("{e:#}")),
            Err(e) => ProvisionOutcome::Error(format!("Provisioning task failed: {e}")),
        }
    }
}
