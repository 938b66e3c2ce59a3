//! # Administration API
//!
//! The subset of the Qubes admin interface needed to provision a qube.
//! [`QvmTools`] implements it with the `qvm-*` command line tools.

use std::fmt::Display;
use std::process::Command;

use anyhow::Result;
use fn_error_context::context;
use qvm_provision_utils::CommandRunExt;

use crate::provision::VmClass;

/// A qube property value as understood by `qvm-prefs`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PropertyValue {
    /// A boolean property.
    Bool(bool),
    /// An integer property (memory sizes, vcpus...).
    Int(i64),
    /// Anything else, including references to other qubes.
    Str(String),
}

impl PropertyValue {
    /// Interpret a command line value: `true`/`false` (any case) are
    /// booleans, decimal numbers are integers, the rest are strings.
    pub fn parse(s: &str) -> Self {
        if s.eq_ignore_ascii_case("true") {
            Self::Bool(true)
        } else if s.eq_ignore_ascii_case("false") {
            Self::Bool(false)
        } else if let Ok(v) = s.parse() {
            Self::Int(v)
        } else {
            Self::Str(s.to_owned())
        }
    }
}

impl Display for PropertyValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PropertyValue::Bool(true) => f.write_str("True"),
            PropertyValue::Bool(false) => f.write_str("False"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Str(v) => f.write_str(v),
        }
    }
}

/// Parameters for creating a qube.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewVm {
    /// The qube class.
    pub class: VmClass,
    /// Name of the new qube.
    pub name: String,
    /// Its label (colour).
    pub label: String,
    /// Template to base the qube on, if any.
    pub template: Option<String>,
    /// Storage pool for its volumes; `None` uses the default pool.
    pub pool: Option<String>,
}

/// Operations on the qube collection.  Implementations are shared with
/// background tasks.
pub trait AdminApi: Send + Sync + std::fmt::Debug {
    /// Create a qube.  Fails if the name is already taken.
    fn create_vm(&self, vm: &NewVm) -> Result<()>;

    /// Set one property of an existing qube.
    fn set_property(&self, vm: &str, name: &str, value: &PropertyValue) -> Result<()>;

    /// Grow `volume` of `vm` to `size` bytes.
    fn resize_volume(&self, vm: &str, volume: &str, size: u64) -> Result<()>;
}

/// [`AdminApi`] backed by `qvm-create`, `qvm-prefs` and `qvm-volume`.
#[derive(Debug, Default, Clone)]
pub struct QvmTools {}

impl QvmTools {
    fn create_args(vm: &NewVm) -> Vec<String> {
        let mut args = vec![
            "--class".to_owned(),
            vm.class.to_string(),
            "--label".to_owned(),
            vm.label.clone(),
        ];
        if let Some(template) = vm.template.as_deref() {
            args.extend(["--template".to_owned(), template.to_owned()]);
        }
        if let Some(pool) = vm.pool.as_deref() {
            args.extend(["-P".to_owned(), pool.to_owned()]);
        }
        args.push(vm.name.clone());
        args
    }
}

impl AdminApi for QvmTools {
    #[context("Creating qube {}", vm.name)]
    fn create_vm(&self, vm: &NewVm) -> Result<()> {
        Command::new("qvm-create")
            .args(Self::create_args(vm))
            .run_with_cmd_context()
    }

    #[context("Setting {name} of {vm}")]
    fn set_property(&self, vm: &str, name: &str, value: &PropertyValue) -> Result<()> {
        Command::new("qvm-prefs")
            .args([vm, name])
            .arg(value.to_string())
            .run_with_cmd_context()
    }

    #[context("Resizing {vm}:{volume}")]
    fn resize_volume(&self, vm: &str, volume: &str, size: u64) -> Result<()> {
        Command::new("qvm-volume")
            .arg("resize")
            .arg(format!("{vm}:{volume}"))
            .arg(size.to_string())
            .run_with_cmd_context()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_property_value() {
        assert_eq!(PropertyValue::parse("TRUE"), PropertyValue::Bool(true));
        assert_eq!(PropertyValue::parse("false"), PropertyValue::Bool(false));
        assert_eq!(PropertyValue::parse("400"), PropertyValue::Int(400));
        assert_eq!(
            PropertyValue::parse("sys-firewall"),
            PropertyValue::Str("sys-firewall".into())
        );
        assert_eq!(PropertyValue::Bool(true).to_string(), "True");
        assert_eq!(PropertyValue::Int(-1).to_string(), "-1");
    }

    #[test]
    fn test_create_args() {
        let mut vm = NewVm {
            class: VmClass::AppVm,
            name: "work".into(),
            label: "blue".into(),
            template: Some("fedora-40".into()),
            pool: None,
        };
        assert_eq!(
            QvmTools::create_args(&vm),
            ["--class", "AppVM", "--label", "blue", "--template", "fedora-40", "work"]
        );
        vm.class = VmClass::StandaloneVm;
        vm.template = None;
        vm.pool = Some("vm-pool".into());
        assert_eq!(
            QvmTools::create_args(&vm),
            ["--class", "StandaloneVM", "--label", "blue", "-P", "vm-pool", "work"]
        );
    }
}
