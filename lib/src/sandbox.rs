//! # Disposable worker lifecycle
//!
//! Every workflow runs its untrusted setup commands (downloads, archive
//! handling) inside a throwaway qube.  This module is the only place that
//! creates and destroys those workers, so acquisition and release stay
//! symmetric: [`bracket`] hands out the create step together with the
//! matching teardown step.

use std::fmt::Display;

use indoc::formatdoc;
use qvm_provision_utils::ShellQuoted;

use crate::generate::GenerateError;
use crate::step::Step;

/// Maximum length of a run id; derived names must stay within the
/// 31 character qube name limit.
const RUN_ID_MAX: usize = 20;

/// Suffix of the per-run clone of the disposable template.
const TEMPLATE_SUFFIX: &str = "_tmpl";
/// Suffix of the per-run disposable worker.
const DISPOSABLE_SUFFIX: &str = "_disp";

/// Initial size for the private volume of the template clone; artifacts
/// are downloaded there.
const WORKER_PRIVATE_SIZE: &str = "10GiB";

/// An opaque reference to an existing qube (template, network provider...).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VmRef(String);

impl VmRef {
    /// Reference a qube by name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The qube name.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for VmRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The correlation string naming all ephemeral resources of one run.
///
/// Uniqueness across concurrently running workflows is the caller's
/// responsibility; use [`RunId::generate`] unless an id is imposed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RunId(String);

impl RunId {
    /// Validate a caller supplied run id.  It must start with a letter and
    /// contain only ASCII alphanumerics, `_` and `-`, so that derived names
    /// are valid qube names and need no shell quoting.
    pub fn new(id: impl Into<String>) -> Result<Self, GenerateError> {
        let id = id.into();
        let mut chars = id.chars();
        let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
            && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
            && id.len() <= RUN_ID_MAX;
        if !valid {
            return Err(GenerateError::InvalidRunId(id));
        }
        Ok(Self(id))
    }

    /// Generate a fresh run id from a v4 UUID.
    pub fn generate() -> Self {
        let uuid = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("run_{}", &uuid[..12]))
    }

    /// The run id as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path of the artifact staged for this run in the control domain.
    pub fn staging_path(&self) -> String {
        format!("/tmp/{}", self.0)
    }
}

impl Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to the disposable worker owned by one workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisposableWorker {
    template: VmRef,
    run_id: RunId,
}

impl DisposableWorker {
    /// The disposable template the worker is cloned from.
    pub fn template(&self) -> &VmRef {
        &self.template
    }

    /// The run this worker belongs to.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Name of the disposable worker itself.
    pub fn name(&self) -> String {
        derived_name(&self.run_id)
    }

    /// Name of the per-run clone of the disposable template.
    pub fn template_clone_name(&self) -> String {
        format!("{}{TEMPLATE_SUFFIX}", self.run_id)
    }
}

/// The deterministic name of the disposable worker for `run_id`.
pub fn derived_name(run_id: &RunId) -> String {
    format!("{run_id}{DISPOSABLE_SUFFIX}")
}

/// The acquisition and release steps for one disposable worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bracket {
    worker: DisposableWorker,
    create: Step,
    teardown: Step,
}

impl Bracket {
    /// The worker the two steps manage.
    pub fn worker(&self) -> &DisposableWorker {
        &self.worker
    }

    /// Clones the template and creates the worker; skipped after a failure.
    pub fn create(&self) -> &Step {
        &self.create
    }

    /// Waits for the worker to stop and destroys it and the template clone.
    pub fn teardown(&self) -> &Step {
        &self.teardown
    }

    pub(crate) fn into_parts(self) -> (DisposableWorker, Step, Step) {
        (self.worker, self.create, self.teardown)
    }

    /// Replace both scripts, e.g. with `echo`s for running under a plain shell.
    #[cfg(test)]
    pub(crate) fn with_scripts(self, create: &str, teardown: &str) -> Self {
        Self {
            worker: self.worker,
            create: Step::new(create),
            teardown: Step::cleanup(teardown),
        }
    }
}

/// Build the create/teardown pair for a disposable worker derived from
/// `template` for `run_id`.
pub fn bracket(template: &VmRef, run_id: &RunId) -> Bracket {
    let worker = DisposableWorker {
        template: template.clone(),
        run_id: run_id.clone(),
    };
    let source = ShellQuoted::new(template.as_str());
    let tmpl = worker.template_clone_name();
    let disp = worker.name();
    let create = Step::new(formatdoc! {"
        # Create a template from the disposable template for run {run_id}
        qvm-clone {source} {tmpl}
        qvm-volume extend {tmpl}:private {WORKER_PRIVATE_SIZE} || true
        # Create a disposable qube from the template
        qvm-create --disp --template {tmpl} --label red {disp}
    "});
    let teardown = Step::cleanup(formatdoc! {"
        # Tear down the disposable qube and its template
        status=0
        if qvm-check --quiet {disp} 2>/dev/null; then
            qvm-shutdown --wait --force {disp} || true
            qvm-remove --force {disp} || status=$?
        fi
        if qvm-check --quiet {tmpl} 2>/dev/null; then
            qvm-remove --force {tmpl} || status=$?
        fi
        exit $status
    "});
    Bracket {
        worker,
        create,
        teardown,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    #[test]
    fn test_run_id_validation() {
        for ok in ["run123", "a", "run_0123456789ab", "Abc-def"] {
            assert!(RunId::new(ok).is_ok(), "{ok}");
        }
        for bad in ["", "1run", "_run", "run id", "run;rm", "a23456789012345678901"] {
            assert!(RunId::new(bad).is_err(), "{bad}");
        }
    }

    #[test]
    fn test_generated_run_ids() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let id = RunId::generate();
            // Generated ids are always acceptable as caller ids
            RunId::new(id.as_str()).unwrap();
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_derived_name_injective() {
        let ids = ["run1", "run12", "run_1", "run-1", "Run1", "run1_disp"];
        let names: HashSet<_> = ids
            .iter()
            .map(|v| derived_name(&RunId::new(*v).unwrap()))
            .collect();
        assert_eq!(names.len(), ids.len());
        let r = RunId::new("run123").unwrap();
        assert_eq!(derived_name(&r), derived_name(&r.clone()));
        assert_eq!(derived_name(&r), "run123_disp");
    }

    #[test]
    fn test_bracket() {
        let template = VmRef::new("default-dvm");
        let run_id = RunId::new("run123").unwrap();
        let b = bracket(&template, &run_id);
        assert!(!b.create().run_on_fail());
        assert!(b.teardown().run_on_fail());
        assert_eq!(b.worker().name(), "run123_disp");
        assert_eq!(b.worker().template_clone_name(), "run123_tmpl");
        assert!(b
            .create()
            .script()
            .contains("qvm-clone default-dvm run123_tmpl\n"));
        assert!(b
            .create()
            .script()
            .contains("qvm-create --disp --template run123_tmpl --label red run123_disp\n"));
        assert!(b.teardown().script().contains("qvm-remove --force run123_disp"));
        assert!(b.teardown().script().contains("qvm-remove --force run123_tmpl"));
        assert_eq!(b, bracket(&template, &run_id));
    }

    #[test]
    fn test_bracket_quotes_template() {
        let b = bracket(
            &VmRef::new("odd name"),
            &RunId::new("run123").unwrap(),
        );
        assert!(b.create().script().contains("qvm-clone 'odd name' run123_tmpl"));
    }
}
