//! # Steps and workflows
//!
//! A [`Step`] is one shell fragment; a [`Workflow`] is the ordered list of
//! steps produced for a single provisioning request, from creation of the
//! disposable worker to its teardown.

use crate::sandbox::{Bracket, RunId};

/// An atomic unit of work: a shell fragment plus its cleanup priority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    script: String,
    run_on_fail: bool,
}

impl Step {
    /// A step that is skipped once an earlier step has failed.
    pub fn new(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            run_on_fail: false,
        }
    }

    /// A step that is attempted even when an earlier step has failed.
    pub fn cleanup(script: impl Into<String>) -> Self {
        Self {
            script: script.into(),
            run_on_fail: true,
        }
    }

    /// The shell text of this step.
    pub fn script(&self) -> &str {
        &self.script
    }

    /// Whether this step must run even after a failure.
    pub fn run_on_fail(&self) -> bool {
        self.run_on_fail
    }
}

/// The ordered steps for one provisioning run.
///
/// Constructed only via [`Workflow::bracketed`], so the sandbox teardown
/// is always the final step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    run_id: RunId,
    steps: Vec<Step>,
}

impl Workflow {
    /// Interleave `body` between the bracket's create and teardown steps.
    /// The teardown always runs, whatever happened before it.
    pub fn bracketed(bracket: Bracket, body: impl IntoIterator<Item = Step>) -> Self {
        let (worker, create, teardown) = bracket.into_parts();
        let mut steps = vec![Step::new(create.script)];
        steps.extend(body);
        steps.push(Step::cleanup(teardown.script));
        Self {
            run_id: worker.run_id().clone(),
            steps,
        }
    }

    /// The correlation id naming every ephemeral resource of this run.
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// All steps, in execution order.
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Concatenate every step into a single script, in order.
    pub fn linearize(&self) -> String {
        let mut r = String::new();
        for step in &self.steps {
            r.push_str(step.script());
            if !r.ends_with('\n') {
                r.push('\n');
            }
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{bracket, VmRef};

    fn workflow() -> Workflow {
        let b = bracket(&VmRef::new("fedora-40-dvm"), &RunId::new("run123").unwrap());
        Workflow::bracketed(b, [Step::new("echo one"), Step::new("echo two\n")])
    }

    #[test]
    fn test_bracket_order() {
        let w = workflow();
        let steps = w.steps();
        assert_eq!(steps.len(), 4);
        assert!(!steps[0].run_on_fail());
        assert_eq!(steps[1].script(), "echo one");
        assert!(steps.last().unwrap().run_on_fail());
        assert_eq!(w.run_id().as_str(), "run123");
    }

    #[test]
    fn test_teardown_forced_to_cleanup() {
        let b = bracket(&VmRef::new("fedora-40-dvm"), &RunId::new("run123").unwrap());
        let teardown = b.teardown().script().to_owned();
        let w = Workflow::bracketed(b, [Step::cleanup("rm -f /tmp/x")]);
        let last = w.steps().last().unwrap();
        assert!(last.run_on_fail());
        assert_eq!(last.script(), teardown);
        assert!(!w.steps()[0].run_on_fail());
    }

    #[test]
    fn test_linearize() {
        let w = workflow();
        let s = w.linearize();
        let one = s.find("echo one\n").unwrap();
        let two = s.find("echo two\n").unwrap();
        assert!(one < two);
        assert!(s.ends_with(&format!("{}\n", w.steps().last().unwrap().script().trim_end())));
        assert!(!s.contains("echo two\n\n"));
    }
}
