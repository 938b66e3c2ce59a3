//! # Workflow execution
//!
//! Runs the steps of a [`Workflow`] through an `sh` compatible shell.
//! Standard output and error of the shell share one pipe, so the sink sees
//! the two interleaved exactly as the subprocess wrote them.

use std::fmt::Display;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use anyhow::{Context, Result};
use camino::Utf8PathBuf;
use rustix::pipe::{pipe_with, PipeFlags};
use rustix::process::{kill_process_group, Pid, Signal};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe::Receiver;
use tokio::process::Child;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::console::ConsoleSink;
use crate::sandbox::{derived_name, RunId};
use crate::step::Workflow;
use crate::utils::medium_visibility_warning;

const READ_BUF_SIZE: usize = 8192;
/// How long a cancelled shell gets between SIGTERM and SIGKILL.
const KILL_GRACE: Duration = Duration::from_secs(5);

/// How the steps of a workflow are mapped onto shell processes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionPolicy {
    /// One `sh -e -c` per step.  After a failure the remaining ordinary
    /// steps are skipped, but every run-on-fail step still runs.
    #[default]
    Phased,
    /// Every step concatenated into one script run by a single process;
    /// whether cleanup runs after a failure is up to the script itself.
    SingleScript,
}

/// The shell used to run generated scripts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Shell {
    /// Path of an `sh` compatible interpreter.
    pub program: Utf8PathBuf,
}

impl Default for Shell {
    fn default() -> Self {
        Self {
            program: "/bin/sh".into(),
        }
    }
}

impl Shell {
    fn command(&self, script: &str, errexit: bool) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(self.program.as_std_path());
        if errexit {
            cmd.arg("-e");
        }
        cmd.arg("-c").arg(script);
        cmd.stdin(Stdio::null());
        // Its own process group, so cancelling reaches everything it started
        cmd.process_group(0);
        cmd.kill_on_drop(true);
        cmd
    }
}

fn signal_group(pgid: Pid, sig: Signal) {
    match kill_process_group(pgid, sig) {
        Ok(()) | Err(rustix::io::Errno::SRCH) => {}
        Err(e) => {
            let pgid = pgid.as_raw_nonzero();
            tracing::warn!("Sending {sig:?} to process group {pgid}: {e}");
        }
    }
}

/// Terminate the shell and every process in its group, escalating from
/// SIGTERM to SIGKILL, and reap the shell.
async fn kill_shell_group(child: &mut Child) -> Result<ExitStatus> {
    let Some(pgid) = child
        .id()
        .and_then(|id| i32::try_from(id).ok())
        .and_then(Pid::from_raw)
    else {
        // Already reaped
        return child.wait().await.context("Waiting for shell");
    };
    signal_group(pgid, Signal::Term);
    let status = match tokio::time::timeout(KILL_GRACE, child.wait()).await {
        Ok(r) => r.context("Waiting for shell")?,
        Err(_) => {
            tracing::debug!("Shell survived SIGTERM; killing");
            signal_group(pgid, Signal::Kill);
            child.wait().await.context("Waiting for shell")?
        }
    };
    // Anything left in the group ignored SIGTERM
    signal_group(pgid, Signal::Kill);
    Ok(status)
}

/// The result of running one workflow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowOutcome {
    /// The run this outcome belongs to.
    pub run_id: RunId,
    /// Exit code of the failed step (or of the whole script), `Some(0)` on
    /// success, `None` if the process was killed.
    pub exit_code: Option<i32>,
    /// Index of the first ordinary step that failed.  Always `None` for
    /// [`ExecutionPolicy::SingleScript`], which has no step attribution.
    pub failed_step: Option<usize>,
    /// The run was cancelled before completing.
    pub cancelled: bool,
    /// Indices of run-on-fail steps that failed; each may have leaked a
    /// disposable worker or staged file.
    pub cleanup_failures: Vec<usize>,
    /// Everything the shell wrote, unmodified.
    pub transcript: Vec<u8>,
}

impl WorkflowOutcome {
    fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            exit_code: Some(0),
            failed_step: None,
            cancelled: false,
            cleanup_failures: Vec::new(),
            transcript: Vec::new(),
        }
    }

    /// Whether every step that ran exited successfully and nothing was
    /// skipped or cancelled.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
            && self.failed_step.is_none()
            && !self.cancelled
            && self.cleanup_failures.is_empty()
    }

    /// The transcript decoded as text, with invalid UTF-8 replaced.
    pub fn transcript_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.transcript)
    }
}

impl Display for WorkflowOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let run_id = &self.run_id;
        if self.cancelled {
            write!(f, "Run {run_id} was cancelled")?;
        } else {
            match (self.exit_code, self.failed_step) {
                (Some(0), None) => write!(f, "Run {run_id} finished with exit code 0")?,
                (code, step) => {
                    write!(f, "Run {run_id} failed")?;
                    if let Some(step) = step {
                        write!(f, " at step {step}")?;
                    }
                    match code {
                        Some(code) => write!(f, " with exit code {code}")?,
                        None => write!(f, " (killed)")?,
                    }
                }
            }
        }
        if !self.cleanup_failures.is_empty() {
            write!(f, "; cleanup steps failed: {:?}", self.cleanup_failures)?;
        }
        Ok(())
    }
}

/// Status of one shell process.
#[derive(Debug)]
struct ProcessStatus {
    success: bool,
    code: Option<i32>,
    cancelled: bool,
}

/// Runs workflows.
#[derive(Debug, Default, Clone)]
pub struct Executor {
    shell: Shell,
    policy: ExecutionPolicy,
}

impl Executor {
    /// An executor running `shell` with `policy`.
    pub fn new(shell: Shell, policy: ExecutionPolicy) -> Self {
        Self { shell, policy }
    }

    /// The configured policy.
    pub fn policy(&self) -> ExecutionPolicy {
        self.policy
    }

    /// Run one script to completion, streaming its output.
    async fn run_script(
        &self,
        script: &str,
        errexit: bool,
        sink: &mut dyn ConsoleSink,
        transcript: &mut Vec<u8>,
        cancel: &CancellationToken,
    ) -> Result<ProcessStatus> {
        let (reader, writer) = pipe_with(PipeFlags::CLOEXEC).context("Creating output pipe")?;
        let mut cmd = self.shell.command(script, errexit);
        cmd.stdout(Stdio::from(writer.try_clone()?));
        cmd.stderr(Stdio::from(writer));
        tracing::debug!("exec: {} ({} bytes of script)", self.shell.program, script.len());
        let mut child = cmd
            .spawn()
            .with_context(|| format!("Spawning {}", self.shell.program))?;
        // Close our copies of the write end, or we never see EOF
        drop(cmd);
        let mut reader = Receiver::from_owned_fd(reader)?;

        let mut buf = vec![0u8; READ_BUF_SIZE];
        let mut cancelled = false;
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::info!("Cancelled; killing shell");
                    cancelled = true;
                    break;
                }
                n = reader.read(&mut buf) => {
                    let n = n.context("Reading shell output")?;
                    if n == 0 {
                        break;
                    }
                    let chunk = &buf[..n];
                    transcript.extend_from_slice(chunk);
                    sink.feed(chunk);
                }
            }
        }
        let status = if cancelled {
            kill_shell_group(&mut child).await?
        } else {
            child.wait().await.context("Waiting for shell")?
        };
        tracing::debug!("shell exited: {status:?}");
        Ok(ProcessStatus {
            success: status.success() && !cancelled,
            code: status.code(),
            cancelled,
        })
    }

    /// Run `workflow`, feeding all output to `sink` in order.
    ///
    /// Only failures of the engine itself (spawning, reading the pipe) are
    /// errors; a failing step is reported in the returned outcome.
    pub async fn execute(
        &self,
        workflow: &Workflow,
        sink: &mut dyn ConsoleSink,
        cancel: &CancellationToken,
    ) -> Result<WorkflowOutcome> {
        let mut outcome = WorkflowOutcome::new(workflow.run_id().clone());
        tracing::info!(
            "Executing run {} ({} steps, {:?})",
            workflow.run_id(),
            workflow.steps().len(),
            self.policy
        );
        match self.policy {
            ExecutionPolicy::Phased => {
                self.execute_phased(workflow, sink, cancel, &mut outcome)
                    .await?
            }
            ExecutionPolicy::SingleScript => {
                let script = workflow.linearize();
                let st = self
                    .run_script(&script, false, sink, &mut outcome.transcript, cancel)
                    .await?;
                outcome.exit_code = if st.cancelled { None } else { st.code };
                if st.cancelled {
                    outcome.cancelled = true;
                    // The script died somewhere; attempt every cleanup step
                    self.run_cleanups(workflow, sink, &mut outcome).await?;
                }
            }
        }
        sink.finish();
        if outcome.is_success() {
            tracing::info!("{outcome}");
        } else {
            tracing::warn!("{outcome}");
        }
        if !outcome.cleanup_failures.is_empty() {
            medium_visibility_warning(&format!(
                "Cleanup of run {} failed; check for a leftover {} qube",
                outcome.run_id,
                derived_name(&outcome.run_id)
            ));
        }
        Ok(outcome)
    }

    async fn execute_phased(
        &self,
        workflow: &Workflow,
        sink: &mut dyn ConsoleSink,
        cancel: &CancellationToken,
        outcome: &mut WorkflowOutcome,
    ) -> Result<()> {
        let n = workflow.steps().len();
        let never = CancellationToken::new();
        for (i, step) in workflow.steps().iter().enumerate() {
            if cancel.is_cancelled() && !outcome.cancelled {
                outcome.cancelled = true;
                outcome.exit_code = None;
            }
            let failed = outcome.failed_step.is_some() || outcome.cancelled;
            if step.run_on_fail() {
                // Cleanup must not be interrupted by the cancellation that
                // triggered it
                let st = self
                    .run_script(step.script(), true, sink, &mut outcome.transcript, &never)
                    .await?;
                let result = if st.success { "ok" } else { "failed" };
                tracing::info!("Cleanup step {}/{n}: {result}", i + 1);
                if !st.success {
                    outcome.cleanup_failures.push(i);
                }
                continue;
            }
            if failed {
                tracing::debug!("Skipping step {}/{n}", i + 1);
                continue;
            }
            tracing::info!("Step {}/{n}", i + 1);
            let st = self
                .run_script(step.script(), true, sink, &mut outcome.transcript, cancel)
                .await?;
            if st.cancelled {
                outcome.cancelled = true;
                outcome.exit_code = None;
                outcome.failed_step = Some(i);
            } else if !st.success {
                outcome.exit_code = st.code;
                outcome.failed_step = Some(i);
            }
        }
        Ok(())
    }

    /// Run every run-on-fail step, recording failures.
    async fn run_cleanups(
        &self,
        workflow: &Workflow,
        sink: &mut dyn ConsoleSink,
        outcome: &mut WorkflowOutcome,
    ) -> Result<()> {
        let never = CancellationToken::new();
        for (i, step) in workflow.steps().iter().enumerate() {
            if !step.run_on_fail() {
                continue;
            }
            let st = self
                .run_script(step.script(), true, sink, &mut outcome.transcript, &never)
                .await?;
            if !st.success {
                outcome.cleanup_failures.push(i);
            }
        }
        Ok(())
    }

    /// Run `workflow` in a background task owning `sink`.
    pub fn spawn<S>(&self, workflow: Workflow, sink: S) -> WorkflowHandle<S>
    where
        S: ConsoleSink + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let executor = self.clone();
        let task = tokio::spawn(async move {
            let mut sink = sink;
            let r = executor.execute(&workflow, &mut sink, &token).await;
            (r, sink)
        });
        WorkflowHandle { cancel, task }
    }
}

/// A workflow running in the background.
#[derive(Debug)]
pub struct WorkflowHandle<S> {
    cancel: CancellationToken,
    task: JoinHandle<(Result<WorkflowOutcome>, S)>,
}

impl<S> WorkflowHandle<S> {
    /// Kill the running step; cleanup steps are still attempted.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token cancelling this workflow, e.g. from a signal handler.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Whether the workflow has finished.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for completion, returning the outcome and the sink.
    pub async fn wait(self) -> Result<(WorkflowOutcome, S)> {
        let (r, sink) = self.task.await.context("Workflow task failed")?;
        Ok((r?, sink))
    }
}
