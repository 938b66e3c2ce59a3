//! Helpers intended for [`std::process::Command`] and related structures.

use std::io::{Read, Seek};
use std::process::Command;

use anyhow::{Context, Result};

/// Helpers intended for [`std::process::Command`].
pub trait CommandRunExt {
    /// Log (at debug level) the full child commandline.
    fn log_debug(&mut self) -> &mut Self;

    /// Execute the child process, returning an error (carrying the tail of
    /// its stderr) if it exits unsuccessfully.
    fn run(&mut self) -> Result<()>;

    /// Like [`Self::run`], but prefix any error with the command line.
    fn run_with_cmd_context(&mut self) -> Result<()>;
}

/// Helpers intended for [`std::process::ExitStatus`].
pub trait ExitStatusExt {
    /// If the exit status signals it was not successful, return an error.
    /// Note that we intentionally *don't* include the command string
    /// in the output; we leave it to the caller to add that if they want,
    /// as it may be verbose.
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()>;
}

/// Read the trailing bytes of the captured stderr of a child.
fn last_utf8_content_from_file(mut f: std::fs::File) -> String {
    // u16 since we truncate to just the trailing bytes here
    // to avoid pathological error messages
    const MAX_STDERR_BYTES: u16 = 1024;
    let size = f
        .metadata()
        .map_err(|e| {
            tracing::warn!("failed to fstat: {e}");
        })
        .map(|m| m.len().try_into().unwrap_or(u16::MAX))
        .unwrap_or(0);
    let size = size.min(MAX_STDERR_BYTES);
    let seek_offset = -(i64::from(size));
    let mut stderr_buf = Vec::with_capacity(size.into());
    match f
        .seek(std::io::SeekFrom::End(seek_offset))
        .and_then(|_| f.read_to_end(&mut stderr_buf))
    {
        Ok(_) => String::from_utf8_lossy(&stderr_buf).trim_end().to_owned(),
        Err(e) => {
            tracing::warn!("failed seek+read: {e}");
            "<failed to read stderr>".into()
        }
    }
}

impl ExitStatusExt for std::process::ExitStatus {
    fn check_status(&mut self, stderr: std::fs::File) -> Result<()> {
        if self.success() {
            return Ok(());
        }
        let stderr_buf = last_utf8_content_from_file(stderr);
        if stderr_buf.is_empty() {
            anyhow::bail!("Subprocess failed: {self:?}")
        }
        anyhow::bail!("Subprocess failed: {self:?}\n{stderr_buf}")
    }
}

impl CommandRunExt for Command {
    fn log_debug(&mut self) -> &mut Self {
        tracing::debug!("exec: {self:?}");
        self
    }

    fn run(&mut self) -> Result<()> {
        let stderr = tempfile::tempfile()?;
        self.stderr(stderr.try_clone()?);
        self.log_debug().status()?.check_status(stderr)
    }

    fn run_with_cmd_context(&mut self) -> Result<()> {
        self.run().with_context(|| format!("Failed to run: {self:?}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_run_ext() {
        Command::new("true").run().unwrap();
        assert!(Command::new("false").run().is_err());
    }

    #[test]
    fn command_error_carries_stderr() {
        let e = Command::new("/bin/sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .run_with_cmd_context()
            .unwrap_err();
        let msg = format!("{e:#}");
        assert!(msg.contains("oops"), "{msg}");
        assert!(msg.contains("Failed to run"), "{msg}");
    }
}
