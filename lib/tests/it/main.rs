//! Integration tests for qvm-provision-lib.

use std::os::unix::fs::PermissionsExt;

use anyhow::Result;
use camino::Utf8PathBuf;
use indoc::indoc;
use qvm_provision_lib::catalog::Catalog;
use qvm_provision_lib::console::{ConsoleSink, LiveConsole};
use qvm_provision_lib::executor::{ExecutionPolicy, Executor, Shell};
use qvm_provision_lib::generate::{generate, GenerateParams};
use qvm_provision_lib::sandbox::{RunId, VmRef};
use qvm_provision_lib::step::Workflow;
use tokio_util::sync::CancellationToken;

/// A shell that prints the script it was given instead of running it.
const ECHO_SHELL: &str = indoc! { r#"
    #!/bin/sh
    for script; do :; done
    printf '%s\n' "$script"
"# };

/// Like [`ECHO_SHELL`], but fails on any script touching the worker.
const FAILING_SHELL: &str = indoc! { r#"
    #!/bin/sh
    for script; do :; done
    printf '%s\n' "$script"
    case "$script" in *qvm-run*) exit 1 ;; esac
"# };

const CATALOG: &str = indoc! { r#"
    [[entry]]
    separator = "Unikernels"

    [[entry]]
    id = "example-image-template"
    kind = "image"
    source = "https://example.com/example-image.tar.bz2"
    kernel = "example-image/vmlinuz"
"# };

fn stub_shell(dir: &tempfile::TempDir, body: &str) -> Result<Shell> {
    let path = dir.path().join("stub-sh");
    std::fs::write(&path, body)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    let program = Utf8PathBuf::try_from(path)?;
    Ok(Shell { program })
}

fn image_workflow() -> Result<Workflow> {
    let catalog = Catalog::from_toml(CATALOG)?;
    let params = GenerateParams {
        target_name: Some("worker-vm".into()),
        network: Some(VmRef::new("sys-firewall")),
        label: Some("orange".into()),
        ..GenerateParams::new(RunId::new("run123")?, VmRef::new("default-dvm"))
    };
    Ok(generate(&catalog, "example-image-template", &params)?)
}

/// Assert each of `needles` occurs in `haystack`, in order.
fn assert_in_order(haystack: &str, needles: &[&str]) {
    let mut pos = 0;
    for needle in needles {
        let Some(found) = haystack[pos..].find(needle) else {
            panic!("{needle:?} not found after offset {pos}");
        };
        pos += found + needle.len();
    }
}

#[tokio::test]
async fn test_image_workflow_success() -> Result<()> {
    let td = tempfile::tempdir()?;
    let workflow = image_workflow()?;
    assert!(workflow.steps().len() >= 3);
    let exec = Executor::new(stub_shell(&td, ECHO_SHELL)?, ExecutionPolicy::Phased);
    let mut sink = LiveConsole::new();
    let outcome = exec
        .execute(&workflow, &mut sink, &CancellationToken::new())
        .await?;
    assert!(outcome.is_success(), "{outcome}");
    assert_eq!(outcome.exit_code, Some(0));
    let scripts: Vec<&str> = workflow.steps().iter().map(|s| s.script()).collect();
    let transcript = outcome.transcript_text();
    assert_in_order(&transcript, &scripts);
    similar_asserts::assert_eq!(sink.render(), transcript);
    Ok(())
}

#[tokio::test]
async fn test_image_workflow_failure() -> Result<()> {
    let td = tempfile::tempdir()?;
    let workflow = image_workflow()?;
    let steps = workflow.steps();
    let exec = Executor::new(stub_shell(&td, FAILING_SHELL)?, ExecutionPolicy::Phased);
    let mut sink = LiveConsole::new();
    let outcome = exec
        .execute(&workflow, &mut sink, &CancellationToken::new())
        .await?;
    assert!(!outcome.is_success());
    assert_eq!(outcome.exit_code, Some(1));
    assert_eq!(outcome.failed_step, Some(1));
    assert!(outcome.cleanup_failures.is_empty());
    let transcript = outcome.transcript_text();
    // Create, the failing download, then only the run-on-fail steps
    let ran: Vec<&str> = steps
        .iter()
        .enumerate()
        .filter(|(i, s)| *i <= 1 || s.run_on_fail())
        .map(|(_, s)| s.script())
        .collect();
    assert_in_order(&transcript, &ran);
    assert!(!transcript.contains("qvm-create --property kernel=worker-vm"));
    assert!(transcript.ends_with(&format!("{}\n", steps.last().unwrap().script())));
    Ok(())
}

#[tokio::test]
async fn test_single_script() -> Result<()> {
    let td = tempfile::tempdir()?;
    let workflow = image_workflow()?;
    let script = workflow.linearize();

    let exec = Executor::new(stub_shell(&td, ECHO_SHELL)?, ExecutionPolicy::SingleScript);
    let outcome = exec
        .execute(&workflow, &mut LiveConsole::new(), &CancellationToken::new())
        .await?;
    assert!(outcome.is_success());
    similar_asserts::assert_eq!(outcome.transcript_text(), format!("{script}\n"));

    let exec = Executor::new(stub_shell(&td, FAILING_SHELL)?, ExecutionPolicy::SingleScript);
    let outcome = exec
        .execute(&workflow, &mut LiveConsole::new(), &CancellationToken::new())
        .await?;
    assert!(!outcome.is_success());
    assert_eq!(outcome.exit_code, Some(1));
    // No attribution to a step in this mode
    assert_eq!(outcome.failed_step, None);
    Ok(())
}

#[tokio::test]
async fn test_spawned_workflow() -> Result<()> {
    let td = tempfile::tempdir()?;
    let exec = Executor::new(stub_shell(&td, ECHO_SHELL)?, ExecutionPolicy::Phased);
    let handle = exec.spawn(image_workflow()?, LiveConsole::new());
    let (outcome, mut sink) = handle.wait().await?;
    assert!(outcome.is_success());
    sink.finish();
    assert!(sink.lines().iter().any(|l| l.contains("qvm-run -p run123_disp")));
    Ok(())
}

#[test]
fn test_builtin_catalog_generates() -> Result<()> {
    let catalog = Catalog::builtin()?;
    for d in catalog.selectable() {
        let params = GenerateParams {
            target_name: Some("new-qube".into()),
            label: Some("red".into()),
            ..GenerateParams::new(RunId::generate(), VmRef::new("default-dvm"))
        };
        let w = generate(&catalog, &d.id, &params)?;
        assert!(w.steps().first().unwrap().script().contains("qvm-clone"));
        assert!(w.steps().last().unwrap().run_on_fail());
    }
    Ok(())
}

/// Run the installer fetch step of the builtin media entry with `qvm-run`
/// and `sudo` replaced by stubs.  Reading the installer in the worker prints
/// `cat_output` and exits with `cat_status`.
fn run_installer_fetch(cat_output: &str, cat_status: i32) -> Result<(bool, bool)> {
    let td = tempfile::tempdir()?;
    let bin = td.path().join("bin");
    std::fs::create_dir(&bin)?;
    let installed = td.path().join("installed");
    let stubs = [
        (
            "qvm-run",
            format!(
                "#!/bin/sh\ncase \"$*\" in *'cat '*) printf '%s' '{cat_output}'; exit {cat_status} ;; esac\n"
            ),
        ),
        ("sudo", format!("#!/bin/sh\ntouch {}\n", installed.display())),
    ];
    for (name, body) in stubs {
        let path = bin.join(name);
        std::fs::write(&path, body)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
    }
    let catalog = Catalog::builtin()?;
    let params = GenerateParams {
        target_name: Some("win".into()),
        ..GenerateParams::new(RunId::new("run123")?, VmRef::new("default-dvm"))
    };
    let w = generate(&catalog, "win10x64-ltsc-eval", &params)?;
    let step = &w.steps()[2];
    assert!(step.script().contains("qvm-create-windows-qube"));
    let path = format!("{}:{}", bin.display(), std::env::var("PATH")?);
    let status = std::process::Command::new("/bin/sh")
        .args(["-e", "-c", step.script()])
        .env("PATH", path)
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()?;
    Ok((status.success(), installed.exists()))
}

#[test]
fn test_failed_installer_copy_aborts() -> Result<()> {
    // The worker side of the copy failed
    assert_eq!(run_installer_fetch("#!/bin/sh", 1)?, (false, false));
    // It "succeeded" but produced nothing
    assert_eq!(run_installer_fetch("", 0)?, (false, false));
    assert_eq!(run_installer_fetch("#!/bin/sh", 0)?, (true, true));
    Ok(())
}
