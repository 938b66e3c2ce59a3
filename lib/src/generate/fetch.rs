//! Shared fragments for fetching artifacts through the disposable worker.
//!
//! Network access only ever happens inside the worker; the control domain
//! receives the bytes over `qvm-run -p` stdout.

use indoc::formatdoc;
use qvm_provision_utils::{shell_quote, ShellQuoted};

use crate::sandbox::DisposableWorker;

/// Run `cmd` in the worker, passing stdout through.
pub(crate) fn in_worker(worker: &DisposableWorker, cmd: &str) -> String {
    format!("qvm-run -p {} {}", worker.name(), shell_quote(cmd))
}

/// Install wget in the worker unless it is already present.
pub(crate) fn ensure_wget(worker: &DisposableWorker) -> String {
    let install = formatdoc! {"
        command -v wget >/dev/null && exit 0
        if grep -q ID=fedora /etc/os-release; then sudo dnf -y install wget
        elif grep -q ID=debian /etc/os-release; then sudo apt-get -y install wget
        else echo 'Unsupported distribution.' >&2; exit 1
        fi"};
    in_worker(worker, &install)
}

/// Download `url` to `dest` inside the worker, then copy it to the same
/// path in the control domain.
///
/// The progress bar is forced so that redraws show up in the console even
/// though stdout is not a terminal.
pub(crate) fn download(worker: &DisposableWorker, url: &str, dest: &str) -> String {
    let url = ShellQuoted::new(url);
    let dest_q = ShellQuoted::new(dest);
    let wget = in_worker(
        worker,
        &format!("wget --progress=bar:force --show-progress -O {dest_q} {url}"),
    );
    let copy = in_worker(worker, &format!("cat {dest_q}"));
    formatdoc! {"
        echo Downloading {url}
        {ensure}
        {wget}
        echo Copying {dest_q} to dom0
        {copy} > {dest_q}
    ", ensure = ensure_wget(worker)}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::{bracket, RunId, VmRef};

    fn worker() -> DisposableWorker {
        bracket(&VmRef::new("default-dvm"), &RunId::new("run1").unwrap()).worker().clone()
    }

    #[test]
    fn test_in_worker_quotes() {
        assert_eq!(in_worker(&worker(), "ls"), "qvm-run -p run1_disp ls");
        assert_eq!(
            in_worker(&worker(), "cat /tmp/x"),
            "qvm-run -p run1_disp 'cat /tmp/x'"
        );
    }

    #[test]
    fn test_download() {
        let s = download(&worker(), "https://example.com/a b", "/tmp/run1.rpm");
        assert!(s.contains("--progress=bar:force"));
        assert!(s.contains("qvm-run -p run1_disp 'cat /tmp/run1.rpm' > /tmp/run1.rpm\n"));
        assert!(s.contains("https://example.com/a b"));
        let ensure = s.find("command -v wget").unwrap();
        let fetch = s.find("wget --progress").unwrap();
        assert!(ensure < fetch);
    }
}
