//! Template package installs via `qvm-template`, verified against a
//! keyring in the control domain.

use camino::Utf8PathBuf;
use indoc::formatdoc;
use qvm_provision_utils::ShellQuoted;

use super::fetch;
use crate::sandbox::DisposableWorker;
use crate::step::Step;

pub(crate) fn body(
    worker: &DisposableWorker,
    source: &str,
    key_url: &str,
    keyring: &Utf8PathBuf,
) -> Vec<Step> {
    let staging = worker.run_id().staging_path();
    let key = format!("{staging}.key");
    let package = format!("{staging}.rpm");
    let keyring = ShellQuoted::new(keyring.as_str());

    let signing_key = Step::new(formatdoc! {"
        if [ ! -f {keyring} ]; then
        echo 'Fetching signing key for {keyring}'
        {fetch_key}
        sudo mv {key} {keyring}
        sudo rpm --import {keyring}
        fi
    ", fetch_key = fetch::download(worker, key_url, &key).trim_end()});
    let download = Step::new(fetch::download(worker, source, &package));
    let install = Step::new(formatdoc! {"
        echo 'Installing {package}'
        qvm-template --keyring {keyring} install {package}
    "});
    let cleanup = Step::cleanup(format!("rm -f {package} {key}\n"));
    vec![signing_key, download, install, cleanup]
}
