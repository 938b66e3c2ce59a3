//! Bootable media installs: the worker acts as the resources qube for an
//! unattended installer which builds the answer-file ISO and boots it in
//! the new qube.

use indoc::formatdoc;
use qvm_provision_utils::ShellQuoted;

use super::fetch::in_worker;
use crate::sandbox::{DisposableWorker, VmRef};
use crate::step::Step;

const TOOLS_ISO: &str = "/usr/lib/qubes/qubes-windows-tools.iso";
/// Where the installer repository is cloned in the worker.
const CHECKOUT_PARENT: &str = "/home/user/Documents";
/// The installer entrypoint, installed into the control domain.
const INSTALLER: &str = "qvm-create-windows-qube";

/// Directory name `git clone` picks for `repository`.
fn checkout_name(repository: &str) -> &str {
    let last = repository
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(repository);
    last.strip_suffix(".git").unwrap_or(last)
}

pub(crate) fn body(
    worker: &DisposableWorker,
    installation_id: &str,
    repository: &str,
    branch: &str,
    packages: &[String],
    name: &str,
    network: Option<&VmRef>,
) -> Vec<Step> {
    let disp = worker.name();
    let checkout = format!("{CHECKOUT_PARENT}/{}", checkout_name(repository));
    let checkout = ShellQuoted::new(&checkout);
    let id = ShellQuoted::new(installation_id);

    let tools = Step::new(formatdoc! {"
        if [ -f {TOOLS_ISO} ]; then
            echo 'Qubes Windows Tools already installed, skipping'
        else
            echo 'Installing Qubes Windows Tools'
            sudo qubes-dom0-update -y qubes-windows-tools
            if [ ! -f {TOOLS_ISO} ]; then
                echo '{TOOLS_ISO} is still missing after install' >&2
                exit 1
            fi
        fi
    "});

    let deps = formatdoc! {"
        if grep -q ID=fedora /etc/os-release; then sudo dnf -y install genisoimage geteltorito datefudge git
        elif grep -q ID=debian /etc/os-release; then sudo apt-get -y install genisoimage curl datefudge git
        else echo 'Unsupported distribution.' >&2; exit 1
        fi"};
    let clone = format!(
        "mkdir -p {CHECKOUT_PARENT} && cd {CHECKOUT_PARENT} && git clone --branch {} {}",
        ShellQuoted::new(branch),
        ShellQuoted::new(repository)
    );
    let verify = format!(
        "cd {checkout} && gpg --import author.asc && git verify-commit $(git rev-list --max-parents=0 HEAD)"
    );
    let fetch_installer = Step::new(formatdoc! {"
        echo 'Installing installer dependencies in {disp}'
        {deps}
        echo 'Cloning {INSTALLER}'
        {clone}
        echo 'Check for a \"Good signature\" from GPG'
        {verify}
        installer=$(mktemp)
        {cat} > \"$installer\"
        if [ ! -s \"$installer\" ]; then
            echo 'Fetched {INSTALLER} is empty' >&2
            rm -f \"$installer\"
            exit 1
        fi
        sudo install -m 0755 \"$installer\" /usr/bin/{INSTALLER}
        rm -f \"$installer\"
    ",
        deps = in_worker(worker, &deps),
        clone = in_worker(worker, &clone),
        verify = in_worker(worker, &verify),
        cat = in_worker(worker, &format!("cat {checkout}/{INSTALLER}")),
    });

    let mut args = format!("--resources-qube {disp}");
    if let Some(n) = network {
        args.push_str(&format!(" -n {}", ShellQuoted::new(n.as_str())));
    }
    args.push_str(" -o -y");
    if !packages.is_empty() {
        args.push_str(&format!(" -p {}", ShellQuoted::new(&packages.join(","))));
    }
    let download_media = in_worker(
        worker,
        &format!("cd {checkout}/windows-media/isos && ./download-windows.sh {id}"),
    );
    let install = Step::new(formatdoc! {"
        {download_media}
        echo 'Starting installation of {name}'
        {INSTALLER} {args} -i {id}.iso -a {id}.xml {name}
    "});

    vec![tools, fetch_installer, install]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkout_name() {
        assert_eq!(checkout_name("https://github.com/a/qvm-create-windows-qube"), "qvm-create-windows-qube");
        assert_eq!(checkout_name("https://example.com/a/b.git"), "b");
        assert_eq!(checkout_name("https://example.com/a/b/"), "b");
    }
}
