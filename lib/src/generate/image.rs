//! Kernel image installs: the tarball is fetched by the worker, unpacked in
//! the control domain and registered as a standalone PVH qube.

use camino::Utf8PathBuf;
use indoc::formatdoc;
use qvm_provision_utils::ShellQuoted;

use super::fetch;
use crate::sandbox::{DisposableWorker, VmRef};
use crate::step::Step;

/// Where per-qube kernels live in the control domain.
const KERNELS_DIR: &str = "/var/lib/qubes/vm-kernels";

pub(crate) fn body(
    worker: &DisposableWorker,
    source: &str,
    kernel: &Utf8PathBuf,
    name: &str,
    label: &str,
    network: Option<&VmRef>,
) -> Vec<Step> {
    let staging = worker.run_id().staging_path();
    let archive = format!("{staging}.tar.bz2");
    let unpacked = format!("{staging}.d");
    let kernel = ShellQuoted::new(kernel.as_str());
    let label = ShellQuoted::new(label);
    let kernel_dir = format!("{KERNELS_DIR}/{name}");
    let netvm = network
        .map(|n| format!("--property netvm={} ", ShellQuoted::new(n.as_str())))
        .unwrap_or_default();

    let download = Step::new(fetch::download(worker, source, &archive));
    let install = Step::new(formatdoc! {"
        echo 'Unpacking {archive}'
        command -v bzip2 >/dev/null || sudo qubes-dom0-update -y bzip2
        mkdir -p {unpacked}
        tar -xjf {archive} -C {unpacked}
        mkdir -p {kernel_dir}
        gzip -n9 < /dev/null > {kernel_dir}/initramfs
        cp {unpacked}/{kernel} {kernel_dir}/vmlinuz
        qvm-create --property kernel={name} --property kernelopts='' \\
            --property memory=32 --property maxmem=32 {netvm}\\
            --property provides_network=True --property vcpus=1 \\
            --property virt_mode=pvh --label {label} --class StandaloneVM {name}
        qvm-features {name} qubes-firewall 1
        qvm-features {name} no-default-kernelopts 1
    "});
    let cleanup = Step::cleanup(formatdoc! {"
        # Remove staged artifacts
        rm -rf {archive} {unpacked}
    "});
    vec![download, install, cleanup]
}
