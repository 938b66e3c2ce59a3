//! The main entrypoint for qvm-provision, which just performs global initialization, and then
//! calls out into the library.

use anyhow::Result;

async fn run() -> Result<()> {
    // RUST_LOG overrides; stdout is reserved for the workflow output
    qvm_provision_utils::initialize_tracing(tracing::Level::WARN);
    tracing::trace!("starting");
    qvm_provision_lib::cli::run_from_iter(std::env::args()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!("{:#}", e);
        std::process::exit(1);
    }
}
