//! Helpers related to tracing, used by main entrypoints

/// Initialize tracing with the default configuration.
///
/// `RUST_LOG` always wins; otherwise events at `default_level` and above
/// are shown.
pub fn initialize_tracing(default_level: tracing::Level) {
    // Don't include timestamps and such because they're not really useful and
    // too verbose; the live console output carries its own context.
    let format = tracing_subscriber::fmt::format()
        .without_time()
        .with_target(false)
        .compact();
    let filter = tracing_subscriber::EnvFilter::builder()
        .with_default_directive(tracing::level_filters::LevelFilter::from_level(default_level).into())
        .from_env_lossy();
    // Log to stderr by default; stdout carries the workflow transcript
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .event_format(format)
        .with_writer(std::io::stderr)
        .init();
}
