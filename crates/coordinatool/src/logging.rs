/// Initialize `tracing-subscriber`, honoring `RUST_LOG` when set and
/// otherwise deriving a default filter from the CLI's net verbosity.
pub fn init(verbosity: i32) {
    let default_level = match verbosity {
        i32::MIN..=-2 => "error",
        -1 => "warn",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}
