use tracing_subscriber::{fmt, EnvFilter};

/// Filter applied when `RUST_LOG` is unset: bridge internals at debug,
/// the rest of the stack at info.
const DEFAULT_DIRECTIVES: &str = "info,airbridge=debug";

pub fn setup_logging() {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .with_timer(fmt::time::uptime())
        .init();
}
