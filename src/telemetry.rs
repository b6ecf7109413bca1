use std::sync::OnceLock;
use tracing::Level;
use tracing_subscriber::{fmt, EnvFilter};

static TELEMETRY_INIT: OnceLock<()> = OnceLock::new();

/// Installs the compact fmt subscriber once. `RUST_LOG` wins over `verbose`.
pub fn init(verbose: bool) {
    TELEMETRY_INIT.get_or_init(|| {
        let default_directive = if verbose {
            "ac_serial=debug"
        } else {
            "ac_serial=info"
        };
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(default_directive))
            .unwrap_or_else(|_| EnvFilter::default().add_directive(Level::INFO.into()));

        if let Err(err) = fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .compact()
            .try_init()
        {
            eprintln!("[telemetry] failed to initialise tracing subscriber: {err}");
        }
    });
}
