use tracing_subscriber::EnvFilter;

/// Logger setup for metering-engine
pub struct Logger;

impl Logger {
    /// Install a global fmt subscriber filtered at `level` ("info", "debug", ...).
    ///
    /// `RUST_LOG` takes precedence when set. Calling this twice is harmless:
    /// the second install is ignored.
    pub fn init(level: &str) {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("metering_engine={}", level)));

        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .try_init();
    }
}
