use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Install the process-wide fmt subscriber. `RUST_LOG` wins over `default_directive`.
/// Binaries call this once; library code only emits events.
pub fn init(default_directive: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directive));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    if tracing::subscriber::set_global_default(subscriber).is_err() {
        tracing::debug!("global subscriber already installed");
    }
}
