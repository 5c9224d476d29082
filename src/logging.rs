use tracing_subscriber::EnvFilter;

pub const LOG_ENV: &str = "UPNEXT_LOG";
const DEFAULT_DIRECTIVE: &str = "upnext=info";

pub fn init() {
    let filter =
        EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVE));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}
