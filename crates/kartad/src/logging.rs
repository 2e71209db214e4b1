use tracing_subscriber::EnvFilter;

pub const LOG_ENV_VAR: &str = "KARTA_LOG";
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Filter directive: `KARTA_LOG`, then the configured filter, then `info`.
pub fn resolve_filter(env_value: Option<String>, configured: Option<&str>) -> String {
    env_value
        .filter(|value| !value.trim().is_empty())
        .or_else(|| configured.map(str::to_string))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string())
}

/// Installs the process-wide subscriber. Later calls are no-ops.
pub fn init_logging(configured: Option<&str>) {
    let directive = resolve_filter(std::env::var(LOG_ENV_VAR).ok(), configured);
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|err| {
        eprintln!("karta: ignoring invalid log filter '{directive}': {err}");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    });
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
