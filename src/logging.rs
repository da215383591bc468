//! Logging setup
//!
//! Installs the tracing subscriber shared by the library and the binary.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the log filter
pub const LOG_ENV: &str = "QUESTBOARD_LOG";

pub fn init_tracing(component: &str) {
    let default_filter = format!("info,questboard_lib=debug,{component}=debug");

    let filter = std::env::var(LOG_ENV)
        .ok()
        .and_then(|value| EnvFilter::try_new(value).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new(default_filter));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_names(true)
        .with_writer(std::io::stderr)
        .compact()
        .try_init();
}
