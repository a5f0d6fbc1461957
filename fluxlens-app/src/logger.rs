use std::env;
use tracing_subscriber::fmt::format::{DefaultFields, Format};
use tracing_subscriber::fmt::SubscriberBuilder;
use tracing_subscriber::EnvFilter;

/// `RUST_LOG` wins when set, otherwise `module` and the core crate log at `log_level`.
pub fn setup(module: &str, log_level: &str) {
    if env::var_os("RUST_LOG").is_none() {
        let env = format!("{module}={log_level},fluxlens_core={log_level}");
        env::set_var("RUST_LOG", env);
    }
    get_subscriber().init();
}

pub fn get_subscriber() -> SubscriberBuilder<DefaultFields, Format, EnvFilter> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_file(true)
        .with_line_number(true)
        .with_thread_ids(true)
        .with_thread_names(true)
}
