use tracing::Subscriber;
use tracing_log::LogTracer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

/// Compose the tracing subscriber. `RUST_LOG` overrides the provided default
/// filter directive.
pub fn get_subscriber(env_filter: String) -> impl Subscriber + Send + Sync {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(env_filter));
    Registry::default().with(env_filter).with(fmt::layer())
}

/// Register the subscriber globally and redirect `log` events into it.
/// Call once at startup.
pub fn init_subscriber(subscriber: impl Subscriber + Send + Sync) {
    let _ = LogTracer::init();
    let _ = subscriber.try_init();
}

/// Log an error at error level with its full source chain.
pub fn log_error(e: anyhow::Error) {
    tracing::error!("{:?}", e);
}
