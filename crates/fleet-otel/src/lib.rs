use once_cell::sync::OnceCell;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{
    fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
    EnvFilter,
};

static FILE_GUARD: OnceCell<tracing_appender::non_blocking::WorkerGuard> = OnceCell::new();

/// Install the process-wide tracing subscriber.
///
/// Console output honours `RUST_LOG` (default `info`). With `FLEET_LOG_ROLL=1`
/// every `fleet::*` event at INFO or above is additionally written to a
/// rolling file under `FLEET_LOG_DIR`.
pub fn init() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    install_console(filter);
}

fn install_console(filter: EnvFilter) {
    let fmt_layer = fmt::layer();
    let registry = tracing_subscriber::registry().with(fmt_layer.with_filter(filter));
    if std::env::var("FLEET_LOG_ROLL").ok().as_deref() == Some("1") {
        let dir = std::env::var("FLEET_LOG_DIR").unwrap_or_else(|_| "logs".to_string());
        let prefix = std::env::var("FLEET_LOG_PREFIX").unwrap_or_else(|_| "fleet".into());
        let rotation = std::env::var("FLEET_LOG_ROTATION").unwrap_or_else(|_| "daily".into());
        if std::fs::create_dir_all(&dir).is_err() {
            tracing::warn!(directory = %dir, "failed to create log directory");
        }
        let writer = match rotation.to_lowercase().as_str() {
            "hourly" => tracing_appender::rolling::hourly(&dir, &prefix),
            "minutely" => tracing_appender::rolling::minutely(&dir, &prefix),
            _ => tracing_appender::rolling::daily(&dir, &prefix),
        };
        let (nb, guard) = tracing_appender::non_blocking(writer);
        let _ = FILE_GUARD.set(guard);
        let targets = Targets::new().with_target("fleet", tracing::Level::INFO);
        let file_layer = fmt::layer()
            .with_ansi(false)
            .with_writer(nb)
            .with_filter(targets);
        let subscriber = registry.with(file_layer);
        let _ = subscriber.try_init();
    } else {
        let _ = registry.try_init();
    }
}

/// Console-only subscriber for tests; safe to call repeatedly.
pub fn init_for_tests() {
    let _ = fmt()
        .with_env_filter(EnvFilter::new("debug"))
        .with_test_writer()
        .try_init();
}
