use tracing_subscriber::EnvFilter;

use podscale_common::config::Config;

/// Installs the global tracing subscriber. Mirrors the environment knobs
/// the original system exposed for its logging setup: format (json/plain),
/// level, and an optional rotating log file, with noisy third-party crates
/// leveled down explicitly.
pub fn init(cfg: &Config) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_new(&cfg.log_level)
        .unwrap_or_else(|_| EnvFilter::new("info"))
        .add_directive("sqlx=warn".parse().unwrap())
        .add_directive("hyper=warn".parse().unwrap())
        .add_directive("reqwest=warn".parse().unwrap());

    let file_writer = cfg.log_file.as_ref().map(|path| {
        let path = std::path::Path::new(path);
        let dir = path.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| std::path::Path::new("."));
        let filename = path.file_name().and_then(|f| f.to_str()).unwrap_or("orchestrator.log");
        tracing_appender::rolling::daily(dir, filename)
    });

    let guard = if let Some(writer) = file_writer {
        let (non_blocking, guard) = tracing_appender::non_blocking(writer);
        build_subscriber(cfg, filter, Some(non_blocking));
        Some(guard)
    } else {
        build_subscriber(cfg, filter, None);
        None
    };

    guard
}

fn build_subscriber(
    cfg: &Config,
    filter: EnvFilter,
    file_writer: Option<tracing_appender::non_blocking::NonBlocking>,
) {
    let json = cfg.log_format != "plain";

    match (json, file_writer) {
        (true, Some(w)) => {
            let _ = tracing_subscriber::fmt()
                .json()
                .with_env_filter(filter)
                .with_writer(w)
                .try_init();
        }
        (true, None) => {
            let _ = tracing_subscriber::fmt().json().with_env_filter(filter).try_init();
        }
        (false, Some(w)) => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).with_writer(w).try_init();
        }
        (false, None) => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
    }
}
