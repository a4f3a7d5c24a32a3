use sphynx_server::LogLevel;

pub fn init(level: LogLevel) {
    let filter = match level {
        LogLevel::Inane => "trace",
        LogLevel::Info => "info",
        LogLevel::Warn => "warn",
        LogLevel::Fatal => "error",
    };
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::try_new(filter).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")))
        .init();
}
