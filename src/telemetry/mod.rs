use crate::config::LoggingConfig;
use tracing::debug;
use tracing_subscriber::EnvFilter;

pub const SESSIONS_ACTIVE: &str = "transcoder_sessions_active";
pub const SESSIONS_TOTAL: &str = "transcoder_sessions_total";
pub const EVENTS_DROPPED_TOTAL: &str = "transcoder_events_dropped_total";

/// 初始化日志，支持通过 RUST_LOG 覆盖配置中的级别
///
/// 日志写到 stderr，stdout 留给转码输出。重复调用不会报错，已经安装过 subscriber 时直接忽略
pub fn init_logging(config: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));

    let result = if config.json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init()
    };

    if result.is_err() {
        debug!("tracing subscriber already installed");
    }
}

// 指标只通过 metrics facade 记录，exporter 由宿主进程安装

pub(crate) fn session_opened() {
    metrics::increment_counter!(SESSIONS_TOTAL);
    metrics::increment_gauge!(SESSIONS_ACTIVE, 1.0);
}

pub(crate) fn session_closed() {
    metrics::decrement_gauge!(SESSIONS_ACTIVE, 1.0);
}

pub(crate) fn event_dropped(protocol: &'static str, reason: &'static str) {
    metrics::increment_counter!(EVENTS_DROPPED_TOTAL, "protocol" => protocol, "reason" => reason);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_logging_is_idempotent() {
        let config = LoggingConfig::default();
        init_logging(&config);
        init_logging(&config);
    }
}
