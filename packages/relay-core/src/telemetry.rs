//! 日志初始化

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// 安装全局 tracing subscriber。RUST_LOG 优先于 default_filter；
/// 已存在全局 subscriber 时返回 false。
pub fn init_logging(default_filter: &str, format: LogFormat) -> bool {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match format {
        LogFormat::Text => registry.with(fmt::layer().with_target(true)).try_init(),
        LogFormat::Json => registry.with(fmt::layer().json().with_target(true)).try_init(),
    };

    match installed {
        Ok(()) => {
            tracing::info!(filter = default_filter, ?format, "Logging initialized");
            true
        }
        Err(_) => {
            tracing::debug!("Global tracing subscriber already installed");
            false
        }
    }
}
