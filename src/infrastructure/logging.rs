//! 日志系统配置模块
//! 结构化日志、日志级别过滤、可选的按天轮转文件日志

use std::path::Path;

use tracing_appender::{non_blocking, non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{
    fmt::{self, time::ChronoUtc},
    layer::SubscriberExt,
    util::SubscriberInitExt,
    EnvFilter, Layer, Registry,
};

use crate::config::LoggingConfig;

const LOG_FILE_NAME: &str = "wallet.log";

/// 初始化日志系统
///
/// 启用文件日志时返回写线程的 guard，调用方需持有到进程结束
pub fn init_logging(config: &LoggingConfig) -> anyhow::Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("rights_wallet={}", config.level)));
    let json = config.format == "json";

    let stdout_layer = if json {
        fmt::layer()
            .json()
            .with_timer(ChronoUtc::rfc_3339())
            .boxed()
    } else {
        fmt::layer()
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(true)
            .boxed()
    };

    if !config.enable_file_logging {
        Registry::default()
            .with(filter)
            .with(stdout_layer)
            .try_init()?;
        return Ok(None);
    }

    let log_dir = config
        .log_file_path
        .as_deref()
        .and_then(|p| Path::new(p).parent())
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("./logs"));
    std::fs::create_dir_all(log_dir)?;

    let (writer, guard) = non_blocking(rolling::daily(log_dir, LOG_FILE_NAME));
    let file_layer = if json {
        fmt::layer()
            .json()
            .with_writer(writer)
            .with_timer(ChronoUtc::rfc_3339())
            .boxed()
    } else {
        fmt::layer()
            .with_writer(writer)
            .with_timer(ChronoUtc::rfc_3339())
            .with_ansi(false)
            .boxed()
    };

    Registry::default()
        .with(filter)
        .with(stdout_layer)
        .with(file_layer)
        .try_init()?;

    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_file_logging_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("logs").join("wallet.log");
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: "json".to_string(),
            enable_file_logging: true,
            log_file_path: Some(log_path.to_string_lossy().into_owned()),
        };

        // 全局 subscriber 只能安装一次，这里只关心目录被创建
        let _ = init_logging(&config);
        assert!(dir.path().join("logs").exists());
    }
}
