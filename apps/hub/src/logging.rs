//! 日志初始化
//!
//! - 控制台：人类可读格式
//! - 文件（可选）：`<log_dir>/smartarm-hub.log.YYYY-MM-DD`，按天轮转，非阻塞写入
//!
//! 过滤级别优先级：`--log-level` > `RUST_LOG` > `info`。

use anyhow::{Context, Result};
use std::path::Path;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt;
use tracing_subscriber::prelude::*;

const LOG_FILE_PREFIX: &str = "smartarm-hub.log";

fn build_filter(level: Option<&str>) -> Result<EnvFilter> {
    match level {
        Some(level) => EnvFilter::try_new(level)
            .with_context(|| format!("Invalid log level '{}'", level)),
        None => Ok(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))),
    }
}

/// 初始化全局 subscriber
///
/// 返回的 `WorkerGuard` 必须持有到进程退出，否则文件日志可能丢失末尾部分。
pub fn init_logging(level: Option<&str>, log_dir: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(level)?;
    let console = fmt::layer().with_target(false);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(filter)
            .with(console)
            .try_init()
            .context("Failed to install tracing subscriber")?;
        return Ok(None);
    };

    std::fs::create_dir_all(dir)
        .with_context(|| format!("Failed to create log directory {}", dir.display()))?;
    let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
    let (writer, guard) = tracing_appender::non_blocking(appender);
    let file = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .with_thread_names(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(Some(guard))
}
