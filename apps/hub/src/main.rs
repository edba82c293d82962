//! SmartArm Hub 入口
//!
//! 读取配置，启动 Hub，等待 Ctrl+C 后按顺序关闭。

use anyhow::Result;
use clap::Parser;
use smartarm_hub::logging::init_logging;
use smartarm_hub::{Hub, HubConfig};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;
use tracing::{error, info, warn};

/// 命令行参数
#[derive(Parser, Debug)]
#[command(name = "smartarm-hub")]
#[command(about = "SmartArm hub: perception, controller bridge and WebSocket fan-out", long_about = None)]
#[command(version)]
struct Args {
    /// 配置文件（TOML），缺省时使用内置默认值
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket 监听地址，覆盖配置文件
    #[arg(long)]
    ws_addr: Option<String>,

    /// MQTT Broker 主机，覆盖配置文件
    #[arg(long)]
    broker_host: Option<String>,

    /// MQTT Broker 端口，覆盖配置文件
    #[arg(long)]
    broker_port: Option<u16>,

    /// 日志过滤（如 `debug` 或 `smartarm_driver=trace`），优先于 RUST_LOG
    #[arg(long)]
    log_level: Option<String>,
}

fn load_config(args: &Args) -> Result<HubConfig> {
    let mut config = match &args.config {
        Some(path) => HubConfig::load(path)?,
        None => HubConfig::default(),
    };

    if let Some(addr) = &args.ws_addr {
        config.server.ws_addr = addr.clone();
    }
    if let Some(host) = &args.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = match load_config(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Configuration error: {:#}", e);
            std::process::exit(1);
        },
    };

    let _log_guard = match init_logging(args.log_level.as_deref(), config.log_dir.as_deref()) {
        Ok(guard) => guard,
        Err(e) => {
            eprintln!("Logging initialization failed: {:#}", e);
            std::process::exit(1);
        },
    };

    // Ctrl+C：第一次触发优雅关闭，第二次强制退出
    let shutdown = Arc::new(Notify::new());
    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let shutdown = shutdown.clone();
        let interrupted = interrupted.clone();
        ctrlc::set_handler(move || {
            if interrupted.swap(true, Ordering::SeqCst) {
                eprintln!("Forced exit");
                std::process::exit(130);
            }
            shutdown.notify_one();
        })?;
    }

    let hub = match Hub::start(config).await {
        Ok(hub) => hub,
        Err(e) => {
            error!("Hub startup failed: {:#}", e);
            std::process::exit(1);
        },
    };

    info!("Press Ctrl+C to stop");
    shutdown.notified().await;
    info!("Shutdown requested");

    if let Err(e) = hub.shutdown().await {
        warn!("Shutdown finished with errors: {:#}", e);
    }
    Ok(())
}
