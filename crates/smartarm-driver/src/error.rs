//! 驱动层错误类型定义

use smartarm_protocol::ProtocolError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 无效输入（如越界的舵机角度）
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 采集失败（摄像头断开、读帧出错）
    #[error("Capture error: {0}")]
    Capture(String),

    /// 推理失败
    #[error("Inference error: {0}")]
    Inference(String),

    /// 初始化失败（摄像头/模型无法打开）
    #[error("Initialization failed: {0}")]
    InitializationFailed(String),

    /// 采集资源不可用（已被释放，或 worker 超时未归还）
    #[error("Perception resources unavailable")]
    ResourcesUnavailable,

    /// worker 线程错误
    #[error("Worker thread error: {0}")]
    IoThread(String),

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,

    /// 文件 IO 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
