//! # SmartArm Protocol
//!
//! 机械臂控制器链路的线上协议定义（无 IO 依赖）
//!
//! ## 模块
//!
//! - `constants`: 主题名、舵机数量、取值范围等协议常量
//! - `command`: 下行文本控制指令（`MODE`/`SERVO`/`MOTOR`/`STOP`/`HOME`）
//! - `status`: 上行控制器状态 JSON 负载与运行模式
//!
//! ## 链路形态
//!
//! ```text
//! Hub ──(smartarm/control, 文本指令)──▶ Broker ──▶ Controller
//! Hub ◀──(smartarm/status, JSON)────── Broker ◀── Controller
//! ```

pub mod command;
pub mod constants;
pub mod status;

// 重新导出常用类型
pub use command::ControlCommand;
pub use constants::*;
pub use status::{ControllerStatus, Mode};

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// 无法识别的指令关键字
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// 指令参数缺失或格式错误
    #[error("Malformed command: {0}")]
    MalformedCommand(String),

    /// 字段取值越界
    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: String },

    /// JSON 负载解析失败
    #[error("Payload decode error: {0}")]
    Decode(#[from] serde_json::Error),

    /// 负载不是 UTF-8 文本
    #[error("Payload is not valid UTF-8")]
    NotUtf8,
}
