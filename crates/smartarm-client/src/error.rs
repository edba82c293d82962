//! 控制链路错误类型

use smartarm_driver::DriverError;
use smartarm_protocol::{ControlCommand, ProtocolError};
use thiserror::Error;

/// Broker 链路错误
#[derive(Error, Debug)]
pub enum LinkError {
    /// 未连接到 Broker
    #[error("Not connected to broker")]
    NotConnected,

    /// 发布失败（请求队列满或客户端已关闭）
    #[error("Publish to '{topic}' failed: {reason}")]
    Publish { topic: String, reason: String },

    /// 订阅失败
    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// 事件循环线程错误
    #[error("Event loop error: {0}")]
    EventLoop(String),
}

/// 控制桥接错误
#[derive(Error, Debug)]
pub enum BridgeError {
    /// 当前不是 Manual 模式，手动执行指令被拒绝
    #[error("{command} rejected: not in manual mode")]
    NotManualMode { command: ControlCommand },

    /// 指令参数非法（舵机 ID、角度或速度越界）
    #[error("Invalid command: {0}")]
    InvalidCommand(#[from] ProtocolError),

    /// Broker 链路错误
    #[error("Link error: {0}")]
    Link(#[from] LinkError),

    /// 驱动层错误
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bridge_error_display() {
        let err = BridgeError::NotManualMode {
            command: ControlCommand::Servo { id: 2, angle: 45 },
        };
        assert_eq!(format!("{}", err), "SERVO 2 45 rejected: not in manual mode");

        let err = BridgeError::from(LinkError::NotConnected);
        assert_eq!(format!("{}", err), "Link error: Not connected to broker");
    }

    #[test]
    fn test_bridge_error_from_protocol() {
        let err: BridgeError = ProtocolError::InvalidValue {
            field: "angle",
            value: "200".to_string(),
        }
        .into();
        assert!(matches!(err, BridgeError::InvalidCommand(_)));
    }
}
