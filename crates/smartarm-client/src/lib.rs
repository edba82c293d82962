//! # SmartArm Client
//!
//! Hub 与机械臂控制器之间的 MQTT 控制桥接
//!
//! - [`ControlBridge`]: 上行状态合并、下行指令校验与发布
//! - [`BrokerLink`]: 发布/订阅抽象，便于替换与测试
//! - [`MqttLink`] / [`MqttEventLoop`]: 基于 rumqttc 的实现与事件线程

pub mod bridge;
pub mod error;
pub mod link;
pub mod mqtt;

pub use bridge::{BridgeTopics, ControlBridge};
pub use error::{BridgeError, LinkError};
pub use link::BrokerLink;
pub use mqtt::{MqttEventLoop, MqttLink, MqttSettings};
