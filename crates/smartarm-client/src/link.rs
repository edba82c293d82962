//! Broker 链路抽象
//!
//! [`ControlBridge`](crate::ControlBridge) 只依赖这两个操作，
//! 生产环境由 [`MqttLink`](crate::MqttLink) 实现，测试中使用 Mock。

use crate::error::LinkError;

/// 发布/订阅链路
///
/// 实现必须是非阻塞的：`publish` 只负责把消息交给客户端的发送队列。
pub trait BrokerLink: Send + Sync {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError>;

    fn subscribe(&self, topic: &str) -> Result<(), LinkError>;
}

impl<L: BrokerLink + ?Sized> BrokerLink for std::sync::Arc<L> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        (**self).publish(topic, payload)
    }

    fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        (**self).subscribe(topic)
    }
}
