//! 控制桥接
//!
//! [`ControlBridge`] 连接 Broker 链路与 [`StatusStore`]：
//!
//! - **上行**: 控制器状态 JSON → 校验 → 部分更新 `StatusStore` → 通知 `EventRelay`
//! - **下行**: 控制 API → 模式检查 → 文本指令 → 发布到控制主题
//!
//! 连接事件（`on_connect`/`on_disconnect`/`on_message`）由 MQTT 事件线程调用，
//! 控制 API 可以从任意线程并发调用。发布时不持有任何锁。

use crate::error::BridgeError;
use crate::link::BrokerLink;
use serde::{Deserialize, Serialize};
use smartarm_driver::{EventRelay, RelayKind, StatusPatch, StatusStore};
use smartarm_protocol::{ControlCommand, ControllerStatus, Mode, TOPIC_CONTROL, TOPIC_STATUS};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

/// 主题配置
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeTopics {
    /// 控制器状态上报主题（订阅）
    pub status: String,
    /// 控制指令主题（发布）
    pub control: String,
}

impl Default for BridgeTopics {
    fn default() -> Self {
        Self {
            status: TOPIC_STATUS.to_string(),
            control: TOPIC_CONTROL.to_string(),
        }
    }
}

/// 控制桥接
pub struct ControlBridge<L: BrokerLink> {
    link: L,
    topics: BridgeTopics,
    status: Arc<StatusStore>,
    relay: Arc<EventRelay>,
    commands_sent: AtomicU64,
    reports_applied: AtomicU64,
    reports_rejected: AtomicU64,
}

impl<L: BrokerLink> ControlBridge<L> {
    pub fn new(
        link: L,
        topics: BridgeTopics,
        status: Arc<StatusStore>,
        relay: Arc<EventRelay>,
    ) -> Self {
        Self {
            link,
            topics,
            status,
            relay,
            commands_sent: AtomicU64::new(0),
            reports_applied: AtomicU64::new(0),
            reports_rejected: AtomicU64::new(0),
        }
    }

    pub fn topics(&self) -> &BridgeTopics {
        &self.topics
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    // ==================== 链路事件 ====================

    /// 连接建立：订阅状态主题并标记控制器在线
    pub fn on_connect(&self) {
        info!("Connected to broker, subscribing to '{}'", self.topics.status);
        if let Err(e) = self.link.subscribe(&self.topics.status) {
            warn!("Failed to subscribe controller status: {}", e);
            self.status.report_error(e.to_string());
        }
        self.set_connected(true);
    }

    /// 连接断开：标记控制器离线
    pub fn on_disconnect(&self, reason: &str) {
        warn!("Broker connection lost: {}", reason);
        self.set_connected(false);
    }

    /// 收到消息
    ///
    /// 非状态主题的消息被忽略；格式错误的负载不修改状态，只记录 `error_message`。
    pub fn on_message(&self, topic: &str, payload: &[u8]) {
        if topic != self.topics.status {
            debug!("Ignoring message on unexpected topic '{}'", topic);
            return;
        }

        let result = ControllerStatus::decode(payload)
            .map_err(BridgeError::from)
            .and_then(|report| {
                self.status
                    .update(StatusPatch::from(report))
                    .map_err(BridgeError::from)
            });

        match result {
            Ok(_) => {
                self.reports_applied.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                let rejected = self.reports_rejected.fetch_add(1, Ordering::Relaxed) + 1;
                if rejected == 1 || rejected % 100 == 0 {
                    warn!("Dropping controller status ({} rejected): {}", rejected, e);
                }
                self.status
                    .report_error(format!("invalid controller status: {}", e));
            },
        }
        self.relay.notify(RelayKind::Status);
    }

    // ==================== 控制 API ====================

    /// 切换运行模式
    ///
    /// 先更新本地状态，再发布 `MODE <AUTO|MANUAL>`，最后通知广播。
    /// 发布失败时本地模式已生效，错误返回给调用方。
    pub fn set_mode(&self, mode: Mode) -> Result<(), BridgeError> {
        self.status.update(StatusPatch::new().mode(mode))?;
        info!("Mode set to {}", mode);
        let published = self.publish(ControlCommand::SetMode(mode));
        self.relay.notify(RelayKind::Status);
        published
    }

    /// 设置单个舵机角度（仅 Manual 模式）
    ///
    /// # 错误
    /// - `NotManualMode`: 当前为 Auto 模式，不发布
    /// - `InvalidCommand`: ID ≥ 5 或角度不在 0..=180，不发布
    pub fn set_servo(&self, servo_id: u8, angle: i32) -> Result<(), BridgeError> {
        self.send(ControlCommand::servo(servo_id, angle)?)
    }

    /// 设置电机速度（仅 Manual 模式）
    ///
    /// # 错误
    /// - `NotManualMode`: 当前为 Auto 模式，不发布
    /// - `InvalidCommand`: 速度不在 -100..=100，不发布
    pub fn set_motor(&self, speed: i32) -> Result<(), BridgeError> {
        self.send(ControlCommand::motor(speed)?)
    }

    /// 急停（任何模式下都允许）
    pub fn emergency_stop(&self) -> Result<(), BridgeError> {
        warn!("Emergency stop requested");
        self.send(ControlCommand::Stop)
    }

    /// 回到中位（任何模式下都允许）
    pub fn home(&self) -> Result<(), BridgeError> {
        self.send(ControlCommand::Home)
    }

    /// 发送任意指令
    ///
    /// `SetMode` 走 [`set_mode`](Self::set_mode) 的完整流程；手动执行类指令先检查模式。
    pub fn send(&self, command: ControlCommand) -> Result<(), BridgeError> {
        if let ControlCommand::SetMode(mode) = command {
            return self.set_mode(mode);
        }
        if command.requires_manual() && !self.status.mode().is_manual() {
            debug!("Rejecting {} outside manual mode", command);
            return Err(BridgeError::NotManualMode { command });
        }
        self.publish(command)
    }

    // ==================== 统计 ====================

    pub fn commands_sent(&self) -> u64 {
        self.commands_sent.load(Ordering::Relaxed)
    }

    pub fn reports_applied(&self) -> u64 {
        self.reports_applied.load(Ordering::Relaxed)
    }

    pub fn reports_rejected(&self) -> u64 {
        self.reports_rejected.load(Ordering::Relaxed)
    }

    fn publish(&self, command: ControlCommand) -> Result<(), BridgeError> {
        let payload = command.encode();
        self.link.publish(&self.topics.control, payload.as_bytes())?;
        self.commands_sent.fetch_add(1, Ordering::Relaxed);
        debug!("Published '{}' to '{}'", payload, self.topics.control);
        Ok(())
    }

    fn set_connected(&self, connected: bool) {
        match self
            .status
            .update(StatusPatch::new().controller_connected(connected))
        {
            Ok(_) => self.relay.notify(RelayKind::Status),
            Err(e) => warn!("Failed to update controller_connected: {}", e),
        }
    }
}
