//! MQTT 链路（rumqttc 同步客户端）
//!
//! ```text
//! MqttLink (Client, 任意线程发布) ──请求队列──▶ Connection
//!                                                   │
//!                         smartarm-mqtt 线程: connection.iter()
//!                                                   │
//!                   ConnAck / Publish / Error ──▶ ControlBridge
//! ```
//!
//! rumqttc 在下一次迭代时自动重连；断开期间 `try_publish` 仍会入队，
//! 队列满时返回 `LinkError::Publish`。
//!
//! 单次连接尝试（TCP + ConnAck）受 `connect_timeout_secs` 限制，重试间隔的等待
//! 可被停止信号打断，因此 [`MqttEventLoop::stop`] 最长等待
//! [`MqttSettings::stop_timeout`]。

use crate::bridge::{BridgeTopics, ControlBridge};
use crate::error::{BridgeError, LinkError};
use crate::link::BrokerLink;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use rumqttc::{
    Client, ConnectReturnCode, Connection, Event, MqttOptions, NetworkOptions, Packet, QoS,
};
use serde::{Deserialize, Serialize};
use smartarm_driver::JoinTimeout;
use smartarm_protocol::{TOPIC_CONTROL, TOPIC_STATUS};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

/// rumqttc 要求的最小心跳间隔
const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// 停止等待在连接超时之外的余量
const STOP_MARGIN: Duration = Duration::from_secs(1);

/// Broker 连接参数
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    /// 单次连接尝试（TCP 建连 + 等待 ConnAck）的超时
    pub connect_timeout_secs: u64,
    /// 连接失败后的重试间隔
    pub reconnect_backoff_ms: u64,
    /// 客户端请求队列容量
    pub request_capacity: usize,
    pub status_topic: String,
    pub control_topic: String,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "smartarm-hub".to_string(),
            keep_alive_secs: 60,
            connect_timeout_secs: 1,
            reconnect_backoff_ms: 1000,
            request_capacity: 64,
            status_topic: TOPIC_STATUS.to_string(),
            control_topic: TOPIC_CONTROL.to_string(),
        }
    }
}

impl MqttSettings {
    pub fn topics(&self) -> BridgeTopics {
        BridgeTopics {
            status: self.status_topic.clone(),
            control: self.control_topic.clone(),
        }
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.max(1))
    }

    /// 事件线程停止的等待上限：一次连接尝试的最长耗时加余量
    pub fn stop_timeout(&self) -> Duration {
        self.connect_timeout() + STOP_MARGIN
    }

    fn network_options(&self) -> NetworkOptions {
        let mut network = NetworkOptions::new();
        network.set_connection_timeout(self.connect_timeout().as_secs());
        network
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(Duration::from_secs(
            self.keep_alive_secs.max(MIN_KEEP_ALIVE_SECS),
        ));
        options
    }
}

/// 基于 rumqttc `Client` 的 [`BrokerLink`] 实现
#[derive(Clone)]
pub struct MqttLink {
    client: Client,
}

impl MqttLink {
    /// 创建客户端与连接
    ///
    /// 此时尚未发起网络连接，`Connection` 需交给 [`MqttEventLoop::spawn`] 驱动。
    pub fn new(settings: &MqttSettings) -> (Self, Connection) {
        let (client, mut connection) =
            Client::new(settings.options(), settings.request_capacity.max(1));
        connection
            .eventloop
            .set_network_options(settings.network_options());
        info!(
            "MQTT client '{}' targeting {}:{}",
            settings.client_id, settings.host, settings.port
        );
        (Self { client }, connection)
    }
}

impl BrokerLink for MqttLink {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), LinkError> {
        self.client
            .try_publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .map_err(|e| LinkError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    fn subscribe(&self, topic: &str) -> Result<(), LinkError> {
        self.client
            .try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| LinkError::Subscribe {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }
}

/// MQTT 事件线程
pub struct MqttEventLoop {
    client: Client,
    running: Arc<AtomicBool>,
    /// 丢弃即打断重试等待
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl MqttEventLoop {
    /// 启动事件线程，把连接事件分发给 `bridge`
    pub fn spawn(
        connection: Connection,
        bridge: Arc<ControlBridge<MqttLink>>,
        reconnect_backoff: Duration,
    ) -> Result<Self, LinkError> {
        let client = bridge.link().client.clone();
        let running = Arc::new(AtomicBool::new(true));
        let thread_running = running.clone();
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);

        let handle = thread::Builder::new()
            .name("smartarm-mqtt".to_string())
            .spawn(move || {
                mqtt_event_loop(connection, &bridge, &shutdown_rx, reconnect_backoff);
                thread_running.store(false, Ordering::Release);
            })
            .map_err(|e| LinkError::EventLoop(e.to_string()))?;

        Ok(Self {
            client,
            running,
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// 断开连接并等待事件线程退出（幂等）
    ///
    /// `timeout` 应不小于 [`MqttSettings::stop_timeout`]，否则正在进行的连接尝试
    /// 可能来不及返回。
    pub fn stop(&mut self, timeout: Duration) -> Result<(), BridgeError> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        self.running.store(false, Ordering::Release);
        drop(self.shutdown_tx.take());
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request not queued: {}", e);
        }
        handle.join_timeout(timeout)?;
        info!("MQTT event loop stopped");
        Ok(())
    }
}

impl Drop for MqttEventLoop {
    fn drop(&mut self) {
        if self.handle.is_some()
            && let Err(e) = self.stop(Duration::from_secs(2))
        {
            warn!("MQTT event loop did not stop cleanly: {}", e);
        }
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

fn mqtt_event_loop(
    mut connection: Connection,
    bridge: &ControlBridge<MqttLink>,
    shutdown: &Receiver<()>,
    reconnect_backoff: Duration,
) {
    let mut connected = false;
    let mut failures: u64 = 0;

    for notification in connection.iter() {
        if shutdown_requested(shutdown) {
            break;
        }

        match notification {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    connected = true;
                    failures = 0;
                    bridge.on_connect();
                } else {
                    warn!("Broker refused connection: {:?}", ack.code);
                }
            },
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                bridge.on_message(&publish.topic, &publish.payload);
            },
            Ok(_) => {},
            Err(e) => {
                if connected {
                    connected = false;
                    bridge.on_disconnect(&e.to_string());
                } else {
                    failures += 1;
                    if failures == 1 || failures % 30 == 0 {
                        warn!("Broker unreachable ({} attempts): {}", failures, e);
                    }
                }
                // 重试等待期间收到停止信号立即退出
                if !matches!(
                    shutdown.recv_timeout(reconnect_backoff),
                    Err(RecvTimeoutError::Timeout)
                ) {
                    break;
                }
            },
        }
    }

    if connected {
        bridge.on_disconnect("event loop stopped");
    }
    debug!("MQTT event loop exiting");
}
