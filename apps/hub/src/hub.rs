//! Hub 组装与生命周期
//!
//! 启动顺序：状态存储 → 记录器 → 感知上下文与回调 → MQTT 桥接 →
//! WebSocket 监听 → 中继消费任务 → 感知线程。
//!
//! 关闭顺序（写者先停，资源后放）：
//!
//! 1. 停止感知线程，归还并释放采集源/检测器
//! 2. 停止 MQTT 事件线程，断开 Broker
//! 3. 关闭中继，等待消费任务取完剩余通知
//! 4. 停止监听并移除所有订阅者
//! 5. 关闭记录器，写完队列中的记录

use crate::broadcaster::Broadcaster;
use crate::config::{HubConfig, PerceptionSection, SourceKind};
use crate::server;
use anyhow::{Context, Result};
use smartarm_client::{ControlBridge, MqttEventLoop, MqttLink};
use smartarm_driver::mock::{ScriptedDetector, TestPatternSource};
use smartarm_driver::{
    CsvRecorder, DetectionBuffer, Detector, DriverError, EventRelay, FrameSource,
    LastDetectionHook, PerceptionContext, PerceptionLoop, RecordingHook, StatusStore,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// 脚本化检测器的往返步数
const SWEEP_STEPS: usize = 60;

type HubPerception = PerceptionLoop<Box<dyn FrameSource>, Box<dyn Detector>>;

/// 按配置打开采集源和检测器
///
/// `SourceKind::None` 返回 `Ok(None)`。
///
/// # 错误
/// - `InitializationFailed`: 采集源或检测器无法创建
pub fn open_perception(
    section: &PerceptionSection,
) -> Result<Option<(Box<dyn FrameSource>, Box<dyn Detector>)>, DriverError> {
    match section.source {
        SourceKind::None => Ok(None),
        SourceKind::TestPattern => {
            if section.frame_width == 0 || section.frame_height == 0 {
                return Err(DriverError::InitializationFailed(format!(
                    "invalid test pattern size {}x{}",
                    section.frame_width, section.frame_height
                )));
            }
            let source = TestPatternSource::new(section.frame_width, section.frame_height);
            let detector =
                ScriptedDetector::sweeping(section.frame_width, section.frame_height, SWEEP_STEPS);
            Ok(Some((Box::new(source), Box::new(detector))))
        },
    }
}

/// 中继消费任务：每批通知重新读取最新数据并广播
pub async fn relay_consumer(relay: Arc<EventRelay>, broadcaster: Arc<Broadcaster>) {
    while let Some(batch) = relay.next().await {
        if batch.status {
            broadcaster.push_status();
        }
        if batch.detections {
            broadcaster.push_detections();
        }
    }
    debug!("Relay consumer finished");
}

/// 运行中的 Hub
pub struct Hub {
    status: Arc<StatusStore>,
    buffer: Arc<DetectionBuffer>,
    relay: Arc<EventRelay>,
    broadcaster: Arc<Broadcaster>,
    context: Arc<PerceptionContext>,
    bridge: Arc<ControlBridge<MqttLink>>,
    perception: Option<HubPerception>,
    mqtt: MqttEventLoop,
    mqtt_stop_timeout: Duration,
    recorder: Option<Arc<CsvRecorder>>,
    consumer: JoinHandle<()>,
    server: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl Hub {
    /// 按配置启动所有组件
    pub async fn start(config: HubConfig) -> Result<Self> {
        config.validate()?;

        let status = Arc::new(StatusStore::new());
        let buffer = Arc::new(DetectionBuffer::new());
        let relay = Arc::new(EventRelay::new());
        let broadcaster = Arc::new(Broadcaster::new(status.clone(), buffer.clone()));

        let recorder = if config.recorder.enabled {
            let recorder = CsvRecorder::create(&config.recorder.path, config.recorder.queue_capacity)
                .with_context(|| {
                    format!("Failed to open recorder at {}", config.recorder.path.display())
                })?;
            Some(Arc::new(recorder))
        } else {
            None
        };

        // 感知上下文：先写 last_detection，再生成记录（记录读取的是更新后的状态）
        let context = Arc::new(PerceptionContext::new(
            status.clone(),
            buffer.clone(),
            relay.clone(),
        ));
        context.add_hook(Arc::new(LastDetectionHook::new(status.clone(), relay.clone())));
        if let Some(recorder) = &recorder {
            context.add_hook(Arc::new(RecordingHook::new(status.clone(), recorder.clone())));
        }

        let mut perception = open_perception(&config.perception)
            .context("Perception initialization failed")?
            .map(|(source, detector)| {
                PerceptionLoop::new(
                    source,
                    detector,
                    context.clone(),
                    config.perception.tuning.clone(),
                )
            });

        let (link, connection) = MqttLink::new(&config.broker);
        let bridge = Arc::new(ControlBridge::new(
            link,
            config.broker.topics(),
            status.clone(),
            relay.clone(),
        ));
        let mqtt = MqttEventLoop::spawn(connection, bridge.clone(), config.broker.reconnect_backoff())
            .context("Failed to start MQTT event loop")?;

        let listener = TcpListener::bind(config.ws_socket_addr()?)
            .await
            .with_context(|| format!("Failed to bind WebSocket server on {}", config.server.ws_addr))?;
        let local_addr = listener.local_addr()?;

        // 可能失败的步骤都在派生异步任务之前完成，出错时不遗留后台任务
        match perception.as_mut() {
            Some(perception) => perception.start().context("Failed to start perception loop")?,
            None => info!("Perception disabled (source = none)"),
        }

        let consumer = tokio::spawn(relay_consumer(relay.clone(), broadcaster.clone()));
        let server = tokio::spawn(server::serve(
            listener,
            broadcaster.clone(),
            config.server.subscriber_buffer,
        ));

        let hub = Self {
            status,
            buffer,
            relay,
            broadcaster,
            context,
            bridge,
            perception,
            mqtt,
            mqtt_stop_timeout: config.broker.stop_timeout(),
            recorder,
            consumer,
            server,
            local_addr,
        };

        info!(
            "SmartArm hub running: ws://{}, broker {}:{}",
            hub.local_addr, config.broker.host, config.broker.port
        );
        Ok(hub)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn status(&self) -> &Arc<StatusStore> {
        &self.status
    }

    pub fn buffer(&self) -> &Arc<DetectionBuffer> {
        &self.buffer
    }

    pub fn bridge(&self) -> &Arc<ControlBridge<MqttLink>> {
        &self.bridge
    }

    pub fn broadcaster(&self) -> &Arc<Broadcaster> {
        &self.broadcaster
    }

    /// 按固定顺序关闭
    pub async fn shutdown(self) -> Result<()> {
        let Hub {
            relay,
            broadcaster,
            context,
            perception,
            mut mqtt,
            mqtt_stop_timeout,
            recorder,
            consumer,
            server,
            ..
        } = self;

        // 1. 感知线程（阻塞等待 join，放到阻塞线程池）
        if let Some(perception) = perception {
            let released = tokio::task::spawn_blocking(move || perception.release())
                .await
                .context("Perception shutdown task failed")?;
            if released.is_none() {
                warn!("Perception resources were not returned by the worker");
            }
            let metrics = context.metrics.snapshot();
            info!(
                "Perception stopped: {} cycles, {} detections, {} capture misses",
                metrics.cycles_total, metrics.detections_total, metrics.capture_misses
            );
        }

        // 2. MQTT 事件线程
        let mqtt_result = tokio::task::spawn_blocking(move || mqtt.stop(mqtt_stop_timeout))
            .await
            .context("MQTT shutdown task failed")?;
        if let Err(e) = mqtt_result {
            warn!("MQTT event loop did not stop cleanly: {}", e);
        }

        // 3. 中继
        relay.close();
        if let Err(e) = consumer.await {
            warn!("Relay consumer ended abnormally: {}", e);
        }

        // 4. 订阅服务
        server.abort();
        broadcaster.close_all();
        let stats = broadcaster.stats();
        info!(
            "Broadcaster stopped: {} rounds, {} delivered, {} pruned",
            stats.rounds, stats.delivered, stats.pruned
        );

        // 5. 记录器：先解除回调持有的引用
        context.hooks.write().clear();
        drop(context);
        if let Some(recorder) = recorder {
            match Arc::try_unwrap(recorder) {
                Ok(mut recorder) => {
                    recorder.close();
                    info!(
                        "Recorder closed: {} written, {} dropped",
                        recorder.written_records(),
                        recorder.dropped_records()
                    );
                },
                Err(_) => warn!("Recorder still referenced at shutdown"),
            }
        }

        info!("SmartArm hub stopped");
        Ok(())
    }
}
