//! 感知线程
//!
//! [`PerceptionLoop`] 在独立 OS 线程上循环执行：采集一帧 → 推理 → 过滤 →
//! 发布到 [`DetectionBuffer`] → 非空时触发回调并通知 [`EventRelay`]。
//!
//! 采集源和检测器由线程独占，停止后归还给 `PerceptionLoop`，可以再次启动。
//!
//! # 停止语义
//!
//! `stop()` 丢弃 shutdown 通道的发送端，worker 在当前周期的等待点立即醒来退出；
//! 若 worker 卡在采集/推理调用中，最多等待 `join_timeout_ms`，超时返回
//! `DriverError::Timeout`（此时资源随 worker 线程一起泄漏到进程退出）。
//!
//! 检测器 panic 按推理错误计数，循环继续；worker 因其他原因 panic 退出时，
//! `is_running` 与 `vision_active` 仍会被复位。

use crate::detection::{DetectionBuffer, DetectionEvent, Frame, RawDetection};
use crate::error::DriverError;
use crate::hooks::{DetectionCallback, HookManager};
use crate::metrics::PerceptionMetrics;
use crate::relay::{EventRelay, RelayKind};
use crate::state::{StatusPatch, StatusStore};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 默认目标类别（COCO：person、bottle、cup、fork、knife、spoon、bowl、banana、apple）
pub const DEFAULT_TARGET_CLASSES: [u32; 9] = [0, 39, 41, 42, 43, 44, 45, 46, 47];

/// 帧来源（摄像头、视频文件、合成数据）
pub trait FrameSource: Send + 'static {
    /// 采集下一帧
    ///
    /// `Ok(None)` 表示暂时没有可用帧（例如设备正在重连），调用方退避后重试。
    fn next_frame(&mut self) -> Result<Option<Frame>, DriverError>;
}

/// 目标检测器
pub trait Detector: Send + 'static {
    /// 对一帧执行推理，返回未过滤的原始检测
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, DriverError>;
}

impl FrameSource for Box<dyn FrameSource> {
    fn next_frame(&mut self) -> Result<Option<Frame>, DriverError> {
        (**self).next_frame()
    }
}

impl Detector for Box<dyn Detector> {
    fn infer(&mut self, frame: &Frame) -> Result<Vec<RawDetection>, DriverError> {
        (**self).infer(frame)
    }
}

/// 感知线程配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerceptionConfig {
    /// 每个周期结束后的等待时间（毫秒），约 30 fps
    pub cycle_delay_ms: u64,
    /// 采集失败后的退避时间（毫秒）
    pub capture_backoff_ms: u64,
    /// 停止时等待 worker 退出的上限（毫秒）
    pub join_timeout_ms: u64,
    /// 置信度阈值（含）
    pub confidence_threshold: f32,
    /// 目标类别，空列表表示接受所有类别
    pub target_classes: Vec<u32>,
}

impl Default for PerceptionConfig {
    fn default() -> Self {
        Self {
            cycle_delay_ms: 33,
            capture_backoff_ms: 100,
            join_timeout_ms: 2000,
            confidence_threshold: 0.5,
            target_classes: DEFAULT_TARGET_CLASSES.to_vec(),
        }
    }
}

impl PerceptionConfig {
    pub fn cycle_delay(&self) -> Duration {
        Duration::from_millis(self.cycle_delay_ms)
    }

    pub fn capture_backoff(&self) -> Duration {
        Duration::from_millis(self.capture_backoff_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// 原始检测是否通过阈值和类别过滤
    pub fn accepts(&self, raw: &RawDetection) -> bool {
        raw.confidence >= self.confidence_threshold
            && (self.target_classes.is_empty() || self.target_classes.contains(&raw.class_id))
    }
}

/// 过滤原始检测并转换为 [`DetectionEvent`]（保持检测器输出顺序）
pub fn filter_detections(
    raw: &[RawDetection],
    frame: &Frame,
    config: &PerceptionConfig,
) -> Vec<DetectionEvent> {
    raw.iter()
        .filter(|r| config.accepts(r))
        .filter_map(|r| DetectionEvent::from_raw(r, frame))
        .collect()
}

/// 感知线程与其他组件共享的上下文
pub struct PerceptionContext {
    pub status: Arc<StatusStore>,
    pub buffer: Arc<DetectionBuffer>,
    pub relay: Arc<EventRelay>,
    pub hooks: RwLock<HookManager>,
    pub metrics: PerceptionMetrics,
}

impl PerceptionContext {
    pub fn new(
        status: Arc<StatusStore>,
        buffer: Arc<DetectionBuffer>,
        relay: Arc<EventRelay>,
    ) -> Self {
        Self {
            status,
            buffer,
            relay,
            hooks: RwLock::new(HookManager::new()),
            metrics: PerceptionMetrics::new(),
        }
    }

    /// 注册检测回调
    pub fn add_hook(&self, callback: Arc<dyn DetectionCallback>) {
        self.hooks.write().add_callback(callback);
    }
}

/// 带超时的线程 join
///
/// 由旁路线程执行阻塞的 `join()`，主调方在 channel 上限时等待。
/// 超时后旁路线程继续等待目标线程，随进程退出回收。
pub trait JoinTimeout<T> {
    fn join_timeout(self, timeout: Duration) -> Result<T, DriverError>;
}

impl<T: Send + 'static> JoinTimeout<T> for JoinHandle<T> {
    fn join_timeout(self, timeout: Duration) -> Result<T, DriverError> {
        if self.is_finished() {
            return self
                .join()
                .map_err(|_| DriverError::IoThread("worker thread panicked".to_string()));
        }

        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            // 接收方可能已超时离开
            let _ = tx.send(self.join());
        });

        match rx.recv_timeout(timeout) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(DriverError::IoThread("worker thread panicked".to_string())),
            Err(RecvTimeoutError::Timeout) => Err(DriverError::Timeout),
            Err(RecvTimeoutError::Disconnected) => Err(DriverError::IoThread(
                "join watchdog disconnected".to_string(),
            )),
        }
    }
}

/// 感知循环
pub struct PerceptionLoop<S: FrameSource, D: Detector> {
    ctx: Arc<PerceptionContext>,
    config: PerceptionConfig,
    /// 空闲时持有的采集源和检测器；运行时由 worker 线程持有
    resources: Option<(S, D)>,
    worker: Option<JoinHandle<(S, D)>>,
    /// 丢弃即通知 worker 退出
    shutdown_tx: Option<Sender<()>>,
    is_running: Arc<AtomicBool>,
}

impl<S: FrameSource, D: Detector> PerceptionLoop<S, D> {
    pub fn new(source: S, detector: D, ctx: Arc<PerceptionContext>, config: PerceptionConfig) -> Self {
        Self {
            ctx,
            config,
            resources: Some((source, detector)),
            worker: None,
            shutdown_tx: None,
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// 启动 worker 线程
    ///
    /// 已在运行时直接返回 `Ok(())`。
    ///
    /// # 错误
    /// - `ResourcesUnavailable`: 资源已被释放或上次停止超时未归还
    /// - `IoThread`: 线程创建失败
    pub fn start(&mut self) -> Result<(), DriverError> {
        if self.worker.is_some() {
            debug!("Perception loop already running");
            return Ok(());
        }

        let (source, detector) = self.resources.take().ok_or(DriverError::ResourcesUnavailable)?;
        let (shutdown_tx, shutdown_rx) = bounded::<()>(0);
        let ctx = self.ctx.clone();
        let config = self.config.clone();
        let is_running = self.is_running.clone();

        is_running.store(true, Ordering::Release);
        // 先置位，worker 的退出守卫才能可靠地清除它
        self.set_vision_active(true);
        let spawned = thread::Builder::new()
            .name("smartarm-perception".to_string())
            .spawn(move || {
                let _exit = WorkerExitGuard {
                    ctx: ctx.clone(),
                    is_running,
                };
                perception_worker(source, detector, &ctx, &config, &shutdown_rx)
            });

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.is_running.store(false, Ordering::Release);
                self.set_vision_active(false);
                return Err(DriverError::IoThread(e.to_string()));
            },
        };

        self.worker = Some(handle);
        self.shutdown_tx = Some(shutdown_tx);
        info!("Perception loop started");
        Ok(())
    }

    /// 请求停止并等待 worker 退出（幂等）
    ///
    /// # 错误
    /// - `Timeout`: worker 未在 `join_timeout_ms` 内退出，资源不再可用
    /// - `IoThread`: worker panic
    pub fn stop(&mut self) -> Result<(), DriverError> {
        let Some(handle) = self.worker.take() else {
            return Ok(());
        };

        self.is_running.store(false, Ordering::Release);
        drop(self.shutdown_tx.take());

        let result = handle.join_timeout(self.config.join_timeout());
        self.set_vision_active(false);

        match result {
            Ok(resources) => {
                self.resources = Some(resources);
                info!("Perception loop stopped");
                Ok(())
            },
            Err(e) => {
                warn!("Perception worker did not stop cleanly: {}", e);
                Err(e)
            },
        }
    }

    /// 停止并交还采集源和检测器，由调用方释放
    pub fn release(mut self) -> Option<(S, D)> {
        // 错误已在 stop() 中记录
        let _ = self.stop();
        self.resources.take()
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn context(&self) -> &Arc<PerceptionContext> {
        &self.ctx
    }

    pub fn config(&self) -> &PerceptionConfig {
        &self.config
    }

    fn set_vision_active(&self, active: bool) {
        match self.ctx.status.update(StatusPatch::new().vision_active(active)) {
            Ok(_) => self.ctx.relay.notify(RelayKind::Status),
            Err(e) => warn!("Failed to update vision_active: {}", e),
        }
    }
}

impl<S: FrameSource, D: Detector> Drop for PerceptionLoop<S, D> {
    fn drop(&mut self) {
        if self.worker.is_some()
            && let Err(e) = self.stop()
        {
            error!("Perception loop dropped while worker still running: {}", e);
        }
    }
}

/// worker 退出时复位运行标志；panic 退出时同时清除 `vision_active`
struct WorkerExitGuard {
    ctx: Arc<PerceptionContext>,
    is_running: Arc<AtomicBool>,
}

impl Drop for WorkerExitGuard {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::Release);
        if thread::panicking() {
            error!("Perception worker panicked, vision marked inactive");
            if self
                .ctx
                .status
                .update(StatusPatch::new().vision_active(false))
                .is_ok()
            {
                self.ctx.relay.notify(RelayKind::Status);
            }
        }
    }
}

/// 执行推理，检测器 panic 转为 `DriverError::Inference`
fn infer_isolated<D: Detector>(
    detector: &mut D,
    frame: &Frame,
) -> Result<Vec<RawDetection>, DriverError> {
    match panic::catch_unwind(AssertUnwindSafe(|| detector.infer(frame))) {
        Ok(result) => result,
        Err(payload) => {
            let reason = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic payload".to_string());
            Err(DriverError::Inference(format!("detector panicked: {}", reason)))
        },
    }
}

fn shutdown_requested(shutdown: &Receiver<()>) -> bool {
    !matches!(shutdown.try_recv(), Err(TryRecvError::Empty))
}

/// 等待 `timeout`，期间收到停止信号返回 `true`
fn wait_or_shutdown(shutdown: &Receiver<()>, timeout: Duration) -> bool {
    !matches!(shutdown.recv_timeout(timeout), Err(RecvTimeoutError::Timeout))
}

fn perception_worker<S: FrameSource, D: Detector>(
    mut source: S,
    mut detector: D,
    ctx: &PerceptionContext,
    config: &PerceptionConfig,
    shutdown: &Receiver<()>,
) -> (S, D) {
    let cycle_delay = config.cycle_delay();
    let capture_backoff = config.capture_backoff();
    let metrics = &ctx.metrics;

    debug!("Perception worker running");

    loop {
        if shutdown_requested(shutdown) {
            break;
        }

        // === 采集 ===
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                let misses = metrics.capture_misses.fetch_add(1, Ordering::Relaxed) + 1;
                if misses == 1 || misses % 100 == 0 {
                    warn!("No frame available ({} misses so far), backing off", misses);
                }
                if wait_or_shutdown(shutdown, capture_backoff) {
                    break;
                }
                continue;
            },
            Err(e) => {
                let misses = metrics.capture_misses.fetch_add(1, Ordering::Relaxed) + 1;
                if misses == 1 || misses % 100 == 0 {
                    warn!("Frame capture failed ({} misses so far): {}", misses, e);
                }
                if wait_or_shutdown(shutdown, capture_backoff) {
                    break;
                }
                continue;
            },
        };

        // === 推理 ===
        let raw = match infer_isolated(&mut detector, &frame) {
            Ok(raw) => raw,
            Err(e) => {
                let errors = metrics.inference_errors.fetch_add(1, Ordering::Relaxed) + 1;
                if errors == 1 || errors % 100 == 0 {
                    error!("Inference failed ({} errors so far): {}", errors, e);
                }
                if wait_or_shutdown(shutdown, cycle_delay) {
                    break;
                }
                continue;
            },
        };
        metrics.cycles_total.fetch_add(1, Ordering::Relaxed);

        // === 发布 ===
        let detections = filter_detections(&raw, &frame, config);
        let snapshot = ctx.buffer.swap(frame, detections);

        if !snapshot.detections.is_empty() {
            metrics
                .detections_total
                .fetch_add(snapshot.detections.len() as u64, Ordering::Relaxed);
            metrics.detection_cycles.fetch_add(1, Ordering::Relaxed);

            ctx.hooks.read().trigger_all(&snapshot.detections);
            ctx.relay.notify(RelayKind::Detections);
        }

        if wait_or_shutdown(shutdown, cycle_delay) {
            break;
        }
    }

    debug!("Perception worker exiting");
    (source, detector)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(class_id: u32, confidence: f32) -> RawDetection {
        RawDetection {
            class_id,
            class_name: format!("class_{}", class_id),
            confidence,
            bbox: [10.0, 10.0, 50.0, 50.0],
        }
    }

    #[test]
    fn test_default_config() {
        let config = PerceptionConfig::default();
        assert_eq!(config.cycle_delay(), Duration::from_millis(33));
        assert_eq!(config.capture_backoff(), Duration::from_millis(100));
        assert_eq!(config.join_timeout(), Duration::from_secs(2));
        assert_eq!(config.target_classes, DEFAULT_TARGET_CLASSES.to_vec());
    }

    #[test]
    fn test_accepts_threshold_inclusive() {
        let config = PerceptionConfig::default();
        assert!(config.accepts(&raw(39, 0.5)));
        assert!(!config.accepts(&raw(39, 0.49)));
    }

    #[test]
    fn test_accepts_target_classes() {
        let mut config = PerceptionConfig::default();
        assert!(!config.accepts(&raw(2, 0.9)));

        config.target_classes.clear();
        assert!(config.accepts(&raw(2, 0.9)));
    }

    #[test]
    fn test_filter_detections_keeps_order() {
        let frame = Frame::blank(100, 100);
        let mut degenerate = raw(41, 0.9);
        degenerate.bbox = [30.0, 30.0, 20.0, 40.0];

        let detections = filter_detections(
            &[raw(47, 0.9), raw(39, 0.1), degenerate, raw(0, 0.6)],
            &frame,
            &PerceptionConfig::default(),
        );
        let classes: Vec<u32> = detections.iter().map(|d| d.class_id).collect();
        assert_eq!(classes, vec![47, 0]);
    }

    #[test]
    fn test_config_serde_defaults() {
        let config: PerceptionConfig = serde_json::from_str(r#"{"cycle_delay_ms": 10}"#).unwrap();
        assert_eq!(config.cycle_delay_ms, 10);
        assert_eq!(config.join_timeout_ms, 2000);
    }
}
