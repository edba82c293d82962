//! 检测回调（Hook System）
//!
//! 感知线程在每个非空检测周期调用已注册的回调。回调在感知线程上同步执行，
//! 必须快速返回：耗时工作应通过 Channel 交给其他线程（见 [`crate::recording`]）。
//!
//! # 使用示例
//!
//! ```rust
//! use smartarm_driver::hooks::{DetectionCallback, HookManager};
//! use smartarm_driver::DetectionEvent;
//! use std::sync::Arc;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct Counter(AtomicUsize);
//!
//! impl DetectionCallback for Counter {
//!     fn on_detections(&self, detections: &[DetectionEvent]) {
//!         self.0.fetch_add(detections.len(), Ordering::Relaxed);
//!     }
//! }
//!
//! let mut hooks = HookManager::new();
//! hooks.add_callback(Arc::new(Counter(AtomicUsize::new(0))));
//! hooks.trigger_all(&[]);
//! ```

use crate::detection::{DetectionEvent, FRAME_CENTER, closest_to};
use crate::relay::{EventRelay, RelayKind};
use crate::state::{StatusPatch, StatusStore};
use std::sync::Arc;
use tracing::warn;

/// 检测回调 Trait
///
/// # 性能要求
///
/// - **非阻塞**: 禁止 I/O 和长时间持锁
/// - **Channel 模式**: 推荐使用 `crossbeam_channel::Sender::try_send` 异步处理
pub trait DetectionCallback: Send + Sync {
    /// 非空检测列表发布后调用
    fn on_detections(&self, detections: &[DetectionEvent]);
}

/// 钩子管理器
///
/// 由 `PerceptionContext` 以 `RwLock<HookManager>` 持有：注册时写锁，触发时读锁。
#[derive(Default)]
pub struct HookManager {
    callbacks: Vec<Arc<dyn DetectionCallback>>,
}

impl HookManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_callback(&mut self, callback: Arc<dyn DetectionCallback>) {
        self.callbacks.push(callback);
    }

    /// 按注册顺序触发所有回调
    pub fn trigger_all(&self, detections: &[DetectionEvent]) {
        for callback in self.callbacks.iter() {
            callback.on_detections(detections);
        }
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn clear(&mut self) {
        self.callbacks.clear();
    }
}

impl std::fmt::Debug for HookManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookManager")
            .field("callbacks_count", &self.callbacks.len())
            .finish()
    }
}

/// 将最靠近画面中心的检测写入 `SystemStatus.last_detection`
///
/// 写入成功后发出 `RelayKind::Status` 通知。
pub struct LastDetectionHook {
    status: Arc<StatusStore>,
    relay: Arc<EventRelay>,
}

impl LastDetectionHook {
    pub fn new(status: Arc<StatusStore>, relay: Arc<EventRelay>) -> Self {
        Self { status, relay }
    }
}

impl DetectionCallback for LastDetectionHook {
    fn on_detections(&self, detections: &[DetectionEvent]) {
        let Some(closest) = closest_to(detections, FRAME_CENTER) else {
            return;
        };
        match self
            .status
            .update(StatusPatch::new().last_detection(Some(closest.clone())))
        {
            Ok(_) => self.relay.notify(RelayKind::Status),
            Err(e) => warn!("Failed to record last detection: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingCallback {
        calls: AtomicUsize,
        seen: AtomicUsize,
    }

    impl DetectionCallback for CountingCallback {
        fn on_detections(&self, detections: &[DetectionEvent]) {
            self.calls.fetch_add(1, Ordering::Relaxed);
            self.seen.fetch_add(detections.len(), Ordering::Relaxed);
        }
    }

    fn detection(x: f64, y: f64) -> DetectionEvent {
        DetectionEvent {
            class_id: 47,
            class_name: "apple".to_string(),
            confidence: 0.7,
            bbox: BoundingBox {
                x1: 1,
                y1: 1,
                x2: 2,
                y2: 2,
            },
            center: [1, 1],
            relative_position: [x, y],
            size: [1, 1],
            timestamp_us: 42,
        }
    }

    #[test]
    fn test_trigger_all_calls_every_callback() {
        let first = Arc::new(CountingCallback {
            calls: AtomicUsize::new(0),
            seen: AtomicUsize::new(0),
        });
        let second = Arc::new(CountingCallback {
            calls: AtomicUsize::new(0),
            seen: AtomicUsize::new(0),
        });

        let mut hooks = HookManager::new();
        hooks.add_callback(first.clone());
        hooks.add_callback(second.clone());
        assert_eq!(hooks.len(), 2);

        hooks.trigger_all(&[detection(0.5, 0.5), detection(0.1, 0.1)]);
        assert_eq!(first.calls.load(Ordering::Relaxed), 1);
        assert_eq!(second.seen.load(Ordering::Relaxed), 2);

        hooks.clear();
        assert!(hooks.is_empty());
    }

    #[test]
    fn test_last_detection_hook_picks_closest() {
        let status = Arc::new(StatusStore::new());
        let relay = Arc::new(EventRelay::new());
        let hook = LastDetectionHook::new(status.clone(), relay.clone());

        hook.on_detections(&[detection(0.9, 0.9), detection(0.4, 0.6)]);

        let last = status.read().last_detection.unwrap();
        assert_eq!(last.relative_position, [0.4, 0.6]);
        assert!(relay.try_take().unwrap().status);
    }

    #[test]
    fn test_last_detection_hook_ignores_empty() {
        let status = Arc::new(StatusStore::new());
        let relay = Arc::new(EventRelay::new());
        LastDetectionHook::new(status.clone(), relay.clone()).on_detections(&[]);
        assert!(status.read().last_detection.is_none());
        assert!(relay.try_take().is_none());
    }
}
