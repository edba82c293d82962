//! 感知链路指标
//!
//! 原子计数器，可以在任何线程读取，不引入锁竞争。

use std::sync::atomic::{AtomicU64, Ordering};

/// 感知线程实时指标
#[derive(Debug, Default)]
pub struct PerceptionMetrics {
    /// 成功采集并完成推理的周期数
    pub cycles_total: AtomicU64,

    /// 采集失败或无帧的次数
    pub capture_misses: AtomicU64,

    /// 推理失败次数
    pub inference_errors: AtomicU64,

    /// 过滤后发布的检测总数
    pub detections_total: AtomicU64,

    /// 非空检测周期数（触发回调和通知）
    pub detection_cycles: AtomicU64,
}

impl PerceptionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取指标快照
    ///
    /// 不同计数器之间可能有微小的时间差。
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            cycles_total: self.cycles_total.load(Ordering::Relaxed),
            capture_misses: self.capture_misses.load(Ordering::Relaxed),
            inference_errors: self.inference_errors.load(Ordering::Relaxed),
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detection_cycles: self.detection_cycles.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        self.cycles_total.store(0, Ordering::Relaxed);
        self.capture_misses.store(0, Ordering::Relaxed);
        self.inference_errors.store(0, Ordering::Relaxed);
        self.detections_total.store(0, Ordering::Relaxed);
        self.detection_cycles.store(0, Ordering::Relaxed);
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub cycles_total: u64,
    pub capture_misses: u64,
    pub inference_errors: u64,
    pub detections_total: u64,
    pub detection_cycles: u64,
}

impl MetricsSnapshot {
    /// 非空检测周期占比（百分比），无周期时为 0.0
    pub fn detection_rate(&self) -> f64 {
        if self.cycles_total == 0 {
            return 0.0;
        }
        (self.detection_cycles as f64 / self.cycles_total as f64) * 100.0
    }
}
