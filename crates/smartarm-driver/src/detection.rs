//! 检测结果类型与最新一帧缓冲区
//!
//! [`DetectionBuffer`] 只保存"最新一帧 + 该帧的检测列表"，两者作为一个
//! 不可变快照整体替换。读者拿到的永远是同一帧的图像和检测结果，
//! 不会出现新帧配旧检测的撕裂状态。

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// 画面中心（相对坐标）
pub const FRAME_CENTER: (f64, f64) = (0.5, 0.5);

/// 当前 UNIX 时间（微秒）
pub fn unix_micros() -> u64 {
    chrono::Utc::now().timestamp_micros().max(0) as u64
}

/// 采集到的一帧图像
///
/// `data` 使用 `Bytes`，克隆只增加引用计数。
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
    /// 采集时间戳（UNIX 微秒）
    pub timestamp_us: u64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self {
            width,
            height,
            data: data.into(),
            timestamp_us: unix_micros(),
        }
    }

    /// 全零的 RGB 帧
    pub fn blank(width: u32, height: u32) -> Self {
        let len = width as usize * height as usize * 3;
        Self::new(width, height, vec![0u8; len])
    }
}

/// 检测器原始输出（像素坐标，未过滤）
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    /// `[x1, y1, x2, y2]`
    pub bbox: [f32; 4],
}

/// 像素坐标的检测框
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    /// 宽或高不为正的框视为退化框
    pub fn is_degenerate(&self) -> bool {
        self.x2 <= self.x1 || self.y2 <= self.y1
    }

    pub fn center(&self) -> [i32; 2] {
        [(self.x1 + self.x2) / 2, (self.y1 + self.y2) / 2]
    }

    pub fn size(&self) -> [i32; 2] {
        [self.x2 - self.x1, self.y2 - self.y1]
    }
}

/// 单个检测结果
///
/// 创建后不可变；`relative_position` 为检测框中心相对画面尺寸的比例。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionEvent {
    pub class_id: u32,
    pub class_name: String,
    pub confidence: f32,
    pub bbox: BoundingBox,
    pub center: [i32; 2],
    pub relative_position: [f64; 2],
    pub size: [i32; 2],
    /// 所属帧的采集时间戳（UNIX 微秒）
    pub timestamp_us: u64,
}

impl DetectionEvent {
    /// 从原始检测构造
    ///
    /// 退化框或画面尺寸为 0 时返回 `None`。
    pub fn from_raw(raw: &RawDetection, frame: &Frame) -> Option<Self> {
        if frame.width == 0 || frame.height == 0 {
            return None;
        }

        let [x1, y1, x2, y2] = raw.bbox;
        let bbox = BoundingBox {
            x1: x1 as i32,
            y1: y1 as i32,
            x2: x2 as i32,
            y2: y2 as i32,
        };
        if bbox.is_degenerate() {
            return None;
        }

        let center = bbox.center();
        Some(Self {
            class_id: raw.class_id,
            class_name: raw.class_name.clone(),
            confidence: raw.confidence,
            bbox,
            center,
            relative_position: [
                center[0] as f64 / frame.width as f64,
                center[1] as f64 / frame.height as f64,
            ],
            size: bbox.size(),
            timestamp_us: frame.timestamp_us,
        })
    }

    /// 到目标点（相对坐标）的欧氏距离
    pub fn distance_to(&self, target: (f64, f64)) -> f64 {
        let dx = self.relative_position[0] - target.0;
        let dy = self.relative_position[1] - target.1;
        dx.hypot(dy)
    }
}

/// 选出距离目标点最近的检测
///
/// 距离相同时保留先出现的一个；列表为空时返回 `None`。
pub fn closest_to(detections: &[DetectionEvent], target: (f64, f64)) -> Option<&DetectionEvent> {
    let mut best = None;
    let mut min_distance = f64::INFINITY;
    for detection in detections {
        let distance = detection.distance_to(target);
        if distance < min_distance {
            min_distance = distance;
            best = Some(detection);
        }
    }
    best
}

/// 一帧图像及其检测结果（不可变快照）
#[derive(Debug, Clone)]
pub struct FrameSnapshot {
    /// 发布序号（从 1 开始单调递增）
    pub sequence: u64,
    pub frame: Frame,
    pub detections: Vec<DetectionEvent>,
}

/// 最新一帧缓冲区
///
/// 单写者（感知线程）、多读者。读取是 wait-free 的 `ArcSwap::load`。
#[derive(Debug)]
pub struct DetectionBuffer {
    latest: ArcSwapOption<FrameSnapshot>,
    sequence: AtomicU64,
}

impl DetectionBuffer {
    pub fn new() -> Self {
        Self {
            latest: ArcSwapOption::empty(),
            sequence: AtomicU64::new(0),
        }
    }

    /// 原子替换为新的 (帧, 检测列表)
    ///
    /// 返回刚发布的快照，供调用方继续派发。
    pub fn swap(&self, frame: Frame, detections: Vec<DetectionEvent>) -> Arc<FrameSnapshot> {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let snapshot = Arc::new(FrameSnapshot {
            sequence,
            frame,
            detections,
        });
        self.latest.store(Some(snapshot.clone()));
        snapshot
    }

    /// 读取最新快照，尚无数据时返回 `None`
    pub fn read(&self) -> Option<Arc<FrameSnapshot>> {
        self.latest.load_full()
    }

    /// 最新检测列表的副本（无数据时为空）
    pub fn detections(&self) -> Vec<DetectionEvent> {
        self.latest
            .load()
            .as_ref()
            .map(|snapshot| snapshot.detections.clone())
            .unwrap_or_default()
    }

    /// 最新检测中距离目标点最近的一个
    pub fn closest(&self, target: (f64, f64)) -> Option<DetectionEvent> {
        let guard = self.latest.load();
        let snapshot = guard.as_ref()?;
        closest_to(&snapshot.detections, target).cloned()
    }

    /// 最新检测中距离画面中心最近的一个
    pub fn closest_to_center(&self) -> Option<DetectionEvent> {
        self.closest(FRAME_CENTER)
    }
}

impl Default for DetectionBuffer {
    fn default() -> Self {
        Self::new()
    }
}
