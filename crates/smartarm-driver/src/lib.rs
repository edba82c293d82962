//! # SmartArm Driver
//!
//! 机械臂 Hub 的共享状态与感知层
//!
//! ## 模块
//!
//! - `state`: 系统状态 [`SystemStatus`] 与单写多读的 [`StatusStore`]
//! - `detection`: 检测结果类型与最新一帧的 [`DetectionBuffer`]
//! - `perception`: 后台感知线程 [`PerceptionLoop`]（采集 → 推理 → 发布）
//! - `relay`: 跨线程到异步上下文的合并通知 [`EventRelay`]
//! - `hooks`: 检测回调 [`DetectionCallback`] 与 [`HookManager`]
//! - `recording`: CSV 操作记录
//! - `metrics`: 原子计数器
//!
//! ## 线程模型
//!
//! ```text
//! perception 线程 ──swap──▶ DetectionBuffer ◀──read── 任意线程
//!        │
//!        ├──hooks──▶ StatusStore ◀──update── MQTT 事件线程
//!        │
//!        └──notify──▶ EventRelay ──next().await──▶ 异步广播任务
//! ```

pub mod detection;
pub mod error;
pub mod hooks;
pub mod metrics;
#[cfg(feature = "mock")]
pub mod mock;
pub mod perception;
pub mod recording;
pub mod relay;
pub mod state;

pub use detection::{
    BoundingBox, DetectionBuffer, DetectionEvent, Frame, FrameSnapshot, RawDetection, closest_to,
};
pub use error::DriverError;
pub use hooks::{DetectionCallback, HookManager, LastDetectionHook};
pub use metrics::{MetricsSnapshot, PerceptionMetrics};
pub use perception::{
    Detector, FrameSource, JoinTimeout, PerceptionConfig, PerceptionContext, PerceptionLoop,
};
pub use recording::{CsvRecorder, OperationRecord, OperationRecorder, RecordingHook};
pub use relay::{EventRelay, RelayBatch, RelayKind};
pub use state::{StatusPatch, StatusStore, SystemStatus};
