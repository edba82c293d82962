//! 系统状态与状态存储
//!
//! [`StatusStore`] 是整个 Hub 的唯一状态源：
//!
//! - **读**: `ArcSwap::load`，wait-free，永远看到某次完整提交后的状态
//! - **写**: 读-改-写在一把 `parking_lot::Mutex` 内完成，并发写入互不覆盖
//!
//! 写入以 [`StatusPatch`]（部分更新）的形式提交，未携带的字段保持原值。

use crate::detection::DetectionEvent;
use crate::error::DriverError;
use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use smartarm_protocol::{ControllerStatus, DEFAULT_SERVO_ANGLE, Mode, SERVO_COUNT};
use smartarm_protocol::constants::is_valid_servo_angle;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// 系统状态（对外广播的完整视图）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemStatus {
    pub mode: Mode,
    pub vision_active: bool,
    pub controller_connected: bool,
    pub last_detection: Option<DetectionEvent>,
    pub servo_angles: [i32; SERVO_COUNT],
    pub distance_cm: f64,
    pub motor_speed: i32,
    pub grab_count: u64,
    /// 最近一次错误描述，空字符串表示无错误
    pub error_message: String,
}

impl Default for SystemStatus {
    fn default() -> Self {
        Self {
            mode: Mode::Auto,
            vision_active: false,
            controller_connected: false,
            last_detection: None,
            servo_angles: [DEFAULT_SERVO_ANGLE; SERVO_COUNT],
            distance_cm: 0.0,
            motor_speed: 0,
            grab_count: 0,
            error_message: String::new(),
        }
    }
}

/// 状态部分更新
///
/// `None` 表示不修改该字段。反序列化时未知字段被忽略。
/// `last_detection` 使用两层 `Option`：外层表示"是否修改"，内层允许清空。
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct StatusPatch {
    pub mode: Option<Mode>,
    pub vision_active: Option<bool>,
    pub controller_connected: Option<bool>,
    #[serde(skip)]
    pub last_detection: Option<Option<DetectionEvent>>,
    pub servo_angles: Option<[i32; SERVO_COUNT]>,
    pub distance_cm: Option<f64>,
    pub motor_speed: Option<i32>,
    pub grab_count: Option<u64>,
    pub error_message: Option<String>,
}

impl StatusPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    pub fn vision_active(mut self, active: bool) -> Self {
        self.vision_active = Some(active);
        self
    }

    pub fn controller_connected(mut self, connected: bool) -> Self {
        self.controller_connected = Some(connected);
        self
    }

    pub fn last_detection(mut self, detection: Option<DetectionEvent>) -> Self {
        self.last_detection = Some(detection);
        self
    }

    pub fn servo_angles(mut self, angles: [i32; SERVO_COUNT]) -> Self {
        self.servo_angles = Some(angles);
        self
    }

    pub fn distance_cm(mut self, distance: f64) -> Self {
        self.distance_cm = Some(distance);
        self
    }

    pub fn motor_speed(mut self, speed: i32) -> Self {
        self.motor_speed = Some(speed);
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self
    }

    /// 是否不修改任何字段
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }

    /// 校验取值范围，返回第一个不合法字段的描述
    pub fn validate(&self) -> Result<(), String> {
        if let Some(angles) = &self.servo_angles
            && let Some(bad) = angles.iter().find(|&&a| !is_valid_servo_angle(a))
        {
            return Err(format!("servo angle {} out of range 0..=180", bad));
        }
        if let Some(distance) = self.distance_cm
            && (!distance.is_finite() || distance < 0.0)
        {
            return Err(format!("invalid distance {}", distance));
        }
        Ok(())
    }

    fn apply_to(self, status: &mut SystemStatus) {
        if let Some(mode) = self.mode {
            status.mode = mode;
        }
        if let Some(active) = self.vision_active {
            status.vision_active = active;
        }
        if let Some(connected) = self.controller_connected {
            status.controller_connected = connected;
        }
        if let Some(detection) = self.last_detection {
            status.last_detection = detection;
        }
        if let Some(angles) = self.servo_angles {
            status.servo_angles = angles;
        }
        if let Some(distance) = self.distance_cm {
            status.distance_cm = distance;
        }
        if let Some(speed) = self.motor_speed {
            status.motor_speed = speed;
        }
        if let Some(count) = self.grab_count {
            status.grab_count = count;
        }
        if let Some(message) = self.error_message {
            status.error_message = message;
        }
    }
}

/// 控制器上报只映射 servos/distance/motor_speed 三个字段
impl From<ControllerStatus> for StatusPatch {
    fn from(report: ControllerStatus) -> Self {
        Self {
            servo_angles: report.servos,
            distance_cm: report.distance,
            motor_speed: report.motor_speed,
            ..Self::default()
        }
    }
}

/// 状态存储
///
/// 多个写者（MQTT 事件线程、感知线程、控制指令调用方）并发提交部分更新，
/// 任意数量的读者随时读取一致快照。
#[derive(Debug)]
pub struct StatusStore {
    current: ArcSwap<SystemStatus>,
    write_lock: Mutex<()>,
    updates: AtomicU64,
    rejected: AtomicU64,
}

impl StatusStore {
    pub fn new() -> Self {
        Self::with_initial(SystemStatus::default())
    }

    pub fn with_initial(status: SystemStatus) -> Self {
        Self {
            current: ArcSwap::from_pointee(status),
            write_lock: Mutex::new(()),
            updates: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    /// 读取当前状态的副本
    pub fn read(&self) -> SystemStatus {
        SystemStatus::clone(&self.current.load())
    }

    /// 读取当前状态快照（不复制）
    ///
    /// # 性能
    /// 只增加一次引用计数，适合高频读取。
    pub fn snapshot(&self) -> Arc<SystemStatus> {
        self.current.load_full()
    }

    /// 当前运行模式
    pub fn mode(&self) -> Mode {
        self.current.load().mode
    }

    /// 提交部分更新
    ///
    /// # 错误
    /// - `InvalidInput`: 字段越界。更新被整体丢弃，但 `error_message` 会记录原因
    pub fn update(&self, patch: StatusPatch) -> Result<Arc<SystemStatus>, DriverError> {
        if let Err(reason) = patch.validate() {
            self.reject(&reason);
            return Err(DriverError::InvalidInput(reason));
        }
        Ok(self.commit(|status| patch.apply_to(status)))
    }

    /// 从 JSON 对象提交部分更新（未知字段忽略）
    ///
    /// # 错误
    /// - `InvalidInput`: 不是合法的 JSON 对象，或字段越界
    pub fn update_json(&self, json: &str) -> Result<Arc<SystemStatus>, DriverError> {
        match serde_json::from_str::<StatusPatch>(json) {
            Ok(patch) => self.update(patch),
            Err(e) => {
                let reason = format!("malformed status update: {}", e);
                self.reject(&reason);
                Err(DriverError::InvalidInput(reason))
            },
        }
    }

    /// 记录错误描述（不影响其他字段）
    pub fn report_error(&self, message: impl Into<String>) {
        let message = message.into();
        self.commit(|status| status.error_message = message);
    }

    /// 已提交的更新次数
    pub fn update_count(&self) -> u64 {
        self.updates.load(Ordering::Relaxed)
    }

    /// 被拒绝的更新次数
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn reject(&self, reason: &str) {
        let rejected = self.rejected.fetch_add(1, Ordering::Relaxed) + 1;
        if rejected == 1 || rejected % 100 == 0 {
            warn!("Status update rejected ({} total): {}", rejected, reason);
        }
        self.report_error(reason);
    }

    fn commit<F>(&self, mutate: F) -> Arc<SystemStatus>
    where
        F: FnOnce(&mut SystemStatus),
    {
        let _guard = self.write_lock.lock();
        let mut next = SystemStatus::clone(&self.current.load());
        mutate(&mut next);
        let next = Arc::new(next);
        self.current.store(next.clone());
        let count = self.updates.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Status committed (update #{})", count);
        next
    }
}

impl Default for StatusStore {
    fn default() -> Self {
        Self::new()
    }
}
