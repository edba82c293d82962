//! 控制器状态负载与运行模式
//!
//! 控制器每秒向 [`TOPIC_STATUS`](crate::TOPIC_STATUS) 发布一次 JSON：
//!
//! ```text
//! {"mode":"AUTO","distance":12.5,"servos":[90,90,90,90,90],"motor_speed":0}
//! ```
//!
//! 只有 `servos`、`distance`、`motor_speed` 三个字段会被采纳；
//! 缺失的字段保持原值，未知字段（包括控制器上报的 `mode`）直接忽略。

use crate::ProtocolError;
use crate::constants::{SERVO_COUNT, is_valid_servo_angle};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 系统运行模式
///
/// - `Auto`: 视觉驱动的自主控制，手动执行指令会被拒绝
/// - `Manual`: 操作员手动控制
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Manual,
}

impl Mode {
    /// 线上指令中的大写形式（`MODE AUTO`）
    pub fn as_wire(self) -> &'static str {
        match self {
            Mode::Auto => "AUTO",
            Mode::Manual => "MANUAL",
        }
    }

    pub fn is_manual(self) -> bool {
        self == Mode::Manual
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Auto => write!(f, "auto"),
            Mode::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for Mode {
    type Err = ProtocolError;

    /// 大小写不敏感：`auto`/`AUTO`/`manual`/`MANUAL`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("auto") {
            Ok(Mode::Auto)
        } else if s.eq_ignore_ascii_case("manual") {
            Ok(Mode::Manual)
        } else {
            Err(ProtocolError::InvalidValue {
                field: "mode",
                value: s.to_string(),
            })
        }
    }
}

/// 控制器状态负载（部分更新）
///
/// 所有字段均为可选，`None` 表示本次上报未携带该字段。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ControllerStatus {
    /// 舵机角度（必须恰好 5 个）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servos: Option<[i32; SERVO_COUNT]>,

    /// 超声波测距（cm）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<f64>,

    /// 电机速度（有符号）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub motor_speed: Option<i32>,
}

impl ControllerStatus {
    /// 从原始负载解码并校验
    ///
    /// # 错误
    /// - `NotUtf8`: 负载不是 UTF-8
    /// - `Decode`: JSON 格式错误、字段类型错误、`servos` 长度不是 5
    /// - `InvalidValue`: 舵机角度越界或距离为负/非有限值
    pub fn decode(payload: &[u8]) -> Result<Self, ProtocolError> {
        let text = std::str::from_utf8(payload).map_err(|_| ProtocolError::NotUtf8)?;
        let status: ControllerStatus = serde_json::from_str(text)?;
        status.validate()?;
        Ok(status)
    }

    /// 校验字段取值范围
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Some(servos) = &self.servos
            && let Some(bad) = servos.iter().find(|&&a| !is_valid_servo_angle(a))
        {
            return Err(ProtocolError::InvalidValue {
                field: "servos",
                value: bad.to_string(),
            });
        }

        if let Some(distance) = self.distance
            && (!distance.is_finite() || distance < 0.0)
        {
            return Err(ProtocolError::InvalidValue {
                field: "distance",
                value: distance.to_string(),
            });
        }

        Ok(())
    }

    /// 是否未携带任何可采纳字段
    pub fn is_empty(&self) -> bool {
        self.servos.is_none() && self.distance.is_none() && self.motor_speed.is_none()
    }
}
