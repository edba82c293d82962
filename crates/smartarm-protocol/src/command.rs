//! 下行控制指令
//!
//! 控制器只认固定的空格分隔文本语法：
//!
//! | 指令 | 文本 |
//! |---|---|
//! | 切换模式 | `MODE AUTO` / `MODE MANUAL` |
//! | 单舵机 | `SERVO <id> <angle>` |
//! | 电机 | `MOTOR <speed>` |
//! | 急停 | `STOP` |
//! | 回零 | `HOME` |
//!
//! 协议没有应答帧，发布成功即视为送达。

use crate::ProtocolError;
use crate::constants::{SERVO_COUNT, is_valid_motor_speed, is_valid_servo_angle};
use crate::status::Mode;
use std::fmt;
use std::str::FromStr;

/// 控制指令
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// 切换运行模式
    SetMode(Mode),
    /// 设置单个舵机角度
    Servo { id: u8, angle: i32 },
    /// 设置电机速度
    Motor { speed: i32 },
    /// 急停（舵机断电 + 电机停转）
    Stop,
    /// 回到中位
    Home,
}

impl ControlCommand {
    /// 构造舵机指令（校验 ID 与角度）
    pub fn servo(id: u8, angle: i32) -> Result<Self, ProtocolError> {
        if usize::from(id) >= SERVO_COUNT {
            return Err(ProtocolError::InvalidValue {
                field: "servo_id",
                value: id.to_string(),
            });
        }
        if !is_valid_servo_angle(angle) {
            return Err(ProtocolError::InvalidValue {
                field: "angle",
                value: angle.to_string(),
            });
        }
        Ok(ControlCommand::Servo { id, angle })
    }

    /// 构造电机指令（校验速度范围）
    pub fn motor(speed: i32) -> Result<Self, ProtocolError> {
        if !is_valid_motor_speed(speed) {
            return Err(ProtocolError::InvalidValue {
                field: "speed",
                value: speed.to_string(),
            });
        }
        Ok(ControlCommand::Motor { speed })
    }

    /// 是否为手动执行类指令（仅在 Manual 模式下允许下发）
    pub fn requires_manual(&self) -> bool {
        matches!(self, ControlCommand::Servo { .. } | ControlCommand::Motor { .. })
    }

    /// 编码为线上文本
    pub fn encode(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ControlCommand::SetMode(mode) => write!(f, "MODE {}", mode.as_wire()),
            ControlCommand::Servo { id, angle } => write!(f, "SERVO {} {}", id, angle),
            ControlCommand::Motor { speed } => write!(f, "MOTOR {}", speed),
            ControlCommand::Stop => write!(f, "STOP"),
            ControlCommand::Home => write!(f, "HOME"),
        }
    }
}

fn next_int<'a, T: FromStr>(
    parts: &mut impl Iterator<Item = &'a str>,
    field: &'static str,
) -> Result<T, ProtocolError> {
    let raw = parts
        .next()
        .ok_or_else(|| ProtocolError::MalformedCommand(format!("missing {}", field)))?;
    raw.parse().map_err(|_| ProtocolError::InvalidValue {
        field,
        value: raw.to_string(),
    })
}

impl FromStr for ControlCommand {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace();
        let keyword = parts
            .next()
            .ok_or_else(|| ProtocolError::MalformedCommand("empty command".to_string()))?;

        let command = match keyword {
            "MODE" => {
                let raw = parts
                    .next()
                    .ok_or_else(|| ProtocolError::MalformedCommand("missing mode".to_string()))?;
                ControlCommand::SetMode(raw.parse()?)
            },
            "SERVO" => {
                let id = next_int(&mut parts, "servo_id")?;
                let angle = next_int(&mut parts, "angle")?;
                ControlCommand::servo(id, angle)?
            },
            "MOTOR" => ControlCommand::motor(next_int(&mut parts, "speed")?)?,
            "STOP" => ControlCommand::Stop,
            "HOME" => ControlCommand::Home,
            other => return Err(ProtocolError::UnknownCommand(other.to_string())),
        };

        if let Some(extra) = parts.next() {
            return Err(ProtocolError::MalformedCommand(format!(
                "unexpected trailing token '{}'",
                extra
            )));
        }

        Ok(command)
    }
}
