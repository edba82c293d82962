//! 协议常量定义
//!
//! 与控制器固件（`config.h`）保持一致。

use std::ops::RangeInclusive;

/// 控制器状态上报主题（控制器 → Hub）
pub const TOPIC_STATUS: &str = "smartarm/status";

/// 控制指令主题（Hub → 控制器）
pub const TOPIC_CONTROL: &str = "smartarm/control";

/// 舵机数量：底座、肩、肘、腕、夹爪
pub const SERVO_COUNT: usize = 5;

/// 舵机默认角度（中位）
pub const DEFAULT_SERVO_ANGLE: i32 = 90;

/// 舵机合法角度范围（度）
pub const SERVO_ANGLE_RANGE: RangeInclusive<i32> = 0..=180;

/// 电机速度合法范围（控制器会钳位到此区间）
pub const MOTOR_SPEED_RANGE: RangeInclusive<i32> = -100..=100;

/// 舵机回零位姿
pub const HOME_SERVO_ANGLES: [i32; SERVO_COUNT] = [DEFAULT_SERVO_ANGLE; SERVO_COUNT];

/// 检查舵机角度是否合法
#[inline]
pub fn is_valid_servo_angle(angle: i32) -> bool {
    SERVO_ANGLE_RANGE.contains(&angle)
}

/// 检查电机速度是否合法
#[inline]
pub fn is_valid_motor_speed(speed: i32) -> bool {
    MOTOR_SPEED_RANGE.contains(&speed)
}
