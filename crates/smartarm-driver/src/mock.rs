//! 合成采集源与脚本化检测器
//!
//! 在没有摄像头和模型的环境下驱动完整的感知链路（联调、演示、测试）。

use crate::detection::{Frame, RawDetection};
use crate::error::DriverError;
use crate::perception::{Detector, FrameSource};

/// 测试图案采集源
///
/// 每帧填充一个随帧号递增的灰度值。
#[derive(Debug, Clone)]
pub struct TestPatternSource {
    width: u32,
    height: u32,
    frames: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: 0,
        }
    }

    /// 已产生的帧数
    pub fn frames_emitted(&self) -> u64 {
        self.frames
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, DriverError> {
        let shade = (self.frames % 256) as u8;
        let len = self.width as usize * self.height as usize * 3;
        self.frames += 1;
        Ok(Some(Frame::new(self.width, self.height, vec![shade; len])))
    }
}

/// 脚本化检测器
///
/// 按顺序循环返回预设的检测列表。
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetector {
    script: Vec<Vec<RawDetection>>,
    cursor: usize,
}

impl ScriptedDetector {
    pub fn new(script: Vec<Vec<RawDetection>>) -> Self {
        Self { script, cursor: 0 }
    }

    /// 永远返回空列表
    pub fn empty() -> Self {
        Self::default()
    }

    /// 一个水平往返移动的 bottle（class 39），共 `steps` 个位置
    pub fn sweeping(width: u32, height: u32, steps: usize) -> Self {
        let steps = steps.max(2);
        let box_w = width as f32 / 8.0;
        let box_h = height as f32 / 4.0;
        let top = (height as f32 - box_h) / 2.0;
        let travel = width as f32 - box_w;

        let script = (0..steps)
            .map(|i| {
                let left = travel * i as f32 / (steps - 1) as f32;
                vec![RawDetection {
                    class_id: 39,
                    class_name: "bottle".to_string(),
                    confidence: 0.8,
                    bbox: [left, top, left + box_w, top + box_h],
                }]
            })
            .collect();
        Self::new(script)
    }
}

impl Detector for ScriptedDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, DriverError> {
        if self.script.is_empty() {
            return Ok(Vec::new());
        }
        let detections = self.script[self.cursor].clone();
        self.cursor = (self.cursor + 1) % self.script.len();
        Ok(detections)
    }
}
