//! 感知线程集成测试
//!
//! 使用 Mock 采集源和检测器，验证启动/停止语义、发布顺序与错误恢复。

use smartarm_driver::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// 可配置失败模式的 Mock 采集源
struct MockSource {
    frames: u64,
    /// 前 N 次采集返回错误
    fail_first: u64,
}

impl MockSource {
    fn new() -> Self {
        Self {
            frames: 0,
            fail_first: 0,
        }
    }
}

impl FrameSource for MockSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, DriverError> {
        self.frames += 1;
        if self.frames <= self.fail_first {
            return Err(DriverError::Capture("camera unplugged".to_string()));
        }
        Ok(Some(Frame::blank(640, 480)))
    }
}

/// 返回固定检测的 Mock 检测器，可让奇数次推理失败
struct MockDetector {
    output: Vec<RawDetection>,
    fail_odd: bool,
    calls: u64,
}

impl MockDetector {
    fn with_output(output: Vec<RawDetection>) -> Self {
        Self {
            output,
            fail_odd: false,
            calls: 0,
        }
    }
}

impl Detector for MockDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, DriverError> {
        self.calls += 1;
        if self.fail_odd && self.calls % 2 == 1 {
            return Err(DriverError::Inference("tensor shape mismatch".to_string()));
        }
        Ok(self.output.clone())
    }
}

/// 第一次推理 panic，之后正常返回
struct PanicOnceDetector {
    output: Vec<RawDetection>,
    panicked: bool,
}

impl Detector for PanicOnceDetector {
    fn infer(&mut self, _frame: &Frame) -> Result<Vec<RawDetection>, DriverError> {
        if !self.panicked {
            self.panicked = true;
            panic!("model runtime aborted");
        }
        Ok(self.output.clone())
    }
}

/// 每次采集都 panic 的采集源
struct PanickingSource;

impl FrameSource for PanickingSource {
    fn next_frame(&mut self) -> Result<Option<Frame>, DriverError> {
        panic!("camera driver crashed");
    }
}

#[derive(Default)]
struct CountingHook {
    calls: AtomicUsize,
}

impl DetectionCallback for CountingHook {
    fn on_detections(&self, detections: &[DetectionEvent]) {
        assert!(!detections.is_empty());
        self.calls.fetch_add(1, Ordering::Relaxed);
    }
}

fn bottle(x1: f32, x2: f32) -> RawDetection {
    RawDetection {
        class_id: 39,
        class_name: "bottle".to_string(),
        confidence: 0.9,
        bbox: [x1, 100.0, x2, 200.0],
    }
}

fn fast_config() -> PerceptionConfig {
    PerceptionConfig {
        cycle_delay_ms: 2,
        capture_backoff_ms: 2,
        join_timeout_ms: 2000,
        ..PerceptionConfig::default()
    }
}

fn context() -> Arc<PerceptionContext> {
    Arc::new(PerceptionContext::new(
        Arc::new(StatusStore::new()),
        Arc::new(DetectionBuffer::new()),
        Arc::new(EventRelay::new()),
    ))
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

#[test]
fn test_publishes_detections_and_triggers_hooks() {
    let ctx = context();
    let hook = Arc::new(CountingHook::default());
    ctx.add_hook(hook.clone());
    ctx.add_hook(Arc::new(LastDetectionHook::new(
        ctx.status.clone(),
        ctx.relay.clone(),
    )));

    let detector = MockDetector::with_output(vec![bottle(0.0, 40.0), bottle(300.0, 340.0)]);
    let mut perception = PerceptionLoop::new(MockSource::new(), detector, ctx.clone(), fast_config());
    perception.start().unwrap();
    assert!(perception.is_running());
    assert!(ctx.status.read().vision_active);

    assert!(wait_until(Duration::from_secs(2), || {
        hook.calls.load(Ordering::Relaxed) >= 3
    }));
    perception.stop().unwrap();

    let snapshot = ctx.buffer.read().unwrap();
    assert_eq!(snapshot.detections.len(), 2);

    // 第二个框中心 (320, 150) 更靠近画面中心
    let last = ctx.status.read().last_detection.unwrap();
    assert_eq!(last.center, [320, 150]);

    let batch = ctx.relay.try_take().unwrap();
    assert!(batch.detections);
    assert!(batch.status);

    let metrics = ctx.metrics.snapshot();
    assert!(metrics.detection_cycles >= 3);
    assert_eq!(metrics.detections_total, metrics.detection_cycles * 2);
}

#[test]
fn test_empty_cycles_update_buffer_without_notifying() {
    let ctx = context();
    let hook = Arc::new(CountingHook::default());
    ctx.add_hook(hook.clone());

    // 置信度不足，全部被过滤
    let mut weak = bottle(0.0, 40.0);
    weak.confidence = 0.2;
    let detector = MockDetector::with_output(vec![weak]);

    let mut perception = PerceptionLoop::new(MockSource::new(), detector, ctx.clone(), fast_config());
    perception.start().unwrap();
    // 消费掉 vision_active 的状态通知
    ctx.relay.try_take();

    assert!(wait_until(Duration::from_secs(2), || {
        ctx.buffer.read().is_some_and(|s| s.sequence >= 3)
    }));
    perception.stop().unwrap();

    assert!(ctx.buffer.read().unwrap().detections.is_empty());
    assert_eq!(hook.calls.load(Ordering::Relaxed), 0);
    let batch = ctx.relay.try_take().unwrap();
    assert!(!batch.detections);
    assert!(batch.status);
}

#[test]
fn test_stop_immediately_after_start() {
    let ctx = context();
    let config = PerceptionConfig {
        // 长周期：worker 必须在等待点被唤醒而不是睡满
        cycle_delay_ms: 10_000,
        ..fast_config()
    };
    let mut perception = PerceptionLoop::new(
        MockSource::new(),
        MockDetector::with_output(vec![bottle(0.0, 40.0), bottle(300.0, 340.0)]),
        ctx.clone(),
        config,
    );

    perception.start().unwrap();
    let started = Instant::now();
    perception.stop().unwrap();

    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(!perception.is_running());
    assert!(!ctx.status.read().vision_active);

    // 缓冲区要么为空，要么是单个完整的帧/检测对
    if let Some(snapshot) = ctx.buffer.read() {
        assert!(snapshot.sequence <= 1);
        assert_eq!(snapshot.detections.len(), 2);
        assert!(
            snapshot
                .detections
                .iter()
                .all(|d| d.timestamp_us == snapshot.frame.timestamp_us)
        );
    }
}

#[test]
fn test_stop_is_idempotent_and_restartable() {
    let ctx = context();
    let mut perception = PerceptionLoop::new(
        MockSource::new(),
        MockDetector::with_output(vec![bottle(0.0, 40.0)]),
        ctx.clone(),
        fast_config(),
    );

    perception.stop().unwrap();
    perception.start().unwrap();
    // 重复启动无副作用
    perception.start().unwrap();
    perception.stop().unwrap();
    perception.stop().unwrap();

    perception.start().unwrap();
    assert!(ctx.status.read().vision_active);
    assert!(wait_until(Duration::from_secs(2), || ctx.buffer.read().is_some()));

    let (source, _detector) = perception.release().unwrap();
    assert!(source.frames > 0);
    assert!(!ctx.status.read().vision_active);
}

#[test]
fn test_recovers_from_capture_and_inference_errors() {
    let ctx = context();
    let source = MockSource {
        frames: 0,
        fail_first: 3,
    };
    let detector = MockDetector {
        output: vec![bottle(0.0, 40.0)],
        fail_odd: true,
        calls: 0,
    };

    let mut perception = PerceptionLoop::new(source, detector, ctx.clone(), fast_config());
    perception.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        ctx.metrics.snapshot().detection_cycles >= 2
    }));
    perception.stop().unwrap();

    let metrics = ctx.metrics.snapshot();
    assert_eq!(metrics.capture_misses, 3);
    assert!(metrics.inference_errors >= 2);
    assert!(ctx.buffer.read().is_some());
}

#[test]
fn test_detector_panic_is_counted_and_loop_continues() {
    let ctx = context();
    let detector = PanicOnceDetector {
        output: vec![bottle(0.0, 40.0)],
        panicked: false,
    };

    let mut perception = PerceptionLoop::new(MockSource::new(), detector, ctx.clone(), fast_config());
    perception.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        ctx.metrics.snapshot().detection_cycles >= 2
    }));
    assert!(perception.is_running());
    assert!(ctx.status.read().vision_active);
    perception.stop().unwrap();

    assert_eq!(ctx.metrics.snapshot().inference_errors, 1);

    // 资源已归还，可以再次启动
    perception.start().unwrap();
    perception.stop().unwrap();
}

#[test]
fn test_worker_panic_resets_running_and_vision_active() {
    let ctx = context();
    let mut perception = PerceptionLoop::new(
        PanickingSource,
        MockDetector::with_output(Vec::new()),
        ctx.clone(),
        fast_config(),
    );

    perception.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || !perception.is_running()));
    assert!(wait_until(Duration::from_secs(2), || {
        !ctx.status.read().vision_active
    }));

    assert!(matches!(perception.stop(), Err(DriverError::IoThread(_))));
    assert!(matches!(
        perception.start(),
        Err(DriverError::ResourcesUnavailable)
    ));
}
