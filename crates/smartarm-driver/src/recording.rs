//! 操作记录（CSV 数据集）
//!
//! 每个非空检测周期生成一条 [`OperationRecord`]，由 [`RecordingHook`] 在感知线程上
//! `try_send` 到有界队列，写盘在独立线程完成：
//!
//! - **非阻塞**: 队列满时丢弃记录并计入 `dropped_records`，不拖慢感知线程
//! - **追加写**: 文件已存在时只追加数据行，不重复写表头
//! - **逐行 flush**: 进程异常退出最多丢失队列中未写出的记录
//!
//! # 使用示例
//!
//! ```rust,no_run
//! use smartarm_driver::recording::{CsvRecorder, RecordingHook};
//! use smartarm_driver::{PerceptionContext, StatusStore, DetectionBuffer, EventRelay};
//! use std::sync::Arc;
//!
//! let status = Arc::new(StatusStore::new());
//! let ctx = PerceptionContext::new(
//!     status.clone(),
//!     Arc::new(DetectionBuffer::new()),
//!     Arc::new(EventRelay::new()),
//! );
//! let recorder = Arc::new(CsvRecorder::create("data/dataset.csv", 1024).unwrap());
//! ctx.add_hook(Arc::new(RecordingHook::new(status, recorder.clone())));
//! ```

use crate::detection::{DetectionEvent, FRAME_CENTER, closest_to, unix_micros};
use crate::error::DriverError;
use crate::hooks::DetectionCallback;
use crate::state::{StatusStore, SystemStatus};
use chrono::{DateTime, Local};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use smartarm_protocol::{Mode, SERVO_COUNT};
use std::borrow::Cow;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

/// CSV 表头（列顺序固定，下游分析脚本依赖）
pub const CSV_HEADER: [&str; 16] = [
    "timestamp",
    "mode",
    "objects_detected",
    "grab_success",
    "distance_cm",
    "servo_base",
    "servo_shoulder",
    "servo_elbow",
    "servo_wrist",
    "gripper_state",
    "detection_confidence",
    "object_class",
    "object_position_x",
    "object_position_y",
    "execution_time_ms",
    "error_message",
];

/// 一条操作记录
#[derive(Debug, Clone, PartialEq)]
pub struct OperationRecord {
    pub timestamp: DateTime<Local>,
    pub mode: Mode,
    pub objects_detected: usize,
    pub grab_success: bool,
    pub distance_cm: f64,
    pub servo_angles: [i32; SERVO_COUNT],
    pub gripper_state: String,
    /// 主目标（最靠近画面中心）的置信度
    pub detection_confidence: Option<f32>,
    pub object_class: Option<String>,
    pub object_position: Option<[f64; 2]>,
    /// 采集到记录生成的耗时
    pub execution_time_ms: f64,
    pub error_message: String,
}

impl OperationRecord {
    /// 由当前状态和本周期检测结果生成
    pub fn from_cycle(status: &SystemStatus, detections: &[DetectionEvent]) -> Self {
        let target = closest_to(detections, FRAME_CENTER);
        let execution_time_ms = target
            .map(|d| unix_micros().saturating_sub(d.timestamp_us) as f64 / 1000.0)
            .unwrap_or(0.0);

        Self {
            timestamp: Local::now(),
            mode: status.mode,
            objects_detected: detections.len(),
            grab_success: false,
            distance_cm: status.distance_cm,
            servo_angles: status.servo_angles,
            gripper_state: "unknown".to_string(),
            detection_confidence: target.map(|d| d.confidence),
            object_class: target.map(|d| d.class_name.clone()),
            object_position: target.map(|d| d.relative_position),
            execution_time_ms,
            error_message: status.error_message.clone(),
        }
    }

    /// 格式化为一行 CSV（不含换行）
    pub fn csv_row(&self) -> String {
        let [base, shoulder, elbow, wrist, _gripper] = self.servo_angles;
        let (pos_x, pos_y) = match self.object_position {
            Some([x, y]) => (format!("{:.4}", x), format!("{:.4}", y)),
            None => (NO_TARGET_VALUE.to_string(), NO_TARGET_VALUE.to_string()),
        };

        let fields: [Cow<'_, str>; 16] = [
            self.timestamp.to_rfc3339().into(),
            self.mode.to_string().into(),
            self.objects_detected.to_string().into(),
            self.grab_success.to_string().into(),
            self.distance_cm.to_string().into(),
            base.to_string().into(),
            shoulder.to_string().into(),
            elbow.to_string().into(),
            wrist.to_string().into(),
            csv_escape(&self.gripper_state),
            self.detection_confidence
                .map_or(Cow::Borrowed(NO_TARGET_VALUE), |c| Cow::Owned(format!("{:.3}", c))),
            csv_escape(self.object_class.as_deref().unwrap_or("")),
            pos_x.into(),
            pos_y.into(),
            format!("{:.2}", self.execution_time_ms).into(),
            csv_escape(&self.error_message),
        ];
        fields.join(",")
    }
}

/// 含逗号、引号或换行的字段加引号，内部引号加倍
fn csv_escape(field: &str) -> Cow<'_, str> {
    if field.contains(&[',', '"', '\n', '\r'][..]) {
        Cow::Owned(format!("\"{}\"", field.replace('"', "\"\"")))
    } else {
        Cow::Borrowed(field)
    }
}

/// 无目标时置信度与坐标列的取值
const NO_TARGET_VALUE: &str = "0.0";

/// 操作记录器
///
/// `record` 在感知线程上调用，必须非阻塞。
pub trait OperationRecorder: Send + Sync {
    fn record(&self, record: OperationRecord);
}

/// CSV 文件记录器（Actor 模式 + Bounded Queue）
pub struct CsvRecorder {
    path: PathBuf,
    tx: Option<Sender<OperationRecord>>,
    writer: Option<JoinHandle<()>>,
    dropped_records: Arc<AtomicU64>,
    written_records: Arc<AtomicU64>,
}

impl CsvRecorder {
    /// 打开（或创建）CSV 文件并启动写线程
    ///
    /// # 参数
    /// - `path`: 目标文件，父目录不存在时自动创建
    /// - `queue_capacity`: 待写记录队列容量
    ///
    /// # 错误
    /// - `Io`: 目录创建、文件打开、表头写入或线程创建失败
    pub fn create(path: impl AsRef<Path>, queue_capacity: usize) -> Result<Self, DriverError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let needs_header = file.metadata()?.len() == 0;
        let mut out = BufWriter::new(file);
        if needs_header {
            writeln!(out, "{}", CSV_HEADER.join(","))?;
            out.flush()?;
        }

        let (tx, rx) = bounded(queue_capacity.max(1));
        let written_records = Arc::new(AtomicU64::new(0));
        let written = written_records.clone();
        let writer = thread::Builder::new()
            .name("smartarm-recorder".to_string())
            .spawn(move || csv_writer_loop(out, rx, written))?;

        info!("Recording operations to {}", path.display());

        Ok(Self {
            path,
            tx: Some(tx),
            writer: Some(writer),
            dropped_records: Arc::new(AtomicU64::new(0)),
            written_records,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 因队列满而丢弃的记录数
    pub fn dropped_records(&self) -> u64 {
        self.dropped_records.load(Ordering::Relaxed)
    }

    /// 已写入文件的记录数
    pub fn written_records(&self) -> u64 {
        self.written_records.load(Ordering::Relaxed)
    }

    /// 关闭队列，等待写线程写完剩余记录
    pub fn close(&mut self) {
        drop(self.tx.take());
        if let Some(writer) = self.writer.take()
            && writer.join().is_err()
        {
            error!("Recorder writer thread panicked");
        }
    }
}

impl OperationRecorder for CsvRecorder {
    fn record(&self, record: OperationRecord) {
        let Some(tx) = &self.tx else {
            return;
        };
        match tx.try_send(record) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => {
                let dropped = self.dropped_records.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped == 1 || dropped % 100 == 0 {
                    warn!("Recorder queue full, {} records dropped", dropped);
                }
            },
            Err(TrySendError::Disconnected(_)) => {
                self.dropped_records.fetch_add(1, Ordering::Relaxed);
                debug!("Recorder writer gone, record dropped");
            },
        }
    }
}

impl Drop for CsvRecorder {
    fn drop(&mut self) {
        self.close();
    }
}

fn csv_writer_loop(mut out: BufWriter<File>, rx: Receiver<OperationRecord>, written: Arc<AtomicU64>) {
    for record in rx.iter() {
        let result = writeln!(out, "{}", record.csv_row()).and_then(|_| out.flush());
        match result {
            Ok(()) => {
                written.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => error!("Failed to write operation record: {}", e),
        }
    }
    if let Err(e) = out.flush() {
        error!("Failed to flush recorder output: {}", e);
    }
    debug!("Recorder writer exiting");
}

/// 每个非空检测周期生成一条记录
pub struct RecordingHook {
    status: Arc<StatusStore>,
    recorder: Arc<dyn OperationRecorder>,
}

impl RecordingHook {
    pub fn new(status: Arc<StatusStore>, recorder: Arc<dyn OperationRecorder>) -> Self {
        Self { status, recorder }
    }
}

impl DetectionCallback for RecordingHook {
    fn on_detections(&self, detections: &[DetectionEvent]) {
        let status = self.status.snapshot();
        self.recorder
            .record(OperationRecord::from_cycle(&status, detections));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detection::BoundingBox;
    use parking_lot::Mutex;

    fn detection(class_name: &str, x: f64, y: f64) -> DetectionEvent {
        DetectionEvent {
            class_id: 39,
            class_name: class_name.to_string(),
            confidence: 0.875,
            bbox: BoundingBox {
                x1: 0,
                y1: 0,
                x2: 4,
                y2: 4,
            },
            center: [2, 2],
            relative_position: [x, y],
            size: [4, 4],
            timestamp_us: unix_micros(),
        }
    }

    #[derive(Default)]
    struct MemoryRecorder {
        records: Mutex<Vec<OperationRecord>>,
    }

    impl OperationRecorder for MemoryRecorder {
        fn record(&self, record: OperationRecord) {
            self.records.lock().push(record);
        }
    }

    #[test]
    fn test_csv_escape() {
        assert_eq!(csv_escape("plain"), "plain");
        assert_eq!(csv_escape("a,b"), "\"a,b\"");
        assert_eq!(csv_escape("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_record_from_cycle_uses_center_target() {
        let status = SystemStatus {
            distance_cm: 21.5,
            ..SystemStatus::default()
        };
        let detections = vec![detection("bottle", 0.9, 0.9), detection("cup", 0.5, 0.45)];

        let record = OperationRecord::from_cycle(&status, &detections);
        assert_eq!(record.objects_detected, 2);
        assert_eq!(record.object_class.as_deref(), Some("cup"));
        assert_eq!(record.object_position, Some([0.5, 0.45]));
        assert_eq!(record.distance_cm, 21.5);
        assert!(!record.grab_success);
    }

    #[test]
    fn test_csv_row_column_count() {
        let status = SystemStatus {
            error_message: "link lost, retrying".to_string(),
            ..SystemStatus::default()
        };
        let record = OperationRecord::from_cycle(&status, &[detection("bottle", 0.5, 0.5)]);
        let row = record.csv_row();

        assert!(row.contains(",auto,1,false,"));
        assert!(row.ends_with("\"link lost, retrying\""));
        // 去掉引号字段后正好 16 列
        let unquoted = row.replace("\"link lost, retrying\"", "x");
        assert_eq!(unquoted.split(',').count(), CSV_HEADER.len());
    }

    #[test]
    fn test_csv_row_without_target_uses_zero_defaults() {
        let record = OperationRecord::from_cycle(&SystemStatus::default(), &[]);
        let row = record.csv_row();
        let columns: Vec<&str> = row.split(',').collect();

        assert_eq!(columns.len(), CSV_HEADER.len());
        // detection_confidence, object_class, object_position_x, object_position_y
        assert_eq!(&columns[10..14], &["0.0", "", "0.0", "0.0"]);
        assert_eq!(columns[14], "0.00");
    }

    #[test]
    fn test_recording_hook_forwards_record() {
        let status = Arc::new(StatusStore::new());
        let recorder = Arc::new(MemoryRecorder::default());
        let hook = RecordingHook::new(status, recorder.clone());

        hook.on_detections(&[detection("apple", 0.3, 0.3)]);
        let records = recorder.records.lock();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].object_class.as_deref(), Some("apple"));
    }

    #[test]
    fn test_csv_recorder_writes_header_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dataset.csv");

        {
            let mut recorder = CsvRecorder::create(&path, 8).unwrap();
            recorder.record(OperationRecord::from_cycle(
                &SystemStatus::default(),
                &[detection("bottle", 0.5, 0.5)],
            ));
            recorder.close();
            assert_eq!(recorder.written_records(), 1);
            assert_eq!(recorder.dropped_records(), 0);
        }
        {
            let recorder = CsvRecorder::create(&path, 8).unwrap();
            recorder.record(OperationRecord::from_cycle(&SystemStatus::default(), &[]));
        }

        let content = fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CSV_HEADER.join(","));
        assert_eq!(content.matches("timestamp,mode").count(), 1);
    }

    #[test]
    fn test_record_after_close_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let mut recorder = CsvRecorder::create(dir.path().join("ops.csv"), 1).unwrap();
        recorder.close();
        recorder.record(OperationRecord::from_cycle(&SystemStatus::default(), &[]));
        // 发送端已释放，不计入丢弃
        assert_eq!(recorder.dropped_records(), 0);
    }
}
