//! 状态存储与检测缓冲区并发测试
//!
//! 验证 `ArcSwap` 快照在多写多读下不会撕裂，部分更新不会互相覆盖。

use smartarm_driver::*;
use smartarm_protocol::Mode;
use std::sync::Arc;
use std::thread;

/// 两个写者更新不同字段，最终两者的最后一次写入都生效
#[test]
fn test_disjoint_writers_do_not_lose_updates() {
    let store = Arc::new(StatusStore::new());
    let iterations = 500;

    let speed_writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..iterations {
                store
                    .update(StatusPatch::new().motor_speed(i % 100))
                    .unwrap();
            }
        })
    };
    let distance_writer = {
        let store = store.clone();
        thread::spawn(move || {
            for i in 0..iterations {
                store
                    .update(StatusPatch::new().distance_cm(i as f64))
                    .unwrap();
            }
        })
    };
    let mode_writer = {
        let store = store.clone();
        thread::spawn(move || {
            for _ in 0..iterations {
                store
                    .update(StatusPatch::new().mode(Mode::Manual))
                    .unwrap();
            }
        })
    };

    speed_writer.join().unwrap();
    distance_writer.join().unwrap();
    mode_writer.join().unwrap();

    let status = store.read();
    assert_eq!(status.motor_speed, (iterations - 1) % 100);
    assert_eq!(status.distance_cm, (iterations - 1) as f64);
    assert_eq!(status.mode, Mode::Manual);
    assert_eq!(store.update_count(), 3 * iterations as u64);
}

/// 读者永远看到一次完整提交（五个舵机角度同时写入，读出必须一致）
#[test]
fn test_readers_never_see_torn_status() {
    let store = Arc::new(StatusStore::new());

    let writer = {
        let store = store.clone();
        thread::spawn(move || {
            for round in 0..1000 {
                let angle = round % 181;
                store
                    .update(StatusPatch::new().servo_angles([angle; 5]).motor_speed(angle % 101))
                    .unwrap();
                thread::yield_now();
            }
        })
    };

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let store = store.clone();
            thread::spawn(move || {
                for _ in 0..1000 {
                    let status = store.snapshot();
                    let first = status.servo_angles[0];
                    assert!(status.servo_angles.iter().all(|&a| a == first));
                    if first != 90 {
                        assert_eq!(status.motor_speed, first % 101);
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
}

/// 读者拿到的帧与检测列表总是属于同一次发布
#[test]
fn test_detection_buffer_pairs_stay_consistent() {
    let buffer = Arc::new(DetectionBuffer::new());

    let writer = {
        let buffer = buffer.clone();
        thread::spawn(move || {
            for i in 1..=2000u32 {
                let frame = Frame::blank(i % 7 + 1, 1);
                let count = (i % 3) as usize;
                let detections = (0..count)
                    .map(|_| DetectionEvent {
                        class_id: i,
                        class_name: "cup".to_string(),
                        confidence: 0.9,
                        bbox: BoundingBox {
                            x1: 0,
                            y1: 0,
                            x2: 1,
                            y2: 1,
                        },
                        center: [0, 0],
                        relative_position: [0.0, 0.0],
                        size: [1, 1],
                        timestamp_us: frame.timestamp_us,
                    })
                    .collect();
                buffer.swap(frame, detections);
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let buffer = buffer.clone();
            thread::spawn(move || {
                let mut last_sequence = 0;
                for _ in 0..2000 {
                    if let Some(snapshot) = buffer.read() {
                        assert!(snapshot.sequence >= last_sequence);
                        last_sequence = snapshot.sequence;
                        for detection in &snapshot.detections {
                            assert_eq!(detection.timestamp_us, snapshot.frame.timestamp_us);
                            assert_eq!(snapshot.frame.width, detection.class_id % 7 + 1);
                        }
                    }
                    thread::yield_now();
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }
    assert_eq!(buffer.read().unwrap().sequence, 2000);
}
