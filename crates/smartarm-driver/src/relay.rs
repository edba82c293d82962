//! 跨上下文事件中继
//!
//! 感知线程和 MQTT 事件线程都是普通 OS 线程，而广播器运行在 tokio 运行时中。
//! [`EventRelay`] 把"某类数据变了"的信号从任意线程交给唯一的异步消费者：
//!
//! - `notify()` 永不阻塞，可在任意线程调用
//! - 同类通知在消费前会被合并，消费者总是重新读取最新数据
//! - 通知本身不携带数据，因此积压不会增长
//!
//! ```text
//! notify(Status) ─┐
//! notify(Status) ─┼─▶ pending = 0b01 ──next().await──▶ RelayBatch { status: true, .. }
//! ```

use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use tokio::sync::Notify;
use tracing::trace;

/// 通知类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayKind {
    /// 系统状态变化
    Status,
    /// 新的非空检测列表
    Detections,
}

impl RelayKind {
    fn bit(self) -> u8 {
        match self {
            RelayKind::Status => 0b01,
            RelayKind::Detections => 0b10,
        }
    }
}

/// 一次取出的合并通知
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayBatch {
    pub status: bool,
    pub detections: bool,
}

impl RelayBatch {
    fn from_bits(bits: u8) -> Option<Self> {
        if bits == 0 {
            return None;
        }
        Some(Self {
            status: bits & RelayKind::Status.bit() != 0,
            detections: bits & RelayKind::Detections.bit() != 0,
        })
    }
}

/// 事件中继（多生产者、单消费者）
#[derive(Debug, Default)]
pub struct EventRelay {
    pending: AtomicU8,
    notify: Notify,
    closed: AtomicBool,
    notifications: AtomicU64,
    batches: AtomicU64,
}

impl EventRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发出通知（非阻塞）
    ///
    /// 中继关闭后的通知被忽略。
    pub fn notify(&self, kind: RelayKind) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        self.pending.fetch_or(kind.bit(), Ordering::AcqRel);
        self.notifications.fetch_add(1, Ordering::Relaxed);
        // 单消费者：notify_one 在无人等待时保留一个许可，不会丢失唤醒
        self.notify.notify_one();
        trace!("Relay notified: {:?}", kind);
    }

    /// 非阻塞地取出当前积压的通知
    pub fn try_take(&self) -> Option<RelayBatch> {
        let batch = RelayBatch::from_bits(self.pending.swap(0, Ordering::AcqRel))?;
        self.batches.fetch_add(1, Ordering::Relaxed);
        Some(batch)
    }

    /// 等待下一批通知
    ///
    /// 关闭后先取完剩余通知，再返回 `None`。
    pub async fn next(&self) -> Option<RelayBatch> {
        loop {
            if let Some(batch) = self.try_take() {
                return Some(batch);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            self.notify.notified().await;
        }
    }

    /// 关闭中继并唤醒消费者
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.notify.notify_one();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// 收到的通知总数
    pub fn notification_count(&self) -> u64 {
        self.notifications.load(Ordering::Relaxed)
    }

    /// 交付给消费者的批次数（≤ 通知总数）
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_notifications_coalesce() {
        let relay = EventRelay::new();
        relay.notify(RelayKind::Status);
        relay.notify(RelayKind::Status);
        relay.notify(RelayKind::Detections);

        let batch = relay.try_take().unwrap();
        assert!(batch.status);
        assert!(batch.detections);
        assert!(relay.try_take().is_none());
        assert_eq!(relay.notification_count(), 3);
        assert_eq!(relay.batch_count(), 1);
    }

    #[test]
    fn test_notify_after_close_ignored() {
        let relay = EventRelay::new();
        relay.close();
        relay.notify(RelayKind::Status);
        assert!(relay.try_take().is_none());
        assert!(relay.is_closed());
    }

    #[tokio::test]
    async fn test_next_wakes_on_notify_from_thread() {
        let relay = Arc::new(EventRelay::new());
        let producer = relay.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.notify(RelayKind::Detections);
        });

        let batch = tokio::time::timeout(Duration::from_secs(2), relay.next())
            .await
            .expect("relay should wake")
            .unwrap();
        assert!(batch.detections);
        assert!(!batch.status);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_close_drains_then_ends() {
        let relay = EventRelay::new();
        relay.notify(RelayKind::Status);
        relay.close();

        assert_eq!(
            relay.next().await,
            Some(RelayBatch {
                status: true,
                detections: false
            })
        );
        assert_eq!(relay.next().await, None);
    }
}
