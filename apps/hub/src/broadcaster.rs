//! 订阅者广播
//!
//! 每轮广播：
//!
//! 1. 序列化一次消息（`Arc<str>`，所有订阅者共享）
//! 2. 读锁下复制活跃订阅者列表，立即释放锁
//! 3. 逐个 `try_push`，记录失败者（一个订阅者失败不影响其他订阅者）
//! 4. 写锁下移除失败者
//!
//! 投递从不等待：每个订阅者有自己的有界缓冲，缓冲满即视为投递失败并移除。

use parking_lot::RwLock;
use serde::Serialize;
use smartarm_driver::{DetectionBuffer, DetectionEvent, StatusStore, SystemStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

/// 推送给订阅者的消息
///
/// 线上格式：`{"type":"status","data":{...}}` / `{"type":"detections","data":[...]}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum HubMessage {
    Status(SystemStatus),
    Detections(Vec<DetectionEvent>),
}

impl HubMessage {
    pub fn encode(&self) -> Result<Arc<str>, serde_json::Error> {
        Ok(Arc::from(serde_json::to_string(self)?))
    }

    fn kind(&self) -> &'static str {
        match self {
            HubMessage::Status(_) => "status",
            HubMessage::Detections(_) => "detections",
        }
    }
}

/// 投递失败原因
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushError {
    /// 订阅者缓冲已满（慢消费者）
    #[error("subscriber buffer full")]
    Full,
    /// 连接已关闭
    #[error("subscriber closed")]
    Closed,
}

/// 订阅者投递端
///
/// `try_push` 必须立即返回，不能等待网络 I/O。
pub trait SubscriberSink: Send + Sync {
    fn try_push(&self, message: &Arc<str>) -> Result<(), PushError>;
}

/// 基于有界 mpsc 的投递端，接收端由连接的写任务持有
pub struct ChannelSink {
    tx: mpsc::Sender<Arc<str>>,
}

impl ChannelSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Arc<str>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }
}

impl SubscriberSink for ChannelSink {
    fn try_push(&self, message: &Arc<str>) -> Result<(), PushError> {
        self.tx.try_send(message.clone()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => PushError::Full,
            mpsc::error::TrySendError::Closed(_) => PushError::Closed,
        })
    }
}

/// 订阅者 ID（单调递增，移除后不复用）
pub type SubscriberId = u64;

/// 订阅者投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriberState {
    Active,
    /// 连接正在关闭，不再投递
    Closing,
}

struct Subscriber {
    sink: Arc<dyn SubscriberSink>,
    peer: String,
    state: SubscriberState,
}

/// 广播统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub rounds: u64,
    pub delivered: u64,
    pub pruned: u64,
    pub registered: u64,
}

/// 广播器
pub struct Broadcaster {
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    next_id: AtomicU64,
    status: Arc<StatusStore>,
    buffer: Arc<DetectionBuffer>,
    rounds: AtomicU64,
    delivered: AtomicU64,
    pruned: AtomicU64,
}

impl Broadcaster {
    pub fn new(status: Arc<StatusStore>, buffer: Arc<DetectionBuffer>) -> Self {
        Self {
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            status,
            buffer,
            rounds: AtomicU64::new(0),
            delivered: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
        }
    }

    /// 注册订阅者并立即推送当前完整状态
    ///
    /// 首次推送失败的订阅者不会留在活跃列表中。
    pub fn register(&self, sink: Arc<dyn SubscriberSink>, peer: impl Into<String>) -> SubscriberId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let peer = peer.into();

        self.subscribers.write().insert(
            id,
            Subscriber {
                sink: sink.clone(),
                peer: peer.clone(),
                state: SubscriberState::Active,
            },
        );
        info!("Subscriber #{} registered ({})", id, peer);

        let initial = HubMessage::Status(SystemStatus::clone(&self.status.snapshot()));
        match initial.encode() {
            Ok(message) => {
                if let Err(e) = sink.try_push(&message) {
                    debug!("Initial status to subscriber #{} failed: {}", id, e);
                    self.remove(id, "initial push failed");
                } else {
                    self.delivered.fetch_add(1, Ordering::Relaxed);
                }
            },
            Err(e) => error!("Failed to encode status snapshot: {}", e),
        }
        id
    }

    /// 标记订阅者正在关闭，后续广播跳过它
    pub fn mark_closing(&self, id: SubscriberId) {
        if let Some(subscriber) = self.subscribers.write().get_mut(&id) {
            subscriber.state = SubscriberState::Closing;
        }
    }

    /// 移除订阅者（幂等），返回是否确实移除
    pub fn unregister(&self, id: SubscriberId) -> bool {
        let removed = self.subscribers.write().remove(&id);
        match removed {
            Some(subscriber) => {
                info!("Subscriber #{} unregistered ({})", id, subscriber.peer);
                true
            },
            None => false,
        }
    }

    /// 向所有活跃订阅者推送一条消息，返回成功投递数
    pub fn push(&self, message: &HubMessage) -> usize {
        let encoded = match message.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                error!("Failed to encode {} message: {}", message.kind(), e);
                return 0;
            },
        };
        self.push_encoded(&encoded)
    }

    /// 推送已序列化的消息
    pub fn push_encoded(&self, message: &Arc<str>) -> usize {
        self.rounds.fetch_add(1, Ordering::Relaxed);

        // 快照活跃列表，投递期间不持锁
        let targets: Vec<(SubscriberId, Arc<dyn SubscriberSink>)> = self
            .subscribers
            .read()
            .iter()
            .filter(|(_, s)| s.state == SubscriberState::Active)
            .map(|(id, s)| (*id, s.sink.clone()))
            .collect();

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, sink) in targets {
            match sink.try_push(message) {
                Ok(()) => delivered += 1,
                Err(e) => failed.push((id, e)),
            }
        }

        for (id, reason) in failed {
            self.remove(id, &reason.to_string());
        }

        self.delivered.fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    /// 重新读取状态并广播
    pub fn push_status(&self) -> usize {
        self.push(&HubMessage::Status(SystemStatus::clone(
            &self.status.snapshot(),
        )))
    }

    /// 重新读取最新检测并广播（无检测时不广播）
    pub fn push_detections(&self) -> usize {
        let detections = self.buffer.detections();
        if detections.is_empty() {
            return 0;
        }
        self.push(&HubMessage::Detections(detections))
    }

    /// 移除所有订阅者（关闭时调用，投递端随之释放）
    pub fn close_all(&self) -> usize {
        let mut subscribers = self.subscribers.write();
        let count = subscribers.len();
        subscribers.clear();
        if count > 0 {
            info!("Closed {} subscribers", count);
        }
        count
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    pub fn is_registered(&self, id: SubscriberId) -> bool {
        self.subscribers.read().contains_key(&id)
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            rounds: self.rounds.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            pruned: self.pruned.load(Ordering::Relaxed),
            registered: self.next_id.load(Ordering::Relaxed) - 1,
        }
    }

    fn remove(&self, id: SubscriberId, reason: &str) {
        if let Some(subscriber) = self.subscribers.write().remove(&id) {
            self.pruned.fetch_add(1, Ordering::Relaxed);
            info!(
                "Removing subscriber #{} ({}): {}",
                id, subscriber.peer, reason
            );
        }
    }
}
