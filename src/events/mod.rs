//! 上传事件模块
//!
//! 事件类型定义、事件节流与广播

pub mod throttle;
pub mod types;

pub use throttle::{KeyedThrottler, ProgressThrottler, DEFAULT_THROTTLE_INTERVAL_MS};
pub use types::{EventPriority, UploadEvent};

use tokio::sync::broadcast;
use tracing::trace;

/// 事件通道容量，慢订阅者超出后会丢失最旧的事件
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// 事件广播器
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<UploadEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    /// 订阅事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.sender.subscribe()
    }

    /// 发布事件，没有订阅者时直接丢弃
    pub fn publish(&self, event: UploadEvent) {
        trace!("发布事件: {}", event.event_type_name());
        let _ = self.sender.send(event);
    }

    /// 当前订阅者数量
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
