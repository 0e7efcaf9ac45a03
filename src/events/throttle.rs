//! 进度事件节流器
//!
//! 控制进度 / 性能事件的发布频率，避免事件风暴。
//! 终态事件（完成、失败）不经过节流器。

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 只在编排器控制循环内使用，无需原子操作。
/// 每次更新进度时调用 `should_emit()`，返回 true 时才发布事件
#[derive(Debug, Clone)]
pub struct ProgressThrottler {
    /// 上次发布时间，None 表示尚未发布
    last_emit: Option<Instant>,
    /// 节流间隔
    interval: Duration,
}

impl ProgressThrottler {
    /// 创建新的节流器
    ///
    /// # 参数
    /// * `interval` - 最小发布间隔
    pub fn new(interval: Duration) -> Self {
        Self {
            last_emit: None,
            interval,
        }
    }

    /// 使用指定毫秒间隔创建节流器
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 检查是否应该发布事件
    pub fn should_emit(&mut self) -> bool {
        self.should_emit_at(Instant::now())
    }

    /// 以指定时间点检查是否应该发布事件
    pub fn should_emit_at(&mut self, now: Instant) -> bool {
        match self.last_emit {
            Some(last) if now.saturating_duration_since(last) < self.interval => false,
            _ => {
                self.last_emit = Some(now);
                true
            }
        }
    }

    /// 强制发布（用于最后一次更新）
    pub fn force_emit(&mut self) -> bool {
        self.last_emit = Some(Instant::now());
        true
    }

    /// 重置节流器状态
    pub fn reset(&mut self) {
        self.last_emit = None;
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}

/// 按文件分桶的进度节流器
///
/// 不同文件的进度事件互不覆盖
#[derive(Debug, Clone)]
pub struct KeyedThrottler {
    interval: Duration,
    buckets: HashMap<String, ProgressThrottler>,
}

impl KeyedThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            buckets: HashMap::new(),
        }
    }

    /// 检查指定文件是否应该发布进度事件
    pub fn should_emit(&mut self, key: &str) -> bool {
        let interval = self.interval;
        self.buckets
            .entry(key.to_string())
            .or_insert_with(|| ProgressThrottler::new(interval))
            .should_emit()
    }

    /// 文件离开活跃集合后移除对应的桶
    pub fn remove(&mut self, key: &str) {
        self.buckets.remove(key);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_throttler_basic() {
        let mut throttler = ProgressThrottler::with_millis(100);

        // 第一次应该发布
        assert!(throttler.should_emit());

        // 立即再次调用，不应该发布
        assert!(!throttler.should_emit());
    }

    #[test]
    fn test_throttler_after_interval() {
        let mut throttler = ProgressThrottler::with_millis(50);
        let start = Instant::now();

        assert!(throttler.should_emit_at(start));
        assert!(!throttler.should_emit_at(start + Duration::from_millis(49)));
        assert!(throttler.should_emit_at(start + Duration::from_millis(60)));
    }

    #[test]
    fn test_force_emit_and_reset() {
        let mut throttler = ProgressThrottler::with_millis(1000);

        assert!(throttler.should_emit());
        assert!(!throttler.should_emit());
        assert!(throttler.force_emit());

        throttler.reset();
        assert!(throttler.should_emit());
    }

    #[test]
    fn test_keyed_throttler_isolates_files() {
        let mut throttler = KeyedThrottler::new(Duration::from_secs(10));

        assert!(throttler.should_emit("a"));
        assert!(throttler.should_emit("b"));
        assert!(!throttler.should_emit("a"));
        assert_eq!(throttler.len(), 2);

        throttler.remove("a");
        assert!(throttler.should_emit("a"));
    }
}
