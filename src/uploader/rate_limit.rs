//! 上传限速器
//!
//! 令牌桶：容量等于每秒最大字节数，按容量/秒的速度持续补充。
//! 限速器本身不排队，调用方按返回的等待时间自行延后。

use std::time::{Duration, Instant};
use tracing::{debug, info};

/// 令牌桶限速器
#[derive(Debug)]
pub struct RateLimiter {
    /// 桶容量（字节/秒），0 表示不限速
    capacity: u64,
    /// 当前令牌数
    tokens: f64,
    /// 上次补充时间
    last_refill: Instant,
}

impl RateLimiter {
    /// 创建限速器，`bytes_per_sec` 为 0 表示不限速
    pub fn new(bytes_per_sec: u64) -> Self {
        Self {
            capacity: bytes_per_sec,
            tokens: bytes_per_sec as f64,
            last_refill: Instant::now(),
        }
    }

    /// 不限速
    pub fn disabled() -> Self {
        Self::new(0)
    }

    /// 是否启用
    pub fn is_enabled(&self) -> bool {
        self.capacity > 0
    }

    /// 桶容量
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// 当前令牌数（向下取整）
    pub fn available(&self) -> u64 {
        self.tokens as u64
    }

    /// 运行时调整速率，0 表示关闭限速；调整后桶为满
    pub fn set_rate(&mut self, bytes_per_sec: u64) {
        let old = self.capacity;
        self.capacity = bytes_per_sec;
        self.tokens = bytes_per_sec as f64;
        self.last_refill = Instant::now();
        info!("🔧 动态调整上传限速: {} -> {} bytes/s", old, bytes_per_sec);
    }

    /// 申请发送 `bytes` 字节，返回发送前需要等待的时间
    pub fn request_bytes(&mut self, bytes: u64) -> Duration {
        self.request_bytes_at(bytes, Instant::now())
    }

    /// 以指定时间点申请令牌
    pub fn request_bytes_at(&mut self, bytes: u64, now: Instant) -> Duration {
        if !self.is_enabled() {
            return Duration::ZERO;
        }

        self.refill(now);

        let needed = bytes as f64;
        if self.tokens >= needed {
            self.tokens -= needed;
            return Duration::ZERO;
        }

        let deficit = needed - self.tokens;
        let wait_ms = (deficit / self.capacity as f64 * 1000.0).ceil() as u64;
        self.tokens = 0.0;

        debug!(
            "限速等待: 申请={} bytes, 缺口={:.0} bytes, 等待={}ms",
            bytes, deficit, wait_ms
        );
        Duration::from_millis(wait_ms)
    }

    /// 按经过的时间补充令牌
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        self.last_refill = now;
        let added = elapsed.as_secs_f64() * self.capacity as f64;
        self.tokens = (self.tokens + added).min(self.capacity as f64);
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::disabled()
    }
}
