//! 上传性能指标
//!
//! 根据分片完成事件统计吞吐量：
//! 1. 滑动窗口内的瞬时速度
//! 2. 自首个分片开始以来的平均速度
//! 3. 按瞬时速度估算剩余时间

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tracing::debug;

/// 性能快照
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceSnapshot {
    /// 滑动窗口速度（字节/秒）
    pub current_speed: u64,
    /// 平均速度（字节/秒）
    pub average_speed: u64,
    /// 累计上传字节数
    pub total_uploaded: u64,
    /// 剩余字节数（活跃和排队文件）
    pub remaining_bytes: u64,
    /// 预计剩余时间（秒），速度为 0 时无法估算
    #[serde(skip_serializing_if = "Option::is_none")]
    pub eta_secs: Option<u64>,
    /// 已完成分片数
    pub chunks_completed: u64,
    /// 失败分片数（含重试）
    pub chunks_failed: u64,
    /// 已完成文件数
    pub files_completed: u64,
    /// 失败文件数
    pub files_failed: u64,
    /// 正在上传的分片数
    pub inflight_chunks: usize,
    /// 统计时长（秒）
    pub elapsed_secs: u64,
}

/// 性能指标聚合器
#[derive(Debug)]
pub struct MetricsAggregator {
    enabled: bool,
    window: Duration,
    /// 窗口内的样本：(完成时间, 字节数)
    samples: VecDeque<(Instant, u64)>,
    started_at: Option<Instant>,
    total_uploaded: u64,
    chunks_completed: u64,
    chunks_failed: u64,
    files_completed: u64,
    files_failed: u64,
}

impl MetricsAggregator {
    /// 创建聚合器
    ///
    /// # 参数
    /// * `enabled` - 关闭时所有记录操作为空操作
    /// * `window` - 瞬时速度的滑动窗口长度
    pub fn new(enabled: bool, window: Duration) -> Self {
        Self {
            enabled,
            window,
            samples: VecDeque::new(),
            started_at: None,
            total_uploaded: 0,
            chunks_completed: 0,
            chunks_failed: 0,
            files_completed: 0,
            files_failed: 0,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 记录分片开始上传（首次调用时开始计时）
    pub fn record_chunk_started(&mut self) {
        self.record_chunk_started_at(Instant::now());
    }

    pub fn record_chunk_started_at(&mut self, now: Instant) {
        if self.enabled && self.started_at.is_none() {
            self.started_at = Some(now);
        }
    }

    /// 记录分片完成
    pub fn record_chunk(&mut self, bytes: u64) {
        self.record_chunk_at(bytes, Instant::now());
    }

    pub fn record_chunk_at(&mut self, bytes: u64, now: Instant) {
        if !self.enabled {
            return;
        }
        self.started_at.get_or_insert(now);
        self.samples.push_back((now, bytes));
        self.total_uploaded += bytes;
        self.chunks_completed += 1;
        self.prune(now);
    }

    /// 记录分片失败
    pub fn record_chunk_failure(&mut self) {
        if self.enabled {
            self.chunks_failed += 1;
        }
    }

    /// 记录文件结束
    pub fn record_file_finished(&mut self, success: bool) {
        if !self.enabled {
            return;
        }
        if success {
            self.files_completed += 1;
        } else {
            self.files_failed += 1;
        }
    }

    /// 生成性能快照
    pub fn snapshot(&mut self, remaining_bytes: u64, inflight_chunks: usize) -> PerformanceSnapshot {
        self.snapshot_at(remaining_bytes, inflight_chunks, Instant::now())
    }

    pub fn snapshot_at(
        &mut self,
        remaining_bytes: u64,
        inflight_chunks: usize,
        now: Instant,
    ) -> PerformanceSnapshot {
        if !self.enabled {
            return PerformanceSnapshot::default();
        }
        self.prune(now);

        let current_speed = self.window_speed(now);
        let elapsed = self
            .started_at
            .map(|s| now.saturating_duration_since(s))
            .unwrap_or_default();
        let average_speed = if elapsed.as_secs_f64() > 0.0 {
            (self.total_uploaded as f64 / elapsed.as_secs_f64()) as u64
        } else {
            0
        };

        let eta_secs = if remaining_bytes == 0 {
            Some(0)
        } else {
            let speed = if current_speed > 0 {
                current_speed
            } else {
                average_speed
            };
            (speed > 0).then(|| remaining_bytes.div_ceil(speed))
        };

        let snapshot = PerformanceSnapshot {
            current_speed,
            average_speed,
            total_uploaded: self.total_uploaded,
            remaining_bytes,
            eta_secs,
            chunks_completed: self.chunks_completed,
            chunks_failed: self.chunks_failed,
            files_completed: self.files_completed,
            files_failed: self.files_failed,
            inflight_chunks,
            elapsed_secs: elapsed.as_secs(),
        };
        debug!(
            "性能指标: 当前速度 {:.2} KB/s, 平均速度 {:.2} KB/s, 剩余 {} bytes",
            current_speed as f64 / 1024.0,
            average_speed as f64 / 1024.0,
            remaining_bytes
        );
        snapshot
    }

    /// 清空统计
    pub fn reset(&mut self) {
        self.samples.clear();
        self.started_at = None;
        self.total_uploaded = 0;
        self.chunks_completed = 0;
        self.chunks_failed = 0;
        self.files_completed = 0;
        self.files_failed = 0;
    }

    /// 滑动窗口速度
    ///
    /// 统计开始不足一个窗口时按实际时长计算
    fn window_speed(&self, now: Instant) -> u64 {
        let bytes: u64 = self.samples.iter().map(|(_, b)| *b).sum();
        if bytes == 0 {
            return 0;
        }
        let span = match self.started_at {
            Some(start) => now.saturating_duration_since(start).min(self.window),
            None => self.window,
        };
        let secs = span.as_secs_f64().max(0.001);
        (bytes as f64 / secs) as u64
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.saturating_duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}
