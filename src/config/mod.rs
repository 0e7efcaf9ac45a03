// 配置管理模块

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;

use crate::uploader::chunk::chunk_count;

/// 应用配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// 上传配置
    #[serde(default)]
    pub upload: UploadConfig,
    /// 限速配置
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// 执行后端配置
    #[serde(default)]
    pub execution: ExecutionConfig,
    /// 性能统计配置
    #[serde(default)]
    pub metrics: MetricsConfig,
    /// 持久化配置
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// 日志配置
    #[serde(default)]
    pub log: LogConfig,
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// 是否启用日志文件持久化
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// 日志文件保存目录
    #[serde(default = "default_log_dir")]
    pub log_dir: PathBuf,
    /// 日志保留天数（默认 7 天）
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
    /// 日志级别（默认 info）
    #[serde(default = "default_log_level")]
    pub level: String,
    /// 单个日志文件最大大小（字节，默认 50MB）
    #[serde(default = "default_log_max_file_size")]
    pub max_file_size: u64,
}

fn default_log_enabled() -> bool {
    false
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_log_retention_days() -> u32 {
    7
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_max_file_size() -> u64 {
    50 * 1024 * 1024 // 50MB
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: default_log_dir(),
            retention_days: default_log_retention_days(),
            level: default_log_level(),
            max_file_size: default_log_max_file_size(),
        }
    }
}

/// 分片重试退避策略
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryBackoff {
    /// 固定延迟：retry_delay_ms
    Fixed,
    /// 线性延迟：retry_delay_ms × 重试次数
    Linear,
    /// 指数延迟：retry_delay_ms × 2^(重试次数-1)，上限 MAX_RETRY_DELAY_MS
    Exponential,
}

/// 指数退避的最大延迟（毫秒）
pub const MAX_RETRY_DELAY_MS: u64 = 30_000;

impl RetryBackoff {
    /// 计算第 `retry_count` 次重试（从 1 开始）前的等待时间
    pub fn delay_ms(&self, base_ms: u64, retry_count: u32) -> u64 {
        if base_ms == 0 {
            return 0;
        }
        let attempt = retry_count.max(1);
        match self {
            RetryBackoff::Fixed => base_ms,
            RetryBackoff::Linear => base_ms.saturating_mul(attempt as u64),
            RetryBackoff::Exponential => {
                let factor = 2u64.saturating_pow(attempt - 1);
                base_ms.saturating_mul(factor).min(MAX_RETRY_DELAY_MS.max(base_ms))
            }
        }
    }
}

/// 上传配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// 最大同时上传文件数
    #[serde(default = "default_max_concurrent_files")]
    pub max_concurrent_files: usize,
    /// 单文件最大并发分片数
    #[serde(default = "default_max_concurrent_chunks")]
    pub max_concurrent_chunks: usize,
    /// 分片大小（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 单个分片最大重试次数
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// 重试基础延迟（毫秒），0 表示立即重新排队
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// 重试退避策略
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff: RetryBackoff,
    /// 单文件大小上限（字节），None 表示不限制
    #[serde(default)]
    pub max_file_size: Option<u64>,
    /// 允许的文件类型（MIME 或扩展名，支持 "*" 与 "image/*"）
    #[serde(default = "default_allowed_types")]
    pub allowed_types: Vec<String>,
}

fn default_max_concurrent_files() -> usize {
    3
}

fn default_max_concurrent_chunks() -> usize {
    3
}

fn default_chunk_size() -> u64 {
    5 * 1024 * 1024 // 5MB
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    1000
}

fn default_retry_backoff() -> RetryBackoff {
    RetryBackoff::Linear
}

fn default_allowed_types() -> Vec<String> {
    vec!["*".to_string()]
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_concurrent_files: default_max_concurrent_files(),
            max_concurrent_chunks: default_max_concurrent_chunks(),
            chunk_size: default_chunk_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_backoff: default_retry_backoff(),
            max_file_size: None,
            allowed_types: default_allowed_types(),
        }
    }
}

impl UploadConfig {
    /// 第 `retry_count` 次重试前的等待时间（毫秒）
    pub fn retry_delay_for(&self, retry_count: u32) -> u64 {
        self.retry_backoff.delay_ms(self.retry_delay_ms, retry_count)
    }
}

/// 限速配置（令牌桶）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// 是否启用限速
    #[serde(default)]
    pub enabled: bool,
    /// 每秒最大字节数，0 表示不限速
    #[serde(default)]
    pub max_bytes_per_sec: u64,
}

impl RateLimitConfig {
    /// 实际生效的速率（未启用时为 0）
    pub fn effective_rate(&self) -> u64 {
        if self.enabled {
            self.max_bytes_per_sec
        } else {
            0
        }
    }
}

/// 执行后端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// 是否启用并行执行槽位池，关闭后所有分片直接执行
    #[serde(default = "default_execution_enabled")]
    pub enabled: bool,
    /// 槽位数量，None 表示 min(CPU 并行度, 8)
    #[serde(default)]
    pub pool_size: Option<usize>,
}

fn default_execution_enabled() -> bool {
    true
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            enabled: default_execution_enabled(),
            pool_size: None,
        }
    }
}

/// 性能统计配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// 是否启用性能统计事件
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,
    /// 速度统计滑动窗口（秒）
    #[serde(default = "default_metrics_window_secs")]
    pub window_secs: u64,
    /// 性能事件最小发布间隔（毫秒）
    #[serde(default = "default_metrics_update_interval_ms")]
    pub update_interval_ms: u64,
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_window_secs() -> u64 {
    5
}

fn default_metrics_update_interval_ms() -> u64 {
    1000
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            window_secs: default_metrics_window_secs(),
            update_interval_ms: default_metrics_update_interval_ms(),
        }
    }
}

/// 快照存储后端
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    /// 进程内内存（重启后丢失，主要用于测试）
    Memory,
    /// 本地 JSON 文件
    File,
    /// 嵌入式 SQLite
    Sqlite,
}

/// 持久化配置
///
/// 用于断点续传：在途上传状态定期写入快照，重启后读取一次
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// 是否启用快照持久化
    #[serde(default)]
    pub enabled: bool,
    /// 存储后端
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// 存储目录（file / sqlite 后端使用）
    #[serde(default = "default_state_dir")]
    pub dir: PathBuf,
    /// 快照存储键
    #[serde(default = "default_storage_key")]
    pub storage_key: String,
    /// 快照有效期（小时），过期记录在加载时清理
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: u64,
    /// 快照写入防抖间隔（毫秒）
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::File
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_storage_key() -> String {
    "chunk_uploader_state".to_string()
}

fn default_ttl_hours() -> u64 {
    24
}

/// 快照有效期上限（小时，约 100 年）
pub const MAX_TTL_HOURS: u64 = 24 * 365 * 100;

fn default_debounce_ms() -> u64 {
    500
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend: default_store_backend(),
            dir: default_state_dir(),
            storage_key: default_storage_key(),
            ttl_hours: default_ttl_hours(),
            debounce_ms: default_debounce_ms(),
        }
    }
}

impl AppConfig {
    /// 校验配置取值
    pub fn validate(&self) -> Result<()> {
        if self.upload.chunk_size == 0 {
            anyhow::bail!("分片大小必须大于 0");
        }
        if self.upload.max_concurrent_files == 0 {
            anyhow::bail!("最大同时上传文件数必须至少为 1");
        }
        if self.upload.max_concurrent_chunks == 0 {
            anyhow::bail!("单文件最大并发分片数必须至少为 1");
        }
        if let Some(limit) = self.upload.max_file_size {
            if chunk_count(limit, self.upload.chunk_size).is_none() {
                anyhow::bail!(
                    "单文件大小上限 {} bytes 按分片大小 {} bytes 切分后分片数超过 {}",
                    limit,
                    self.upload.chunk_size,
                    u32::MAX
                );
            }
        }
        if self.persistence.ttl_hours > MAX_TTL_HOURS {
            anyhow::bail!("快照有效期不能超过 {} 小时", MAX_TTL_HOURS);
        }
        if self.persistence.enabled && self.persistence.storage_key.trim().is_empty() {
            anyhow::bail!("启用持久化时 storage_key 不能为空");
        }
        Ok(())
    }

    /// 从文件加载配置
    pub async fn load_from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;

        let config: AppConfig = toml::from_str(&content).context("Failed to parse config file")?;
        config.validate().context("配置文件校验失败")?;

        Ok(config)
    }

    /// 保存配置到文件
    pub async fn save_to_file(&self, path: &str) -> Result<()> {
        self.validate().context("保存配置失败")?;

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        // 确保父目录存在
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .await
                    .context("Failed to create config directory")?;
            }
        }

        fs::write(path, content)
            .await
            .context("Failed to write config file")?;

        tracing::info!("✓ 配置已保存: {}", path);
        Ok(())
    }

    /// 加载或创建默认配置
    pub async fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path).await {
            Ok(config) => {
                tracing::info!("配置文件加载成功: {}", path);
                config
            }
            Err(e) => {
                tracing::warn!("配置文件加载失败，使用默认配置: {:#}", e);
                let default_config = Self::default();
                if let Err(e) = default_config.save_to_file(path).await {
                    tracing::error!("保存默认配置失败: {}", e);
                }
                default_config
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.upload.max_concurrent_files, 3);
        assert_eq!(config.upload.max_concurrent_chunks, 3);
        assert_eq!(config.upload.chunk_size, 5 * 1024 * 1024);
        assert_eq!(config.upload.max_retries, 3);
        assert_eq!(config.upload.allowed_types, vec!["*".to_string()]);
        assert!(!config.rate_limit.enabled);
        assert!(config.execution.enabled);
        assert!(config.metrics.enabled);
        assert!(!config.persistence.enabled);
        assert_eq!(config.persistence.ttl_hours, 24);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        let path = path.to_str().unwrap();

        let mut config = AppConfig::default();
        config.upload.chunk_size = 8 * 1024 * 1024;
        config.upload.retry_backoff = RetryBackoff::Exponential;
        config.rate_limit.enabled = true;
        config.rate_limit.max_bytes_per_sec = 2048;
        config.persistence.backend = StoreBackend::Sqlite;

        config.save_to_file(path).await.unwrap();
        let loaded = AppConfig::load_from_file(path).await.unwrap();

        assert_eq!(loaded.upload.chunk_size, 8 * 1024 * 1024);
        assert_eq!(loaded.upload.retry_backoff, RetryBackoff::Exponential);
        assert_eq!(loaded.rate_limit.effective_rate(), 2048);
        assert_eq!(loaded.persistence.backend, StoreBackend::Sqlite);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [upload]
            max_concurrent_files = 2
            allowed_types = ["image/*", ".pdf"]
            "#,
        )
        .unwrap();

        assert_eq!(config.upload.max_concurrent_files, 2);
        assert_eq!(config.upload.max_concurrent_chunks, 3);
        assert_eq!(config.upload.allowed_types.len(), 2);
        assert_eq!(config.persistence.storage_key, "chunk_uploader_state");
    }

    #[test]
    fn test_config_validation() {
        let mut config = AppConfig::default();
        config.upload.chunk_size = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.upload.max_concurrent_chunks = 0;
        assert!(config.validate().is_err());

        // 大小上限切分后分片数超出范围
        let mut config = AppConfig::default();
        config.upload.chunk_size = 1;
        config.upload.max_file_size = Some(u32::MAX as u64 + 1);
        assert!(config.validate().is_err());
        config.upload.max_file_size = Some(u32::MAX as u64);
        assert!(config.validate().is_ok());

        let mut config = AppConfig::default();
        config.persistence.ttl_hours = u64::MAX;
        assert!(config.validate().is_err());
        config.persistence.ttl_hours = MAX_TTL_HOURS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_backoff_policies() {
        assert_eq!(RetryBackoff::Fixed.delay_ms(500, 3), 500);
        assert_eq!(RetryBackoff::Linear.delay_ms(500, 1), 500);
        assert_eq!(RetryBackoff::Linear.delay_ms(500, 3), 1500);
        assert_eq!(RetryBackoff::Exponential.delay_ms(500, 1), 500);
        assert_eq!(RetryBackoff::Exponential.delay_ms(500, 3), 2000);
        assert_eq!(RetryBackoff::Exponential.delay_ms(1000, 20), MAX_RETRY_DELAY_MS);
        // 基础延迟为 0 时始终立即重试
        assert_eq!(RetryBackoff::Linear.delay_ms(0, 5), 0);
    }

    #[test]
    fn test_rate_limit_effective_rate() {
        let config = RateLimitConfig {
            enabled: false,
            max_bytes_per_sec: 1000,
        };
        assert_eq!(config.effective_rate(), 0);
    }
}
