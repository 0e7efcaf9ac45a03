// Chunk Uploader Library
// 分片上传编排核心库

// 配置管理模块
pub mod config;

// 日志模块
pub mod logging;

// 上传引擎模块
pub mod uploader;

// 上传事件模块
pub mod events;

// 上传状态持久化模块
pub mod persistence;

// 公共模块（性能统计）
pub mod common;

// 导出常用类型
pub use common::{MetricsAggregator, PerformanceSnapshot};
pub use config::AppConfig;
pub use events::{EventBus, UploadEvent};
pub use persistence::{KvStore, SnapshotRecord};
pub use uploader::{
    ControlError, FileRecord, FileStatus, LocalDirTransport, QueueStats, UploadError, UploadFile,
    UploadOrchestrator, UploadTransport,
};
