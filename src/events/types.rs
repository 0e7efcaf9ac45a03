//! 上传事件类型定义
//!
//! 编排器在每次状态变更时发布事件，调用方通过 `subscribe()` 接收

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::common::metrics::PerformanceSnapshot;
use crate::uploader::error::{UploadError, ValidationError};
use crate::uploader::queue::QueueStats;

/// 事件优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EventPriority {
    /// 低优先级：进度、性能更新
    Low = 0,
    /// 中优先级：状态变更
    Medium = 1,
    /// 高优先级：完成、失败、删除等关键事件
    High = 2,
}

/// 上传事件
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum UploadEvent {
    /// 文件进入队列
    FileAdded {
        file_id: String,
        name: String,
        size: u64,
    },
    /// 文件被拒绝（校验失败，从未入队）
    FileRejected { error: ValidationError },
    /// 进度更新
    FileProgress {
        file_id: String,
        uploaded_size: u64,
        total_size: u64,
        progress: u8,
        completed_chunks: u32,
        total_chunks: u32,
    },
    /// 服务端确认上传成功（finalize 返回或 begin 要求跳过）
    FileSuccess {
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        url: Option<String>,
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        extra: HashMap<String, String>,
        /// 服务器已有该文件，未上传任何分片
        #[serde(default)]
        skipped: bool,
    },
    /// 文件失败（终态）
    FileError {
        file_id: String,
        name: String,
        size: u64,
        error: UploadError,
    },
    /// 文件离开活跃集合并标记为完成
    FileComplete {
        file_id: String,
        name: String,
        size: u64,
        completed_at: i64,
    },
    /// 文件暂停
    FilePaused { file_id: String },
    /// 文件恢复
    FileResumed { file_id: String },
    /// 文件被取消并移除
    FileRemoved { file_id: String },
    /// 队列空闲：没有活跃文件也没有排队文件
    AllComplete { stats: QueueStats },
    /// 性能指标更新
    PerformanceUpdate { performance: PerformanceSnapshot },
}

impl UploadEvent {
    /// 获取文件 ID
    pub fn file_id(&self) -> Option<&str> {
        match self {
            UploadEvent::FileAdded { file_id, .. } => Some(file_id),
            UploadEvent::FileProgress { file_id, .. } => Some(file_id),
            UploadEvent::FileSuccess { file_id, .. } => Some(file_id),
            UploadEvent::FileError { file_id, .. } => Some(file_id),
            UploadEvent::FileComplete { file_id, .. } => Some(file_id),
            UploadEvent::FilePaused { file_id } => Some(file_id),
            UploadEvent::FileResumed { file_id } => Some(file_id),
            UploadEvent::FileRemoved { file_id } => Some(file_id),
            UploadEvent::FileRejected { .. }
            | UploadEvent::AllComplete { .. }
            | UploadEvent::PerformanceUpdate { .. } => None,
        }
    }

    /// 获取事件优先级
    pub fn priority(&self) -> EventPriority {
        match self {
            UploadEvent::FileProgress { .. } => EventPriority::Low,
            UploadEvent::PerformanceUpdate { .. } => EventPriority::Low,
            UploadEvent::FileAdded { .. } => EventPriority::Medium,
            UploadEvent::FilePaused { .. } => EventPriority::Medium,
            UploadEvent::FileResumed { .. } => EventPriority::Medium,
            UploadEvent::FileSuccess { .. } => EventPriority::High,
            UploadEvent::FileError { .. } => EventPriority::High,
            UploadEvent::FileComplete { .. } => EventPriority::High,
            UploadEvent::FileRejected { .. } => EventPriority::High,
            UploadEvent::FileRemoved { .. } => EventPriority::High,
            UploadEvent::AllComplete { .. } => EventPriority::High,
        }
    }

    /// 获取事件类型名称
    pub fn event_type_name(&self) -> &'static str {
        match self {
            UploadEvent::FileAdded { .. } => "file_added",
            UploadEvent::FileRejected { .. } => "file_rejected",
            UploadEvent::FileProgress { .. } => "file_progress",
            UploadEvent::FileSuccess { .. } => "file_success",
            UploadEvent::FileError { .. } => "file_error",
            UploadEvent::FileComplete { .. } => "file_complete",
            UploadEvent::FilePaused { .. } => "file_paused",
            UploadEvent::FileResumed { .. } => "file_resumed",
            UploadEvent::FileRemoved { .. } => "file_removed",
            UploadEvent::AllComplete { .. } => "all_complete",
            UploadEvent::PerformanceUpdate { .. } => "performance_update",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uploader::error::RejectReason;

    #[test]
    fn test_upload_event_serialization() {
        let event = UploadEvent::FileProgress {
            file_id: "f1".to_string(),
            uploaded_size: 512,
            total_size: 1024,
            progress: 50,
            completed_chunks: 1,
            total_chunks: 2,
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"event_type\":\"file_progress\""));
        assert!(json.contains("\"file_id\":\"f1\""));

        let parsed: UploadEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.file_id(), Some("f1"));
        assert_eq!(parsed.event_type_name(), "file_progress");
    }

    #[test]
    fn test_rejected_event_carries_identity() {
        let event = UploadEvent::FileRejected {
            error: ValidationError {
                name: "movie.mkv".to_string(),
                size: 10,
                reason: RejectReason::TypeNotAllowed {
                    allowed: vec!["image/*".to_string()],
                },
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "file_rejected");
        assert_eq!(json["error"]["name"], "movie.mkv");
        assert_eq!(json["error"]["reason"]["kind"], "type_not_allowed");
        assert!(event.file_id().is_none());
    }

    #[test]
    fn test_event_priority() {
        let progress = UploadEvent::FileProgress {
            file_id: "f".to_string(),
            uploaded_size: 0,
            total_size: 0,
            progress: 0,
            completed_chunks: 0,
            total_chunks: 0,
        };
        let removed = UploadEvent::FileRemoved {
            file_id: "f".to_string(),
        };
        let paused = UploadEvent::FilePaused {
            file_id: "f".to_string(),
        };

        assert_eq!(progress.priority(), EventPriority::Low);
        assert_eq!(paused.priority(), EventPriority::Medium);
        assert_eq!(removed.priority(), EventPriority::High);
        assert!(removed.priority() > progress.priority());
    }
}
