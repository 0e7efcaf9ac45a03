// 上传文件记录

use crate::uploader::chunk::CommittedPart;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// 文件上传状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// 排队中
    Queued,
    /// 初始化中（begin 回调）
    Initializing,
    /// 上传中
    Uploading,
    /// 已暂停
    Paused,
    /// 失败
    Error,
    /// 已完成
    Complete,
}

impl FileStatus {
    /// 是否为终态
    pub fn is_terminal(&self) -> bool {
        matches!(self, FileStatus::Error | FileStatus::Complete)
    }

    /// 是否占用文件并发槽位
    pub fn holds_slot(&self) -> bool {
        matches!(
            self,
            FileStatus::Initializing | FileStatus::Uploading | FileStatus::Paused
        )
    }
}

impl std::fmt::Display for FileStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FileStatus::Queued => "queued",
            FileStatus::Initializing => "initializing",
            FileStatus::Uploading => "uploading",
            FileStatus::Paused => "paused",
            FileStatus::Error => "error",
            FileStatus::Complete => "complete",
        };
        write!(f, "{}", s)
    }
}

/// 文件记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    /// 文件ID
    pub id: String,
    /// 文件名
    pub name: String,
    /// 文件大小
    pub size: u64,
    /// MIME 类型
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    /// 已上传大小
    pub uploaded_size: u64,
    /// 进度百分比（0-100，四舍五入）
    pub progress: u8,
    /// 状态
    pub status: FileStatus,
    /// 分片总数
    pub total_chunks: u32,
    /// 已提交分片（按分片编号）
    #[serde(default)]
    pub parts: BTreeMap<u32, CommittedPart>,
    /// begin 返回的上传ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    /// 错误信息
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// 创建时间 (Unix timestamp)
    pub created_at: i64,
    /// 开始时间 (Unix timestamp)
    pub started_at: Option<i64>,
    /// 完成时间 (Unix timestamp)
    pub completed_at: Option<i64>,
}

impl FileRecord {
    /// 创建新的文件记录
    pub fn new(name: String, size: u64) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), name, size)
    }

    /// 使用指定ID创建（恢复上传时沿用快照中的ID）
    pub fn with_id(id: String, name: String, size: u64) -> Self {
        Self {
            id,
            name,
            size,
            mime_type: None,
            uploaded_size: 0,
            progress: 0,
            status: FileStatus::Queued,
            total_chunks: 0,
            parts: BTreeMap::new(),
            upload_id: None,
            error: None,
            created_at: chrono::Utc::now().timestamp(),
            started_at: None,
            completed_at: None,
        }
    }

    /// 计算进度百分比
    pub fn calculate_progress(uploaded_size: u64, size: u64) -> u8 {
        if size == 0 {
            return 0;
        }
        let ratio = uploaded_size.min(size) as f64 / size as f64;
        (ratio * 100.0).round() as u8
    }

    /// 更新已上传大小和进度
    pub fn set_uploaded(&mut self, uploaded_size: u64) {
        self.uploaded_size = uploaded_size.min(self.size);
        self.progress = Self::calculate_progress(self.uploaded_size, self.size);
    }

    /// 记录已提交分片（同一编号只保留最新一次）
    pub fn commit_part(&mut self, part: CommittedPart) {
        self.parts.insert(part.part_number, part);
    }

    /// 按分片编号排序后的已提交分片
    pub fn sorted_parts(&self) -> Vec<CommittedPart> {
        self.parts.values().cloned().collect()
    }

    /// 已提交分片编号（升序）
    pub fn committed_part_numbers(&self) -> Vec<u32> {
        self.parts.keys().copied().collect()
    }

    /// 标记为初始化中
    pub fn mark_initializing(&mut self) {
        self.status = FileStatus::Initializing;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为上传中
    pub fn mark_uploading(&mut self) {
        self.status = FileStatus::Uploading;
        if self.started_at.is_none() {
            self.started_at = Some(chrono::Utc::now().timestamp());
        }
    }

    /// 标记为暂停
    pub fn mark_paused(&mut self) {
        self.status = FileStatus::Paused;
    }

    /// 标记为已完成
    pub fn mark_complete(&mut self) {
        self.status = FileStatus::Complete;
        self.completed_at = Some(chrono::Utc::now().timestamp());
        self.set_uploaded(self.size);
        self.progress = 100;
        self.error = None;
    }

    /// 标记为失败
    pub fn mark_error(&mut self, error: String) {
        self.status = FileStatus::Error;
        self.error = Some(error);
    }
}
