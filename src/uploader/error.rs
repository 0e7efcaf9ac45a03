//! 上传错误类型
//!
//! - `ValidationError`：文件校验失败，从不进入队列
//! - `UploadError`：文件进入队列后的失败（初始化 / 分片 / 合并 / 执行槽位）
//! - `ControlError`：调用编排器控制接口失败

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::uploader::task::FileStatus;

/// 文件被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RejectReason {
    /// 超过单文件大小上限
    TooLarge { limit: u64 },
    /// 文件类型不在允许列表中
    TypeNotAllowed { allowed: Vec<String> },
    /// 按当前分片大小切分后分片数超出分片编号范围
    TooManyChunks { chunk_size: u64 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::TooLarge { limit } => write!(f, "超过单文件大小上限 {} bytes", limit),
            RejectReason::TypeNotAllowed { allowed } => {
                write!(f, "文件类型不允许，允许的类型: {}", allowed.join(", "))
            }
            RejectReason::TooManyChunks { chunk_size } => {
                write!(f, "按分片大小 {} bytes 切分后分片数超过 {}", chunk_size, u32::MAX)
            }
        }
    }
}

/// 文件校验错误
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("文件 {name} ({size} bytes) 校验失败: {reason}")]
pub struct ValidationError {
    pub name: String,
    pub size: u64,
    pub reason: RejectReason,
}

/// 上传错误
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum UploadError {
    /// 文件校验失败
    #[error(transparent)]
    Validation(ValidationError),

    /// begin 回调失败
    #[error("初始化上传失败: {message}")]
    Initialization { message: String },

    /// 分片重试耗尽
    #[error("分片 #{part_number} 上传失败（已重试 {retries} 次）: {message}")]
    ChunkUpload {
        part_number: u32,
        retries: u32,
        message: String,
    },

    /// finalize 回调失败
    #[error("合并分片失败: {message}")]
    Finalize { message: String },

    /// 执行槽位故障
    #[error("执行槽位 {slot_id} 故障: {reason}")]
    Backend { slot_id: usize, reason: String },
}

impl UploadError {
    /// 错误类别名称
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::Validation(_) => "validation",
            UploadError::Initialization { .. } => "initialization",
            UploadError::ChunkUpload { .. } => "chunk_upload",
            UploadError::Finalize { .. } => "finalize",
            UploadError::Backend { .. } => "backend",
        }
    }
}

/// 控制接口错误
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControlError {
    /// 控制循环已退出
    #[error("上传编排器已关闭")]
    Closed,

    /// 文件不存在
    #[error("文件不存在: {0}")]
    NotFound(String),

    /// 当前状态不允许该操作
    #[error("文件 {file_id} 当前状态 {status} 不允许 {action}")]
    InvalidState {
        file_id: String,
        status: FileStatus,
        action: &'static str,
    },
}
