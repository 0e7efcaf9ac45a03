//! 快照数据结构

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::uploader::task::{FileRecord, FileStatus};

/// 快照格式版本，版本不一致的快照在加载时丢弃
pub const SNAPSHOT_VERSION: u32 = 1;

/// 单个文件的快照记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub file_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub uploaded_size: u64,
    pub progress: u8,
    pub status: FileStatus,
    pub total_chunks: u32,
    /// 已提交分片编号（升序）
    #[serde(default)]
    pub committed_parts: Vec<u32>,
    pub last_updated: DateTime<Utc>,
}

impl SnapshotRecord {
    /// 从文件记录生成快照
    pub fn from_record(record: &FileRecord) -> Self {
        Self {
            file_id: record.id.clone(),
            file_name: record.name.clone(),
            file_size: record.size,
            uploaded_size: record.uploaded_size,
            progress: record.progress,
            status: record.status,
            total_chunks: record.total_chunks,
            committed_parts: record.committed_part_numbers(),
            last_updated: Utc::now(),
        }
    }

    /// 是否已超过有效期
    pub fn is_expired(&self, now: DateTime<Utc>, ttl: chrono::Duration) -> bool {
        now.signed_duration_since(self.last_updated) > ttl
    }
}

/// 存储中的完整快照
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedState {
    pub version: u32,
    pub saved_at: DateTime<Utc>,
    #[serde(default)]
    pub records: Vec<SnapshotRecord>,
}

impl PersistedState {
    pub fn new(records: Vec<SnapshotRecord>) -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            records,
        }
    }
}
