//! 上传文件队列
//!
//! 负责文件校验、FIFO 排队，以及每个文件的记录和汇总统计。
//! 只由编排器控制循环访问。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::UploadConfig;
use crate::uploader::chunk::chunk_count;
use crate::uploader::error::{RejectReason, ValidationError};
use crate::uploader::source::{ByteSource, FileSource, MemorySource};
use crate::uploader::task::{FileRecord, FileStatus};

/// 待添加的上传文件
#[derive(Clone)]
pub struct UploadFile {
    /// 指定文件ID（恢复上传时沿用快照中的ID），None 时自动生成
    pub id: Option<String>,
    pub name: String,
    pub size: u64,
    pub mime_type: Option<String>,
    pub source: Arc<dyn ByteSource>,
}

impl UploadFile {
    pub fn new(name: impl Into<String>, size: u64, source: Arc<dyn ByteSource>) -> Self {
        let name = name.into();
        let mime_type = guess_mime_type(&name).map(str::to_string);
        Self {
            id: None,
            name,
            size,
            mime_type,
            source,
        }
    }

    /// 从本地文件创建
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("无法获取文件元数据: {:?}", path))?;
        if !metadata.is_file() {
            anyhow::bail!("不是普通文件: {:?}", path);
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .with_context(|| format!("无法获取文件名: {:?}", path))?;

        Ok(Self::new(
            name,
            metadata.len(),
            Arc::new(FileSource::new(path)),
        ))
    }

    /// 从内存数据创建
    pub fn from_bytes(name: impl Into<String>, data: Vec<u8>) -> Self {
        let source = MemorySource::new(data);
        let size = source.len();
        Self::new(name, size, Arc::new(source))
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

impl std::fmt::Debug for UploadFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadFile")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("size", &self.size)
            .field("mime_type", &self.mime_type)
            .finish_non_exhaustive()
    }
}

/// 按扩展名推断常见 MIME 类型
pub fn guess_mime_type(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    let mime = match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        "mp4" => "video/mp4",
        "mkv" => "video/x-matroska",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "flac" => "audio/flac",
        "txt" | "log" => "text/plain",
        "csv" => "text/csv",
        "html" | "htm" => "text/html",
        "json" => "application/json",
        "pdf" => "application/pdf",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        "tar" => "application/x-tar",
        _ => return None,
    };
    Some(mime)
}

/// 检查文件类型是否在允许列表中
///
/// - 空列表、`*`、`*/*`：不限制
/// - `.ext`：按文件名后缀匹配
/// - `type/*`：按 MIME 大类匹配
/// - 其他：MIME 类型精确匹配
///
/// 全部不区分大小写
pub fn is_type_allowed(allowed: &[String], name: &str, mime_type: Option<&str>) -> bool {
    if allowed.is_empty() {
        return true;
    }

    let name = name.to_lowercase();
    let mime = mime_type
        .map(|m| m.to_lowercase())
        .or_else(|| guess_mime_type(&name).map(str::to_string));

    allowed.iter().any(|pattern| {
        let pattern = pattern.trim().to_lowercase();
        if pattern == "*" || pattern == "*/*" {
            return true;
        }
        if pattern.starts_with('.') {
            return name.ends_with(&pattern);
        }
        let Some(mime) = mime.as_deref() else {
            return false;
        };
        match pattern.strip_suffix("/*") {
            Some(category) => mime.split('/').next() == Some(category),
            None => mime == pattern,
        }
    })
}

/// 队列统计
///
/// queued + active + paused + completed + failed == total
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub total: usize,
    pub queued: usize,
    /// 初始化中或上传中
    pub active: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
}

/// 批量添加结果
#[derive(Debug, Default)]
pub struct AddResult {
    pub accepted: Vec<FileRecord>,
    pub rejected: Vec<ValidationError>,
}

struct QueueEntry {
    record: FileRecord,
    source: Arc<dyn ByteSource>,
}

/// 上传文件队列
pub struct FileQueue {
    max_file_size: Option<u64>,
    allowed_types: Vec<String>,
    /// 分片大小，0 表示不检查分片数
    chunk_size: u64,
    /// 等待调度的文件ID（FIFO）
    pending: VecDeque<String>,
    entries: HashMap<String, QueueEntry>,
    /// 文件添加顺序，用于列表展示
    order: Vec<String>,
}

impl FileQueue {
    pub fn new(max_file_size: Option<u64>, allowed_types: Vec<String>) -> Self {
        Self {
            max_file_size,
            allowed_types,
            chunk_size: 0,
            pending: VecDeque::new(),
            entries: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn from_config(config: &UploadConfig) -> Self {
        Self::new(config.max_file_size, config.allowed_types.clone())
            .with_chunk_size(config.chunk_size)
    }

    /// 入队时按分片大小检查分片数是否超出范围
    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// 校验文件
    pub fn validate(&self, file: &UploadFile) -> Result<(), ValidationError> {
        if let Some(limit) = self.max_file_size {
            if file.size > limit {
                return Err(ValidationError {
                    name: file.name.clone(),
                    size: file.size,
                    reason: RejectReason::TooLarge { limit },
                });
            }
        }

        if self.chunk_size > 0 && chunk_count(file.size, self.chunk_size).is_none() {
            return Err(ValidationError {
                name: file.name.clone(),
                size: file.size,
                reason: RejectReason::TooManyChunks {
                    chunk_size: self.chunk_size,
                },
            });
        }

        if !is_type_allowed(&self.allowed_types, &file.name, file.mime_type.as_deref()) {
            return Err(ValidationError {
                name: file.name.clone(),
                size: file.size,
                reason: RejectReason::TypeNotAllowed {
                    allowed: self.allowed_types.clone(),
                },
            });
        }

        Ok(())
    }

    /// 校验并添加文件
    ///
    /// 校验失败的文件不会入队；通过的文件按顺序追加到队尾
    pub fn add_files(&mut self, files: Vec<UploadFile>) -> AddResult {
        let mut result = AddResult::default();

        for file in files {
            if let Err(err) = self.validate(&file) {
                warn!("文件校验失败，拒绝入队: {}", err);
                result.rejected.push(err);
                continue;
            }

            let id = match file.id {
                Some(id) if !self.entries.contains_key(&id) => id,
                Some(id) => {
                    let fresh = Uuid::new_v4().to_string();
                    warn!("文件ID {} 已存在，改用新ID {}", id, fresh);
                    fresh
                }
                None => Uuid::new_v4().to_string(),
            };

            let mut record = FileRecord::with_id(id.clone(), file.name, file.size);
            record.mime_type = file.mime_type;

            info!(
                "文件入队: id={}, name={}, size={} bytes",
                id, record.name, record.size
            );
            self.pending.push_back(id.clone());
            self.order.push(id.clone());
            self.entries.insert(
                id,
                QueueEntry {
                    record: record.clone(),
                    source: file.source,
                },
            );
            result.accepted.push(record);
        }

        result
    }

    /// 取出下一个排队文件（FIFO）
    pub fn get_next(&mut self) -> Option<String> {
        while let Some(id) = self.pending.pop_front() {
            match self.entries.get(&id) {
                Some(entry) if entry.record.status == FileStatus::Queued => return Some(id),
                _ => debug!("跳过已移除或状态已变化的排队文件: {}", id),
            }
        }
        None
    }

    /// 标记文件开始初始化
    pub fn activate(&mut self, id: &str) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.record.mark_initializing();
                true
            }
            None => false,
        }
    }

    /// 更新文件状态
    pub fn update_status(&mut self, id: &str, status: FileStatus) -> bool {
        let Some(entry) = self.entries.get_mut(id) else {
            return false;
        };
        match status {
            FileStatus::Initializing => entry.record.mark_initializing(),
            FileStatus::Uploading => entry.record.mark_uploading(),
            FileStatus::Paused => entry.record.mark_paused(),
            FileStatus::Complete => entry.record.mark_complete(),
            FileStatus::Queued | FileStatus::Error => entry.record.status = status,
        }
        true
    }

    /// 更新已上传字节数，返回新的进度百分比
    pub fn update_progress(&mut self, id: &str, uploaded_size: u64) -> Option<u8> {
        let entry = self.entries.get_mut(id)?;
        entry.record.set_uploaded(uploaded_size);
        Some(entry.record.progress)
    }

    pub fn get(&self, id: &str) -> Option<&FileRecord> {
        self.entries.get(id).map(|e| &e.record)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut FileRecord> {
        self.entries.get_mut(id).map(|e| &mut e.record)
    }

    /// 文件数据源
    pub fn source(&self, id: &str) -> Option<Arc<dyn ByteSource>> {
        self.entries.get(id).map(|e| e.source.clone())
    }

    /// 移除文件（取消上传）
    pub fn remove(&mut self, id: &str) -> Option<FileRecord> {
        let entry = self.entries.remove(id)?;
        self.pending.retain(|p| p != id);
        self.order.retain(|o| o != id);
        Some(entry.record)
    }

    /// 清除已完成和失败的文件记录，返回清除数量
    pub fn clear_finished(&mut self) -> usize {
        let finished: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.record.status.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();
        for id in &finished {
            self.remove(id);
        }
        if !finished.is_empty() {
            info!("已清除 {} 个结束的文件记录", finished.len());
        }
        finished.len()
    }

    /// 按添加顺序列出全部文件记录
    pub fn files(&self) -> Vec<FileRecord> {
        self.order
            .iter()
            .filter_map(|id| self.entries.get(id))
            .map(|e| e.record.clone())
            .collect()
    }

    /// 排队中的文件数量
    pub fn queued_len(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.record.status == FileStatus::Queued)
            .count()
    }

    /// 占用并发槽位的文件数量（初始化中、上传中、暂停）
    pub fn slot_holders(&self) -> usize {
        self.entries
            .values()
            .filter(|e| e.record.status.holds_slot())
            .count()
    }

    /// 未结束文件的剩余字节数
    pub fn remaining_bytes(&self) -> u64 {
        self.entries
            .values()
            .filter(|e| !e.record.status.is_terminal())
            .map(|e| e.record.size.saturating_sub(e.record.uploaded_size))
            .sum()
    }

    pub fn get_stats(&self) -> QueueStats {
        let mut stats = QueueStats {
            total: self.entries.len(),
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.record.status {
                FileStatus::Queued => stats.queued += 1,
                FileStatus::Initializing | FileStatus::Uploading => stats.active += 1,
                FileStatus::Paused => stats.paused += 1,
                FileStatus::Complete => stats.completed += 1,
                FileStatus::Error => stats.failed += 1,
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(name: &str, size: u64) -> UploadFile {
        UploadFile::from_bytes(name, vec![0u8; size as usize])
    }

    fn allow(patterns: &[&str]) -> Vec<String> {
        patterns.iter().map(|p| p.to_string()).collect()
    }

    #[test]
    fn test_type_patterns() {
        assert!(is_type_allowed(&[], "a.bin", None));
        assert!(is_type_allowed(&allow(&["*"]), "a.bin", None));
        assert!(is_type_allowed(&allow(&["*/*"]), "a.bin", None));

        // 扩展名，不区分大小写
        assert!(is_type_allowed(&allow(&[".JPG"]), "photo.jpg", None));
        assert!(is_type_allowed(&allow(&[".jpg"]), "PHOTO.JPG", None));
        assert!(!is_type_allowed(&allow(&[".jpg"]), "photo.png", None));

        // MIME 大类
        assert!(is_type_allowed(&allow(&["image/*"]), "photo.png", None));
        assert!(is_type_allowed(&allow(&["image/*"]), "x", Some("IMAGE/HEIC")));
        assert!(!is_type_allowed(&allow(&["image/*"]), "clip.mp4", None));

        // 精确 MIME
        assert!(is_type_allowed(&allow(&["application/pdf"]), "doc.pdf", None));
        assert!(!is_type_allowed(&allow(&["application/pdf"]), "doc.txt", None));

        // 未知类型只能通过扩展名或通配符
        assert!(!is_type_allowed(&allow(&["image/*"]), "noext", None));
    }

    #[test]
    fn test_rejects_file_with_too_many_chunks() {
        let mut queue = FileQueue::new(None, vec![]).with_chunk_size(1);
        let huge = UploadFile::new(
            "huge.bin",
            u32::MAX as u64 + 1,
            Arc::new(MemorySource::new(Vec::new())),
        );
        let result = queue.add_files(vec![huge, file("ok.bin", 8)]);

        assert_eq!(result.accepted.len(), 1);
        assert_eq!(result.rejected.len(), 1);
        assert_eq!(
            result.rejected[0].reason,
            RejectReason::TooManyChunks { chunk_size: 1 }
        );
        assert_eq!(queue.get_stats().total, 1);
    }

    #[test]
    fn test_add_files_validates_and_queues_fifo() {
        let mut queue = FileQueue::new(Some(100), allow(&["image/*", ".txt"]));
        let result = queue.add_files(vec![
            file("a.png", 10),
            file("big.png", 101),
            file("b.txt", 5),
            file("c.mp4", 5),
        ]);

        assert_eq!(result.accepted.len(), 2);
        assert_eq!(result.rejected.len(), 2);
        assert_eq!(
            result.rejected[0].reason,
            RejectReason::TooLarge { limit: 100 }
        );
        assert_eq!(result.rejected[1].name, "c.mp4");
        assert!(matches!(
            result.rejected[1].reason,
            RejectReason::TypeNotAllowed { .. }
        ));

        let first = queue.get_next().unwrap();
        assert_eq!(queue.get(&first).unwrap().name, "a.png");
        let second = queue.get_next().unwrap();
        assert_eq!(queue.get(&second).unwrap().name, "b.txt");
        assert!(queue.get_next().is_none());
    }

    #[test]
    fn test_ids_are_unique_and_caller_ids_kept() {
        let mut queue = FileQueue::new(None, allow(&["*"]));
        let result = queue.add_files(vec![
            file("a", 1),
            file("b", 1),
            file("c", 1).with_id("resume-1"),
            file("d", 1).with_id("resume-1"),
        ]);
        let ids: Vec<&str> = result.accepted.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids[2], "resume-1");
        assert_ne!(ids[0], ids[1]);
        // 重复的调用方ID被替换
        assert_ne!(ids[3], "resume-1");
    }

    #[test]
    fn test_stats_partition_sums_to_total() {
        let mut queue = FileQueue::new(None, vec![]);
        let ids: Vec<String> = queue
            .add_files((0..6).map(|i| file(&format!("f{}", i), 4)).collect())
            .accepted
            .into_iter()
            .map(|r| r.id)
            .collect();

        queue.activate(&ids[0]);
        queue.update_status(&ids[1], FileStatus::Uploading);
        queue.update_status(&ids[2], FileStatus::Paused);
        queue.update_status(&ids[3], FileStatus::Complete);
        queue.update_status(&ids[4], FileStatus::Error);

        let stats = queue.get_stats();
        assert_eq!(
            stats,
            QueueStats {
                total: 6,
                queued: 1,
                active: 2,
                paused: 1,
                completed: 1,
                failed: 1,
            }
        );
        assert_eq!(
            stats.queued + stats.active + stats.paused + stats.completed + stats.failed,
            stats.total
        );
        assert_eq!(queue.slot_holders(), 3);
    }

    #[test]
    fn test_remove_and_clear_finished() {
        let mut queue = FileQueue::new(None, vec![]);
        let ids: Vec<String> = queue
            .add_files(vec![file("a", 1), file("b", 1), file("c", 1)])
            .accepted
            .into_iter()
            .map(|r| r.id)
            .collect();

        assert!(queue.remove(&ids[0]).is_some());
        assert!(queue.remove(&ids[0]).is_none());
        // 被移除的文件不会再出队
        assert_eq!(queue.get_next().as_deref(), Some(ids[1].as_str()));

        queue.update_status(&ids[1], FileStatus::Complete);
        assert_eq!(queue.clear_finished(), 1);
        assert_eq!(queue.files().len(), 1);
        assert_eq!(queue.files()[0].id, ids[2]);
    }

    #[test]
    fn test_progress_and_remaining_bytes() {
        let mut queue = FileQueue::new(None, vec![]);
        let id = queue.add_files(vec![file("a", 200)]).accepted[0].id.clone();
        assert_eq!(queue.update_progress(&id, 50), Some(25));
        assert_eq!(queue.remaining_bytes(), 150);
        assert_eq!(queue.update_progress("missing", 1), None);
    }

    #[tokio::test]
    async fn test_upload_file_from_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.pdf");
        tokio::fs::write(&path, b"hello").await.unwrap();

        let upload = UploadFile::from_path(&path).await.unwrap();
        assert_eq!(upload.name, "report.pdf");
        assert_eq!(upload.size, 5);
        assert_eq!(upload.mime_type.as_deref(), Some("application/pdf"));
        assert_eq!(upload.source.read_range(1..3).await.unwrap(), b"el".to_vec());

        assert!(UploadFile::from_path(dir.path()).await.is_err());
    }
}
