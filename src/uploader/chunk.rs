// 上传分片管理
//
// 分片规则：
// - 分片编号从 1 开始连续递增，共 ceil(size / chunk_size) 个
// - 分片字节范围首尾相接，完整覆盖 [0, size)
// - 零字节文件没有分片，直接进入合并阶段
//
// 每个文件维护三组分片：
// - waiting：等待上传（按编号升序出队）
// - pending：正在上传（同一编号同一时刻最多一个）
// - cooling：失败后等待重试延迟结束
// 已上传分片只保留编号和大小，用于计算已上传字节数

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Range;
use tracing::{debug, info, warn};

/// 分片状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkStatus {
    /// 等待上传
    Waiting,
    /// 上传中
    Pending,
    /// 已上传
    Uploaded,
    /// 上传失败（等待重试）
    Error,
}

/// 上传分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkTask {
    /// 分片编号（从 1 开始）
    pub part_number: u32,
    /// 字节范围 [start, end)
    pub range: Range<u64>,
    /// 分片状态
    pub status: ChunkStatus,
    /// 已重试次数
    pub retry_count: u32,
}

impl ChunkTask {
    pub fn new(part_number: u32, range: Range<u64>) -> Self {
        Self {
            part_number,
            range,
            status: ChunkStatus::Waiting,
            retry_count: 0,
        }
    }

    /// 分片大小
    pub fn size(&self) -> u64 {
        self.range.end - self.range.start
    }
}

/// 服务器返回的已存在分片
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExistingPart {
    /// 分片编号
    #[serde(alias = "PartNumber", alias = "partNumber")]
    pub part_number: u32,
    /// 服务器返回的分片标识
    #[serde(alias = "ETag")]
    pub etag: String,
    /// 分片大小，缺失或为 0 时按分片规则推断
    #[serde(default, alias = "Size")]
    pub size: Option<u64>,
}

impl ExistingPart {
    pub fn new(part_number: u32, etag: impl Into<String>, size: Option<u64>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
            size,
        }
    }
}

/// 已提交分片（合并时按编号排序后交给 finalize）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommittedPart {
    pub part_number: u32,
    pub etag: String,
    pub size: u64,
}

/// 失败分片的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// 重新排队，附带新的重试次数
    Requeued { retry_count: u32 },
    /// 进入冷却，延迟结束后调用 `release_retry` 重新排队
    Deferred { retry_count: u32 },
    /// 已超过重试上限
    Exhausted { retry_count: u32 },
}

/// 断点续传对账被拒绝的原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileRejection {
    /// 多个分片的 etag 完全相同（服务器返回异常）
    IdenticalEtags { parts: usize },
    /// 分片编号超出范围
    PartOutOfRange { part_number: u32, total_chunks: u32 },
}

impl std::fmt::Display for ReconcileRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReconcileRejection::IdenticalEtags { parts } => {
                write!(f, "{} 个分片的 etag 完全相同", parts)
            }
            ReconcileRejection::PartOutOfRange {
                part_number,
                total_chunks,
            } => write!(f, "分片编号 {} 超出范围 [1, {}]", part_number, total_chunks),
        }
    }
}

/// 断点续传对账结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// 服务器没有已存在分片
    Empty,
    /// 对账通过：返回被采纳的分片以及对账后的已上传字节数
    Accepted {
        parts: Vec<CommittedPart>,
        uploaded_size: u64,
    },
    /// 对账被拒绝：丢弃全部已存在分片，从头上传
    Rejected(ReconcileRejection),
}

/// 计算分片数量，超出 u32 分片编号范围时返回 None
pub fn chunk_count(size: u64, chunk_size: u64) -> Option<u32> {
    if chunk_size == 0 {
        return Some(0);
    }
    u32::try_from(size.div_ceil(chunk_size)).ok()
}

/// 计算分片数量（超出范围时取 u32::MAX，入队校验已拒绝这类文件）
pub fn total_chunks(size: u64, chunk_size: u64) -> u32 {
    chunk_count(size, chunk_size).unwrap_or(u32::MAX)
}

/// 计算分片（纯函数）
///
/// 分片数超出 u32 范围时返回空列表
pub fn plan_chunks(size: u64, chunk_size: u64) -> Vec<ChunkTask> {
    let count = match chunk_count(size, chunk_size) {
        Some(count) if chunk_size > 0 => count,
        _ => return Vec::new(),
    };

    (1..=count)
        .map(|part_number| {
            let start = (part_number as u64 - 1) * chunk_size;
            let end = start.saturating_add(chunk_size).min(size);
            ChunkTask::new(part_number, start..end)
        })
        .collect()
}

/// 单个文件的分片状态
#[derive(Debug)]
struct FileChunks {
    size: u64,
    total_chunks: u32,
    waiting: BTreeMap<u32, ChunkTask>,
    pending: HashMap<u32, ChunkTask>,
    cooling: HashMap<u32, ChunkTask>,
    /// 已上传分片：编号 -> 大小
    uploaded: BTreeMap<u32, u64>,
}

impl FileChunks {
    fn new(size: u64, chunk_size: u64) -> Self {
        let waiting = plan_chunks(size, chunk_size)
            .into_iter()
            .map(|c| (c.part_number, c))
            .collect();
        Self {
            size,
            total_chunks: total_chunks(size, chunk_size),
            waiting,
            pending: HashMap::new(),
            cooling: HashMap::new(),
            uploaded: BTreeMap::new(),
        }
    }

    /// 按分片规则推断分片大小
    fn expected_size(&self, part_number: u32, chunk_size: u64) -> u64 {
        if part_number == self.total_chunks {
            self.size - (part_number as u64 - 1) * chunk_size
        } else {
            chunk_size
        }
    }
}

/// 分片状态存储
///
/// 所有方法只由编排器控制循环调用，内部不加锁
#[derive(Debug)]
pub struct ChunkStateStore {
    chunk_size: u64,
    files: HashMap<String, FileChunks>,
}

impl ChunkStateStore {
    pub fn new(chunk_size: u64) -> Self {
        Self {
            chunk_size,
            files: HashMap::new(),
        }
    }

    /// 分片大小
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// 为文件建立分片队列，返回分片数量
    ///
    /// 已存在的同名队列会被重建
    pub fn prepare_queue(&mut self, file_id: &str, size: u64) -> u32 {
        let state = FileChunks::new(size, self.chunk_size);
        let count = state.total_chunks;
        info!(
            "创建分片队列: file_id={}, 文件大小={} bytes, 分片大小={} bytes, 分片数量={}",
            file_id, size, self.chunk_size, count
        );
        self.files.insert(file_id.to_string(), state);
        count
    }

    /// 是否存在该文件的分片队列
    pub fn contains(&self, file_id: &str) -> bool {
        self.files.contains_key(file_id)
    }

    /// 取出编号最小的等待分片
    pub fn get_next(&mut self, file_id: &str) -> Option<ChunkTask> {
        let state = self.files.get_mut(file_id)?;
        state.waiting.pop_first().map(|(_, chunk)| chunk)
    }

    /// 标记分片上传中
    ///
    /// 同一编号已在上传中时返回 false
    pub fn mark_pending(&mut self, file_id: &str, mut chunk: ChunkTask) -> bool {
        let Some(state) = self.files.get_mut(file_id) else {
            return false;
        };
        if state.pending.contains_key(&chunk.part_number)
            || state.uploaded.contains_key(&chunk.part_number)
        {
            warn!(
                "分片重复调度被拒绝: file_id={}, part={}",
                file_id, chunk.part_number
            );
            return false;
        }
        chunk.status = ChunkStatus::Pending;
        state.pending.insert(chunk.part_number, chunk);
        true
    }

    /// 查询上传中的分片
    pub fn pending_chunk(&self, file_id: &str, part_number: u32) -> Option<&ChunkTask> {
        self.files.get(file_id)?.pending.get(&part_number)
    }

    /// 标记分片已上传，返回分片大小
    ///
    /// 分片不在上传中（已取消或重复回调）时返回 None
    pub fn mark_uploaded(&mut self, file_id: &str, part_number: u32) -> Option<u64> {
        let state = self.files.get_mut(file_id)?;
        let chunk = state.pending.remove(&part_number)?;
        let size = chunk.size();
        state.uploaded.insert(part_number, size);
        debug!(
            "分片上传完成: file_id={}, part={}, size={}",
            file_id, part_number, size
        );
        Some(size)
    }

    /// 标记分片失败
    ///
    /// 重试次数未超过 `max_retries` 时重新排队（`defer` 为 true 时进入冷却），
    /// 否则返回 Exhausted。分片不在上传中时返回 None
    pub fn mark_failed(
        &mut self,
        file_id: &str,
        part_number: u32,
        max_retries: u32,
        defer: bool,
    ) -> Option<RetryDecision> {
        let state = self.files.get_mut(file_id)?;
        let mut chunk = state.pending.remove(&part_number)?;

        if chunk.retry_count >= max_retries {
            chunk.status = ChunkStatus::Error;
            return Some(RetryDecision::Exhausted {
                retry_count: chunk.retry_count,
            });
        }

        chunk.retry_count += 1;
        let retry_count = chunk.retry_count;
        if defer {
            chunk.status = ChunkStatus::Error;
            state.cooling.insert(part_number, chunk);
            Some(RetryDecision::Deferred { retry_count })
        } else {
            chunk.status = ChunkStatus::Waiting;
            state.waiting.insert(part_number, chunk);
            Some(RetryDecision::Requeued { retry_count })
        }
    }

    /// 上传中的分片退回等待队列（不计重试次数）
    pub fn requeue_pending(&mut self, file_id: &str, part_number: u32) -> bool {
        let Some(state) = self.files.get_mut(file_id) else {
            return false;
        };
        match state.pending.remove(&part_number) {
            Some(mut chunk) => {
                chunk.status = ChunkStatus::Waiting;
                state.waiting.insert(part_number, chunk);
                true
            }
            None => false,
        }
    }

    /// 冷却结束，分片重新排队
    pub fn release_retry(&mut self, file_id: &str, part_number: u32) -> bool {
        let Some(state) = self.files.get_mut(file_id) else {
            return false;
        };
        match state.cooling.remove(&part_number) {
            Some(mut chunk) => {
                chunk.status = ChunkStatus::Waiting;
                state.waiting.insert(part_number, chunk);
                true
            }
            None => false,
        }
    }

    /// 已上传字节数
    pub fn calculate_uploaded_size(&self, file_id: &str) -> u64 {
        self.files
            .get(file_id)
            .map(|s| s.uploaded.values().sum())
            .unwrap_or(0)
    }

    /// 已上传分片编号（升序）
    pub fn uploaded_parts(&self, file_id: &str) -> Vec<u32> {
        self.files
            .get(file_id)
            .map(|s| s.uploaded.keys().copied().collect())
            .unwrap_or_default()
    }

    /// 上传中分片数量
    pub fn pending_count(&self, file_id: &str) -> usize {
        self.files.get(file_id).map(|s| s.pending.len()).unwrap_or(0)
    }

    /// 等待分片数量
    pub fn waiting_count(&self, file_id: &str) -> usize {
        self.files.get(file_id).map(|s| s.waiting.len()).unwrap_or(0)
    }

    /// 分片总数
    pub fn total_chunks(&self, file_id: &str) -> u32 {
        self.files.get(file_id).map(|s| s.total_chunks).unwrap_or(0)
    }

    /// 是否全部完成
    pub fn is_complete(&self, file_id: &str) -> bool {
        self.files
            .get(file_id)
            .map(|s| s.waiting.is_empty() && s.pending.is_empty() && s.cooling.is_empty())
            .unwrap_or(false)
    }

    /// 丢弃文件的全部分片状态
    pub fn remove(&mut self, file_id: &str) -> bool {
        self.files.remove(file_id).is_some()
    }

    /// 断点续传对账
    ///
    /// 1. 缺失或为 0 的分片大小按分片规则推断
    /// 2. 所有 etag 相同（且多于一个分片）或编号越界时整体拒绝
    /// 3. 否则将有效分片标记为已上传并移出等待队列
    ///
    /// etag 全部相同只是经验判断：分片很少的合法上传也可能被误拒
    pub fn resume_from_parts(&mut self, file_id: &str, parts: &[ExistingPart]) -> ReconcileOutcome {
        let chunk_size = self.chunk_size;
        let Some(state) = self.files.get_mut(file_id) else {
            return ReconcileOutcome::Empty;
        };
        if parts.is_empty() {
            return ReconcileOutcome::Empty;
        }

        if let Some(out_of_range) = parts
            .iter()
            .find(|p| p.part_number == 0 || p.part_number > state.total_chunks)
        {
            let rejection = ReconcileRejection::PartOutOfRange {
                part_number: out_of_range.part_number,
                total_chunks: state.total_chunks,
            };
            warn!("断点续传对账被拒绝: file_id={}, {}", file_id, rejection);
            return ReconcileOutcome::Rejected(rejection);
        }

        if parts.len() > 1 && parts.iter().all(|p| p.etag == parts[0].etag) {
            let rejection = ReconcileRejection::IdenticalEtags { parts: parts.len() };
            warn!("断点续传对账被拒绝: file_id={}, {}", file_id, rejection);
            return ReconcileOutcome::Rejected(rejection);
        }

        let mut seen = HashSet::new();
        let mut accepted = Vec::new();
        for part in parts {
            if !seen.insert(part.part_number) {
                debug!(
                    "忽略重复的已存在分片: file_id={}, part={}",
                    file_id, part.part_number
                );
                continue;
            }

            let expected = state.expected_size(part.part_number, chunk_size);
            if let Some(reported) = part.size.filter(|s| *s > 0 && *s != expected) {
                warn!(
                    "已存在分片大小与预期不符，按预期大小计算: file_id={}, part={}, 服务器={}, 预期={}",
                    file_id, part.part_number, reported, expected
                );
            }

            // 已在上传中的分片交给正常回调处理
            if state.pending.contains_key(&part.part_number) {
                continue;
            }
            let planned = state
                .waiting
                .remove(&part.part_number)
                .or_else(|| state.cooling.remove(&part.part_number))
                .map(|c| c.size())
                .unwrap_or(expected);
            state.uploaded.insert(part.part_number, planned);

            accepted.push(CommittedPart {
                part_number: part.part_number,
                etag: part.etag.clone(),
                size: planned,
            });
        }

        let uploaded_size = state.uploaded.values().sum();
        info!(
            "断点续传对账完成: file_id={}, 采纳分片={}, 已上传={} bytes",
            file_id,
            accepted.len(),
            uploaded_size
        );
        ReconcileOutcome::Accepted {
            parts: accepted,
            uploaded_size,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_chunk_creation() {
        let chunk = ChunkTask::new(1, 0..1024);
        assert_eq!(chunk.part_number, 1);
        assert_eq!(chunk.size(), 1024);
        assert_eq!(chunk.status, ChunkStatus::Waiting);
        assert_eq!(chunk.retry_count, 0);
    }

    #[test]
    fn test_plan_chunks_with_partial_tail() {
        let chunks = plan_chunks(12 * MIB, 5 * MIB);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].range, 0..5 * MIB);
        assert_eq!(chunks[1].range, 5 * MIB..10 * MIB);
        assert_eq!(chunks[2].range, 10 * MIB..12 * MIB);
        let numbers: Vec<u32> = chunks.iter().map(|c| c.part_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);

        let mut store = ChunkStateStore::new(5 * MIB);
        assert_eq!(store.prepare_queue("f", 12 * MIB), 3);
        assert_eq!(store.total_chunks("f"), 3);
    }

    #[test]
    fn test_chunk_count_beyond_part_number_range() {
        assert_eq!(chunk_count(u32::MAX as u64, 1), Some(u32::MAX));
        assert_eq!(chunk_count(u32::MAX as u64 + 1, 1), None);
        assert_eq!(chunk_count(u64::MAX, 1), None);
        assert_eq!(total_chunks(u64::MAX, 1), u32::MAX);
        assert!(plan_chunks(u64::MAX, 1).is_empty());

        // 最后一个分片紧贴 u64 上限时不溢出
        let chunks = plan_chunks(u64::MAX, u64::MAX / 2);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].range.end, u64::MAX);
    }

    #[test]
    fn test_zero_size_file_has_no_chunks() {
        let mut store = ChunkStateStore::new(5 * MIB);
        assert_eq!(store.prepare_queue("empty", 0), 0);
        assert!(store.get_next("empty").is_none());
        assert!(store.is_complete("empty"));
    }

    #[test]
    fn test_uploaded_size_for_first_and_last_parts() {
        let mut store = ChunkStateStore::new(5 * MIB);
        store.prepare_queue("f", 12 * MIB);

        // 取出全部分片并标记上传中
        while let Some(chunk) = store.get_next("f") {
            assert!(store.mark_pending("f", chunk));
        }
        assert_eq!(store.mark_uploaded("f", 1), Some(5 * MIB));
        assert_eq!(store.mark_uploaded("f", 3), Some(2 * MIB));
        assert_eq!(store.calculate_uploaded_size("f"), 7 * MIB);
        assert_eq!(store.uploaded_parts("f"), vec![1, 3]);
        assert!(!store.is_complete("f"));

        store.mark_uploaded("f", 2);
        assert!(store.is_complete("f"));
    }

    #[test]
    fn test_get_next_returns_lowest_part() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 16);

        let first = store.get_next("f").unwrap();
        assert_eq!(first.part_number, 1);
        store.mark_pending("f", first);
        let second = store.get_next("f").unwrap();
        assert_eq!(second.part_number, 2);
        store.mark_pending("f", second);

        // 分片 1 失败后重新排队，应先于 3 出队
        let decision = store.mark_failed("f", 1, 3, false);
        assert_eq!(decision, Some(RetryDecision::Requeued { retry_count: 1 }));
        let next = store.get_next("f").unwrap();
        assert_eq!(next.part_number, 1);
        assert_eq!(next.retry_count, 1);
    }

    #[test]
    fn test_duplicate_pending_rejected() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 8);
        let chunk = store.get_next("f").unwrap();
        assert!(store.mark_pending("f", chunk.clone()));
        assert!(!store.mark_pending("f", chunk));
        assert_eq!(store.pending_count("f"), 1);
    }

    #[test]
    fn test_retry_ceiling() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 4);

        for expected in 1..=2 {
            let chunk = store.get_next("f").unwrap();
            store.mark_pending("f", chunk);
            assert_eq!(
                store.mark_failed("f", 1, 2, false),
                Some(RetryDecision::Requeued {
                    retry_count: expected
                })
            );
        }

        let chunk = store.get_next("f").unwrap();
        store.mark_pending("f", chunk);
        assert_eq!(
            store.mark_failed("f", 1, 2, false),
            Some(RetryDecision::Exhausted { retry_count: 2 })
        );
    }

    #[test]
    fn test_deferred_retry_blocks_completion() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 4);
        let chunk = store.get_next("f").unwrap();
        store.mark_pending("f", chunk);

        assert_eq!(
            store.mark_failed("f", 1, 3, true),
            Some(RetryDecision::Deferred { retry_count: 1 })
        );
        assert!(store.get_next("f").is_none());
        assert!(!store.is_complete("f"));

        assert!(store.release_retry("f", 1));
        assert!(!store.release_retry("f", 1));
        assert_eq!(store.get_next("f").unwrap().part_number, 1);
    }

    #[test]
    fn test_requeue_pending_keeps_retry_count() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 8);
        let chunk = store.get_next("f").unwrap();
        store.mark_pending("f", chunk);

        assert!(store.requeue_pending("f", 1));
        assert!(!store.requeue_pending("f", 1));
        assert_eq!(store.pending_count("f"), 0);
        let chunk = store.get_next("f").unwrap();
        assert_eq!(chunk.part_number, 1);
        assert_eq!(chunk.retry_count, 0);
    }

    #[test]
    fn test_mark_uploaded_ignores_unknown_part() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 8);
        assert_eq!(store.mark_uploaded("f", 1), None);
        assert_eq!(store.mark_uploaded("missing", 1), None);
        assert_eq!(store.mark_failed("f", 2, 3, false), None);
    }

    #[test]
    fn test_resume_rejects_identical_etags() {
        let mut store = ChunkStateStore::new(5 * MIB);
        store.prepare_queue("f", 12 * MIB);

        let parts = vec![
            ExistingPart::new(1, "X", Some(5 * MIB)),
            ExistingPart::new(2, "X", Some(5 * MIB)),
        ];
        let outcome = store.resume_from_parts("f", &parts);
        assert_eq!(
            outcome,
            ReconcileOutcome::Rejected(ReconcileRejection::IdenticalEtags { parts: 2 })
        );
        // 等待队列保持不变
        assert_eq!(store.waiting_count("f"), 3);
        assert_eq!(store.calculate_uploaded_size("f"), 0);
    }

    #[test]
    fn test_resume_single_part_with_any_etag_is_accepted() {
        let mut store = ChunkStateStore::new(5 * MIB);
        store.prepare_queue("f", 12 * MIB);
        let outcome = store.resume_from_parts("f", &[ExistingPart::new(1, "X", None)]);
        assert!(matches!(outcome, ReconcileOutcome::Accepted { .. }));
        assert_eq!(store.waiting_count("f"), 2);
    }

    #[test]
    fn test_resume_rejects_out_of_range() {
        let mut store = ChunkStateStore::new(5 * MIB);
        store.prepare_queue("f", 12 * MIB);

        let parts = vec![
            ExistingPart::new(1, "a", None),
            ExistingPart::new(4, "b", None),
        ];
        let outcome = store.resume_from_parts("f", &parts);
        assert_eq!(
            outcome,
            ReconcileOutcome::Rejected(ReconcileRejection::PartOutOfRange {
                part_number: 4,
                total_chunks: 3
            })
        );
        assert_eq!(store.waiting_count("f"), 3);
    }

    #[test]
    fn test_resume_infers_missing_sizes() {
        let mut store = ChunkStateStore::new(5 * MIB);
        store.prepare_queue("f", 12 * MIB);

        let parts = vec![
            ExistingPart::new(1, "a", None),
            ExistingPart::new(3, "c", Some(0)),
        ];
        match store.resume_from_parts("f", &parts) {
            ReconcileOutcome::Accepted {
                parts,
                uploaded_size,
            } => {
                // 非末尾分片推断为 chunk_size
                assert_eq!(parts[0].size, 5 * MIB);
                // 末尾分片推断为剩余字节
                assert_eq!(parts[1].size, 2 * MIB);
                assert_eq!(uploaded_size, 7 * MIB);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }

        assert_eq!(store.waiting_count("f"), 1);
        assert_eq!(store.get_next("f").unwrap().part_number, 2);
    }

    #[test]
    fn test_resume_ignores_duplicates() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 12);
        let parts = vec![
            ExistingPart::new(2, "a", None),
            ExistingPart::new(2, "b", None),
        ];
        match store.resume_from_parts("f", &parts) {
            ReconcileOutcome::Accepted {
                parts,
                uploaded_size,
            } => {
                assert_eq!(parts.len(), 1);
                assert_eq!(parts[0].etag, "a");
                assert_eq!(uploaded_size, 4);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_resume_mismatched_size_uses_planned_size() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 10);
        match store.resume_from_parts("f", &[ExistingPart::new(1, "a", Some(3))]) {
            ReconcileOutcome::Accepted {
                parts,
                uploaded_size,
            } => {
                assert_eq!(parts[0].size, 4);
                assert_eq!(uploaded_size, 4);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[test]
    fn test_resume_empty_report() {
        let mut store = ChunkStateStore::new(4);
        store.prepare_queue("f", 12);
        assert_eq!(store.resume_from_parts("f", &[]), ReconcileOutcome::Empty);
    }

    #[test]
    fn test_existing_part_deserialize_aliases() {
        let part: ExistingPart =
            serde_json::from_str(r#"{"PartNumber": 2, "ETag": "abc", "Size": 10}"#).unwrap();
        assert_eq!(part, ExistingPart::new(2, "abc", Some(10)));

        let part: ExistingPart = serde_json::from_str(r#"{"partNumber": 1, "etag": "x"}"#).unwrap();
        assert_eq!(part.size, None);
    }

    proptest! {
        #[test]
        fn prop_chunks_tile_the_file(size in 0u64..50_000_000, chunk_size in 1u64..10_000_000) {
            let chunks = plan_chunks(size, chunk_size);
            prop_assert_eq!(chunks.len() as u64, size.div_ceil(chunk_size));

            let mut offset = 0u64;
            for (i, chunk) in chunks.iter().enumerate() {
                prop_assert_eq!(chunk.part_number as usize, i + 1);
                prop_assert_eq!(chunk.range.start, offset);
                prop_assert!(chunk.size() > 0 && chunk.size() <= chunk_size);
                offset = chunk.range.end;
            }
            prop_assert_eq!(offset, size);
        }
    }
}
