//! 快照管理器
//!
//! 在内存中维护在途文件的快照记录，状态变化后标记为脏，
//! 由编排器按防抖间隔调用 `flush` 批量写入存储。
//! 启动时读取一次，过期记录和版本不一致的快照直接丢弃。

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::snapshot::{PersistedState, SnapshotRecord, SNAPSHOT_VERSION};
use super::store::KvStore;

/// 有效期无法表示时使用的默认值（小时）
const FALLBACK_TTL_HOURS: i64 = 24;

pub struct SnapshotManager {
    store: Option<Arc<dyn KvStore>>,
    key: String,
    ttl: chrono::Duration,
    records: HashMap<String, SnapshotRecord>,
    dirty: bool,
    flush_scheduled: bool,
}

impl SnapshotManager {
    /// 创建快照管理器
    ///
    /// # 参数
    /// * `store` - 存储后端，None 表示不持久化
    /// * `key` - 快照存储键
    /// * `ttl_hours` - 快照有效期（小时）
    pub fn new(store: Option<Arc<dyn KvStore>>, key: impl Into<String>, ttl_hours: u64) -> Self {
        Self {
            store,
            key: key.into(),
            ttl: ttl_from_hours(ttl_hours),
            records: HashMap::new(),
            dirty: false,
            flush_scheduled: false,
        }
    }

    /// 不持久化
    pub fn disabled() -> Self {
        Self::new(None, String::new(), 0)
    }

    pub fn is_enabled(&self) -> bool {
        self.store.is_some()
    }

    /// 读取快照（启动时调用一次）
    ///
    /// 返回未过期的记录，按最后更新时间升序
    pub fn load(&mut self) -> Result<Vec<SnapshotRecord>> {
        self.load_at(Utc::now())
    }

    pub fn load_at(&mut self, now: DateTime<Utc>) -> Result<Vec<SnapshotRecord>> {
        let Some(store) = self.store.clone() else {
            return Ok(Vec::new());
        };

        let Some(raw) = store
            .load(&self.key)
            .with_context(|| format!("读取快照失败: key={}", self.key))?
        else {
            debug!("没有可恢复的上传快照");
            return Ok(Vec::new());
        };

        let state: PersistedState = match serde_json::from_str(&raw) {
            Ok(state) => state,
            Err(e) => {
                warn!("快照内容损坏，已丢弃: {}", e);
                store.delete(&self.key)?;
                return Ok(Vec::new());
            }
        };

        if state.version != SNAPSHOT_VERSION {
            warn!(
                "快照版本不一致（{} != {}），已丢弃",
                state.version, SNAPSHOT_VERSION
            );
            store.delete(&self.key)?;
            return Ok(Vec::new());
        }

        let total = state.records.len();
        let mut valid: Vec<SnapshotRecord> = state
            .records
            .into_iter()
            .filter(|r| {
                let expired = r.is_expired(now, self.ttl);
                if expired {
                    info!(
                        "快照记录 {} 已过期（{} 小时前更新），清理中",
                        r.file_id,
                        now.signed_duration_since(r.last_updated).num_hours()
                    );
                }
                !expired
            })
            .collect();
        valid.sort_by_key(|r| r.last_updated);

        let purged = total - valid.len();
        if purged > 0 {
            info!("已清理 {} 个过期快照记录", purged);
            self.dirty = true;
        }

        self.records = valid
            .iter()
            .map(|r| (r.file_id.clone(), r.clone()))
            .collect();
        info!("已读取上传快照: {} 条记录", valid.len());
        Ok(valid)
    }

    /// 写入或更新记录
    pub fn upsert(&mut self, record: SnapshotRecord) {
        if self.store.is_none() {
            return;
        }
        self.records.insert(record.file_id.clone(), record);
        self.dirty = true;
    }

    /// 移除记录
    pub fn remove(&mut self, file_id: &str) {
        if self.records.remove(file_id).is_some() {
            self.dirty = true;
        }
    }

    pub fn get(&self, file_id: &str) -> Option<&SnapshotRecord> {
        self.records.get(file_id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// 是否需要启动防抖定时器
    ///
    /// 有未写入的变化且尚未安排写入时返回 true，并记为已安排
    pub fn take_flush_request(&mut self) -> bool {
        if self.store.is_none() || !self.dirty || self.flush_scheduled {
            return false;
        }
        self.flush_scheduled = true;
        true
    }

    /// 写入存储；记录为空时删除存储键
    pub fn flush(&mut self) -> Result<()> {
        self.flush_scheduled = false;
        let Some(store) = self.store.clone() else {
            return Ok(());
        };
        if !self.dirty {
            return Ok(());
        }

        if self.records.is_empty() {
            store
                .delete(&self.key)
                .with_context(|| format!("删除快照失败: key={}", self.key))?;
            debug!("快照已清空");
        } else {
            let mut records: Vec<SnapshotRecord> = self.records.values().cloned().collect();
            records.sort_by(|a, b| a.file_id.cmp(&b.file_id));
            let json = serde_json::to_string(&PersistedState::new(records))
                .context("序列化快照失败")?;
            store
                .save(&self.key, &json)
                .with_context(|| format!("写入快照失败: key={}", self.key))?;
            debug!("快照已写入: {} 条记录", self.records.len());
        }

        self.dirty = false;
        Ok(())
    }
}

fn ttl_from_hours(ttl_hours: u64) -> chrono::Duration {
    i64::try_from(ttl_hours)
        .ok()
        .and_then(chrono::Duration::try_hours)
        .unwrap_or_else(|| {
            warn!(
                "快照有效期 {} 小时超出范围，使用默认值 {} 小时",
                ttl_hours, FALLBACK_TTL_HOURS
            );
            chrono::Duration::hours(FALLBACK_TTL_HOURS)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::store::MemoryStore;
    use crate::uploader::task::FileStatus;

    fn record(id: &str, last_updated: DateTime<Utc>) -> SnapshotRecord {
        SnapshotRecord {
            file_id: id.to_string(),
            file_name: format!("{}.bin", id),
            file_size: 100,
            uploaded_size: 40,
            progress: 40,
            status: FileStatus::Uploading,
            total_chunks: 5,
            committed_parts: vec![1, 2],
            last_updated,
        }
    }

    #[test]
    fn test_flush_and_reload() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut manager = SnapshotManager::new(Some(store.clone()), "state", 24);

        manager.upsert(record("a", Utc::now()));
        assert!(manager.take_flush_request());
        // 已安排写入时不重复安排
        assert!(!manager.take_flush_request());
        manager.flush().unwrap();
        assert!(!manager.is_dirty());

        let mut reloaded = SnapshotManager::new(Some(store), "state", 24);
        let records = reloaded.load().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].committed_parts, vec![1, 2]);
        assert!(reloaded.get("a").is_some());
    }

    #[test]
    fn test_ttl_out_of_range_falls_back() {
        assert_eq!(ttl_from_hours(48), chrono::Duration::hours(48));
        assert_eq!(ttl_from_hours(u64::MAX), chrono::Duration::hours(24));
        assert_eq!(ttl_from_hours(i64::MAX as u64), chrono::Duration::hours(24));

        let manager = SnapshotManager::new(None, "state", u64::MAX);
        assert!(!manager.is_enabled());
    }

    #[test]
    fn test_expired_records_purged_on_load() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let now = Utc::now();
        let state = PersistedState::new(vec![
            record("fresh", now - chrono::Duration::hours(1)),
            record("stale", now - chrono::Duration::hours(25)),
        ]);
        store
            .save("state", &serde_json::to_string(&state).unwrap())
            .unwrap();

        let mut manager = SnapshotManager::new(Some(store), "state", 24);
        let records = manager.load_at(now).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].file_id, "fresh");
        // 清理后需要回写
        assert!(manager.is_dirty());
    }

    #[test]
    fn test_version_mismatch_discarded() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut state = PersistedState::new(vec![record("a", Utc::now())]);
        state.version = SNAPSHOT_VERSION + 1;
        store
            .save("state", &serde_json::to_string(&state).unwrap())
            .unwrap();

        let mut manager = SnapshotManager::new(Some(store.clone()), "state", 24);
        assert!(manager.load().unwrap().is_empty());
        assert_eq!(store.load("state").unwrap(), None);
    }

    #[test]
    fn test_corrupt_snapshot_discarded() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        store.save("state", "not json").unwrap();

        let mut manager = SnapshotManager::new(Some(store.clone()), "state", 24);
        assert!(manager.load().unwrap().is_empty());
        assert_eq!(store.load("state").unwrap(), None);
    }

    #[test]
    fn test_removing_last_record_deletes_key() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::new());
        let mut manager = SnapshotManager::new(Some(store.clone()), "state", 24);
        manager.upsert(record("a", Utc::now()));
        manager.flush().unwrap();
        assert!(store.load("state").unwrap().is_some());

        manager.remove("a");
        manager.flush().unwrap();
        assert_eq!(store.load("state").unwrap(), None);
    }

    #[test]
    fn test_disabled_manager_is_noop() {
        let mut manager = SnapshotManager::disabled();
        manager.upsert(record("a", Utc::now()));
        assert!(manager.is_empty());
        assert!(!manager.take_flush_request());
        manager.flush().unwrap();
        assert!(manager.load().unwrap().is_empty());
    }
}
