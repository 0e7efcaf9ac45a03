//! 键值存储后端
//!
//! 快照层只需要按键保存 / 读取 / 删除一段 JSON 文本：
//! - `MemoryStore`：进程内，重启后丢失
//! - `FileStore`：每个键一个 `.json` 文件，先写临时文件再原子重命名
//! - `SqliteStore`：单表 `kv_store`

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use tracing::{debug, info};

use crate::config::{PersistenceConfig, StoreBackend};

/// SQLite 数据库文件名
const SQLITE_FILE_NAME: &str = "state.db";

/// 存储错误
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("存储键无效: {0}")]
    InvalidKey(String),

    #[error("文件存储 IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite 存储错误: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// 键值存储
pub trait KvStore: Send + Sync {
    /// 后端名称（用于日志）
    fn name(&self) -> &'static str;

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError>;

    fn load(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// 删除键，键不存在时不报错
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// 按配置打开存储后端，未启用持久化时返回 None
pub fn open_store(config: &PersistenceConfig) -> Result<Option<Arc<dyn KvStore>>, StoreError> {
    if !config.enabled {
        return Ok(None);
    }

    let store: Arc<dyn KvStore> = match config.backend {
        StoreBackend::Memory => Arc::new(MemoryStore::new()),
        StoreBackend::File => Arc::new(FileStore::new(&config.dir)?),
        StoreBackend::Sqlite => Arc::new(SqliteStore::open(&config.dir.join(SQLITE_FILE_NAME))?),
    };
    info!("快照存储后端: {}", store.name());
    Ok(Some(store))
}

/// 键只允许出现在单个文件名中
fn validate_key(key: &str) -> Result<(), StoreError> {
    if key.is_empty()
        || key.contains('/')
        || key.contains('\\')
        || key.contains("..")
        || key.trim() != key
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

// ============================================================================
// 内存存储
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.entries.lock().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        Ok(self.entries.lock().get(key).cloned())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ============================================================================
// 文件存储
// ============================================================================

#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// 创建文件存储，目录不存在时自动创建
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        if !dir.exists() {
            fs::create_dir_all(dir)?;
            debug!("已创建快照目录: {:?}", dir);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// 键对应的文件路径：`{dir}/{key}.json`
    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", key))
    }
}

impl KvStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        let path = self.path_for(key);

        // 先写入临时文件，再原子重命名（防止写入中断导致文件损坏）
        let temp_path = path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(value.as_bytes())?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &path)?;
        debug!("已保存快照文件: {:?} ({} bytes)", path, value.len());
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// SQLite 存储
// ============================================================================

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// 打开数据库文件，父目录不存在时自动创建
    pub fn open(db_path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = db_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let store = Self {
            conn: Mutex::new(Connection::open(db_path)?),
        };
        store.init_tables()?;
        Ok(store)
    }

    /// 内存数据库
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_tables()?;
        Ok(store)
    }

    fn init_tables(&self) -> Result<(), StoreError> {
        self.conn.lock().execute(
            r#"
            CREATE TABLE IF NOT EXISTS kv_store (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )
            "#,
            [],
        )?;
        Ok(())
    }
}

impl KvStore for SqliteStore {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn save(&self, key: &str, value: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.conn.lock().execute(
            "INSERT OR REPLACE INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)",
            params![key, value, chrono::Utc::now().timestamp()],
        )?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<String>, StoreError> {
        validate_key(key)?;
        let value = self
            .conn
            .lock()
            .query_row(
                "SELECT value FROM kv_store WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        validate_key(key)?;
        self.conn
            .lock()
            .execute("DELETE FROM kv_store WHERE key = ?1", params![key])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn exercise(store: &dyn KvStore) {
        assert_eq!(store.load("state").unwrap(), None);

        store.save("state", r#"{"a":1}"#).unwrap();
        assert_eq!(store.load("state").unwrap().as_deref(), Some(r#"{"a":1}"#));

        store.save("state", r#"{"a":2}"#).unwrap();
        assert_eq!(store.load("state").unwrap().as_deref(), Some(r#"{"a":2}"#));

        store.delete("state").unwrap();
        assert_eq!(store.load("state").unwrap(), None);
        // 重复删除不报错
        store.delete("state").unwrap();
    }

    #[test]
    fn test_memory_store() {
        exercise(&MemoryStore::new());
    }

    #[test]
    fn test_file_store() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(&dir.path().join("nested")).unwrap();
        exercise(&store);

        store.save("k", "v").unwrap();
        assert!(store.path_for("k").exists());
        assert!(!store.path_for("k").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_sqlite_store() {
        exercise(&SqliteStore::open_in_memory().unwrap());

        let dir = TempDir::new().unwrap();
        let path = dir.path().join("db").join("state.db");
        {
            let store = SqliteStore::open(&path).unwrap();
            store.save("k", "persisted").unwrap();
        }
        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load("k").unwrap().as_deref(), Some("persisted"));
    }

    #[test]
    fn test_invalid_keys_rejected() {
        let store = MemoryStore::new();
        for key in ["", "../x", "a/b", "a\\b", " padded"] {
            assert!(matches!(
                store.save(key, "v"),
                Err(StoreError::InvalidKey(_))
            ));
        }
    }

    #[test]
    fn test_open_store_by_config() {
        let dir = TempDir::new().unwrap();
        let mut config = PersistenceConfig {
            dir: dir.path().to_path_buf(),
            ..Default::default()
        };
        assert!(open_store(&config).unwrap().is_none());

        config.enabled = true;
        config.backend = StoreBackend::Sqlite;
        let store = open_store(&config).unwrap().unwrap();
        assert_eq!(store.name(), "sqlite");
        assert!(dir.path().join(SQLITE_FILE_NAME).exists());
    }
}
