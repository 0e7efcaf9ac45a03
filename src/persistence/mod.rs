//! 上传状态持久化模块
//!
//! 在途上传的快照写入可插拔的键值存储，程序重启后读取一次，
//! 调用方据此重新添加文件（沿用原文件ID），再由服务器已存在分片完成对账。
//!
//! ## 存储格式
//!
//! ```json
//! {
//!   "version": 1,
//!   "saved_at": "2025-12-05T00:00:00Z",
//!   "records": [
//!     { "file_id": "xxx", "file_name": "a.bin", "committed_parts": [1, 2], ... }
//!   ]
//! }
//! ```

pub mod manager;
pub mod snapshot;
pub mod store;

pub use manager::SnapshotManager;
pub use snapshot::{PersistedState, SnapshotRecord, SNAPSHOT_VERSION};
pub use store::{open_store, FileStore, KvStore, MemoryStore, SqliteStore, StoreError};
