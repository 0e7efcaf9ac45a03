// 上传引擎模块
//
// - 文件队列：校验、FIFO 排队、按最大并发文件数激活
// - 分片状态：等待 / 上传中 / 冷却，失败重试与断点续传对账
// - 执行槽位池：槽位数量限制并行度，槽位崩溃后自动剔除
// - 令牌桶限速：全局字节速率
// - 编排器：单任务控制循环，所有状态只在循环内修改

pub mod backend;
pub mod chunk;
pub mod error;
pub mod local;
pub mod orchestrator;
pub mod queue;
pub mod rate_limit;
pub mod source;
pub mod task;
pub mod transport;

pub use backend::{default_pool_size, BackendEvent, ChunkJob, ChunkOutcome, Submission, WorkerPool};
pub use chunk::{
    plan_chunks, total_chunks, ChunkStateStore, ChunkStatus, ChunkTask, CommittedPart,
    ExistingPart, ReconcileOutcome, ReconcileRejection, RetryDecision,
};
pub use error::{ControlError, RejectReason, UploadError, ValidationError};
pub use local::LocalDirTransport;
pub use orchestrator::UploadOrchestrator;
pub use queue::{AddResult, FileQueue, QueueStats, UploadFile};
pub use rate_limit::RateLimiter;
pub use source::{ByteSource, FileSource, MemorySource};
pub use task::{FileRecord, FileStatus};
pub use transport::{
    BeginResponse, ChunkPayload, FileDescriptor, FinalizeResponse, UploadPartResponse,
    UploadTransport,
};
