// 上传编排器
//
// 所有上传状态（文件队列、分片状态、限速令牌桶、执行槽位、性能统计、快照）
// 只由一个控制循环任务持有和修改。外部通过 UploadOrchestrator 句柄发送控制消息，
// 异步回调（begin / upload_part / finalize）和定时器在独立任务中运行，
// 结束后把结果作为消息发回控制循环。
//
// 每次激活文件都会分配新的 epoch，消息中携带 epoch；
// 文件被取消或结束后，迟到的回调结果因 epoch 不匹配而被丢弃。

use anyhow::{Context, Result};
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::common::metrics::{MetricsAggregator, PerformanceSnapshot};
use crate::config::{AppConfig, UploadConfig};
use crate::events::{
    EventBus, KeyedThrottler, ProgressThrottler, UploadEvent, DEFAULT_THROTTLE_INTERVAL_MS,
};
use crate::persistence::{open_store, KvStore, SnapshotManager, SnapshotRecord};
use crate::uploader::backend::{
    default_pool_size, describe_join_error, BackendEvent, ChunkJob, WorkerPool,
};
use crate::uploader::chunk::{
    total_chunks, ChunkStateStore, CommittedPart, ExistingPart, ReconcileOutcome, RetryDecision,
};
use crate::uploader::error::{ControlError, UploadError};
use crate::uploader::queue::{AddResult, FileQueue, QueueStats, UploadFile};
use crate::uploader::rate_limit::RateLimiter;
use crate::uploader::source::ByteSource;
use crate::uploader::task::{FileRecord, FileStatus};
use crate::uploader::transport::{
    BeginResponse, ChunkPayload, FileDescriptor, FinalizeResponse, UploadTransport,
};

/// begin + list_existing_parts 的结果
#[derive(Debug)]
struct InitOutcome {
    begin: BeginResponse,
    existing: Option<Vec<ExistingPart>>,
}

/// 控制循环消息
enum ControlMessage {
    AddFiles {
        files: Vec<UploadFile>,
        reply: oneshot::Sender<AddResult>,
    },
    Pause {
        file_id: String,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Resume {
        file_id: String,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Cancel {
        file_id: String,
        reply: oneshot::Sender<bool>,
    },
    SetRateLimit {
        bytes_per_sec: Option<u64>,
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<QueueStats>,
    },
    Files {
        reply: oneshot::Sender<Vec<FileRecord>>,
    },
    File {
        file_id: String,
        reply: oneshot::Sender<Option<FileRecord>>,
    },
    Performance {
        reply: oneshot::Sender<PerformanceSnapshot>,
    },
    Recoverable {
        reply: oneshot::Sender<Vec<SnapshotRecord>>,
    },
    ClearFinished {
        reply: oneshot::Sender<usize>,
    },
    Destroy {
        reply: oneshot::Sender<()>,
    },

    // 以下为内部消息
    InitFinished {
        file_id: String,
        epoch: u64,
        outcome: Result<InitOutcome, String>,
    },
    RateDelayElapsed {
        file_id: String,
        epoch: u64,
        part_number: u32,
    },
    RetryDelayElapsed {
        file_id: String,
        epoch: u64,
        part_number: u32,
    },
    FinalizeFinished {
        file_id: String,
        epoch: u64,
        result: Result<FinalizeResponse, String>,
    },
    PersistFlush,
}

/// 上传编排器句柄
///
/// 可以任意克隆；所有句柄释放后控制循环自动退出。
/// 必须在 tokio 运行时内创建。
#[derive(Debug, Clone)]
pub struct UploadOrchestrator {
    tx: mpsc::UnboundedSender<ControlMessage>,
    events: EventBus,
}

impl std::fmt::Debug for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ControlMessage::AddFiles { .. } => "AddFiles",
            ControlMessage::Pause { .. } => "Pause",
            ControlMessage::Resume { .. } => "Resume",
            ControlMessage::Cancel { .. } => "Cancel",
            ControlMessage::SetRateLimit { .. } => "SetRateLimit",
            ControlMessage::Stats { .. } => "Stats",
            ControlMessage::Files { .. } => "Files",
            ControlMessage::File { .. } => "File",
            ControlMessage::Performance { .. } => "Performance",
            ControlMessage::Recoverable { .. } => "Recoverable",
            ControlMessage::ClearFinished { .. } => "ClearFinished",
            ControlMessage::Destroy { .. } => "Destroy",
            ControlMessage::InitFinished { .. } => "InitFinished",
            ControlMessage::RateDelayElapsed { .. } => "RateDelayElapsed",
            ControlMessage::RetryDelayElapsed { .. } => "RetryDelayElapsed",
            ControlMessage::FinalizeFinished { .. } => "FinalizeFinished",
            ControlMessage::PersistFlush => "PersistFlush",
        };
        f.write_str(name)
    }
}

impl UploadOrchestrator {
    /// 创建编排器，按配置打开快照存储
    pub fn new(config: AppConfig, transport: Arc<dyn UploadTransport>) -> Result<Self> {
        let store = open_store(&config.persistence).context("打开快照存储失败")?;
        Self::with_store(config, transport, store)
    }

    /// 创建编排器，使用调用方提供的快照存储
    ///
    /// # 参数
    /// * `config` - 应用配置
    /// * `transport` - 上传传输层
    /// * `store` - 快照存储，None 表示不持久化
    pub fn with_store(
        config: AppConfig,
        transport: Arc<dyn UploadTransport>,
        store: Option<Arc<dyn KvStore>>,
    ) -> Result<Self> {
        config.validate().context("上传配置无效")?;

        let mut snapshots = SnapshotManager::new(
            store,
            config.persistence.storage_key.clone(),
            config.persistence.ttl_hours,
        );
        let recoverable = match snapshots.load() {
            Ok(records) => records,
            Err(e) => {
                warn!("读取上传快照失败，按无快照处理: {:#}", e);
                Vec::new()
            }
        };

        let (backend_tx, backend_rx) = mpsc::unbounded_channel();
        let mut pool = WorkerPool::new(backend_tx);
        let pool_size = if config.execution.enabled {
            config.execution.pool_size.unwrap_or_else(default_pool_size)
        } else {
            0
        };
        pool.initialize(pool_size);

        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventBus::new();

        info!(
            "上传编排器启动: 最大并发文件={}, 单文件并发分片={}, 分片大小={} bytes, 执行槽位={}, 限速={} B/s",
            config.upload.max_concurrent_files,
            config.upload.max_concurrent_chunks,
            config.upload.chunk_size,
            pool_size,
            config.rate_limit.effective_rate()
        );

        let control = ControlLoop {
            queue: FileQueue::from_config(&config.upload),
            chunks: ChunkStateStore::new(config.upload.chunk_size),
            limiter: RateLimiter::new(config.rate_limit.effective_rate()),
            pool,
            metrics: MetricsAggregator::new(
                config.metrics.enabled,
                Duration::from_secs(config.metrics.window_secs),
            ),
            perf_throttle: ProgressThrottler::with_millis(config.metrics.update_interval_ms),
            progress_throttle: KeyedThrottler::new(Duration::from_millis(
                DEFAULT_THROTTLE_INTERVAL_MS,
            )),
            persist_debounce: Duration::from_millis(config.persistence.debounce_ms),
            snapshots,
            recoverable,
            transport,
            events: events.clone(),
            active: HashMap::new(),
            next_epoch: 0,
            idle_notified: true,
            self_tx: tx.downgrade(),
            config: config.upload,
        };
        tokio::spawn(control.run(rx, backend_rx));

        Ok(Self { tx, events })
    }

    /// 订阅上传事件
    pub fn subscribe(&self) -> broadcast::Receiver<UploadEvent> {
        self.events.subscribe()
    }

    /// 控制循环是否已退出
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// 添加文件，返回入队和被拒绝的文件
    pub async fn add_files(&self, files: Vec<UploadFile>) -> Result<AddResult, ControlError> {
        self.request(|reply| ControlMessage::AddFiles { files, reply })
            .await
    }

    /// 暂停文件
    ///
    /// 已暂停时为空操作；排队中、合并中或已结束的文件返回 InvalidState
    pub async fn pause(&self, file_id: &str) -> Result<(), ControlError> {
        let file_id = file_id.to_string();
        self.request(|reply| ControlMessage::Pause { file_id, reply })
            .await?
    }

    /// 恢复暂停的文件，未暂停的活跃文件为空操作
    pub async fn resume(&self, file_id: &str) -> Result<(), ControlError> {
        let file_id = file_id.to_string();
        self.request(|reply| ControlMessage::Resume { file_id, reply })
            .await?
    }

    /// 取消并移除文件，文件不存在时返回 false
    pub async fn cancel(&self, file_id: &str) -> Result<bool, ControlError> {
        let file_id = file_id.to_string();
        self.request(|reply| ControlMessage::Cancel { file_id, reply })
            .await
    }

    /// 修改限速（字节/秒），None 或 0 表示不限速
    pub async fn set_rate_limit(&self, bytes_per_sec: Option<u64>) -> Result<(), ControlError> {
        self.request(|reply| ControlMessage::SetRateLimit {
            bytes_per_sec,
            reply,
        })
        .await
    }

    /// 队列统计
    pub async fn stats(&self) -> Result<QueueStats, ControlError> {
        self.request(|reply| ControlMessage::Stats { reply }).await
    }

    /// 全部文件记录（按添加顺序）
    pub async fn files(&self) -> Result<Vec<FileRecord>, ControlError> {
        self.request(|reply| ControlMessage::Files { reply }).await
    }

    pub async fn file(&self, file_id: &str) -> Result<Option<FileRecord>, ControlError> {
        let file_id = file_id.to_string();
        self.request(|reply| ControlMessage::File { file_id, reply })
            .await
    }

    /// 当前性能快照
    pub async fn performance(&self) -> Result<PerformanceSnapshot, ControlError> {
        self.request(|reply| ControlMessage::Performance { reply })
            .await
    }

    /// 启动时读取到的可恢复快照记录
    pub async fn recoverable(&self) -> Result<Vec<SnapshotRecord>, ControlError> {
        self.request(|reply| ControlMessage::Recoverable { reply })
            .await
    }

    /// 清除已完成和失败的文件记录
    pub async fn clear_finished(&self) -> Result<usize, ControlError> {
        self.request(|reply| ControlMessage::ClearFinished { reply })
            .await
    }

    /// 关闭编排器：写入快照、停止执行槽位并退出控制循环
    pub async fn destroy(&self) -> Result<(), ControlError> {
        self.request(|reply| ControlMessage::Destroy { reply })
            .await
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> ControlMessage,
    ) -> Result<T, ControlError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(build(reply_tx))
            .map_err(|_| ControlError::Closed)?;
        reply_rx.await.map_err(|_| ControlError::Closed)
    }
}

/// 活跃文件（初始化中、上传中、暂停）的运行时信息
struct ActiveFile {
    epoch: u64,
    descriptor: FileDescriptor,
    source: Arc<dyn ByteSource>,
    /// 已调用 finalize，等待结果
    finalizing: bool,
}

enum Flow {
    Continue,
    Stop(Option<oneshot::Sender<()>>),
}

struct ControlLoop {
    config: UploadConfig,
    transport: Arc<dyn UploadTransport>,
    queue: FileQueue,
    chunks: ChunkStateStore,
    limiter: RateLimiter,
    pool: WorkerPool,
    metrics: MetricsAggregator,
    perf_throttle: ProgressThrottler,
    progress_throttle: KeyedThrottler,
    snapshots: SnapshotManager,
    persist_debounce: Duration,
    recoverable: Vec<SnapshotRecord>,
    events: EventBus,
    active: HashMap<String, ActiveFile>,
    next_epoch: u64,
    /// 本轮空闲是否已发布 AllComplete
    idle_notified: bool,
    self_tx: mpsc::WeakUnboundedSender<ControlMessage>,
}

impl ControlLoop {
    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ControlMessage>,
        mut backend_rx: mpsc::UnboundedReceiver<BackendEvent>,
    ) {
        debug!("上传控制循环已启动");
        let mut destroy_reply = None;

        loop {
            tokio::select! {
                message = rx.recv() => {
                    let Some(message) = message else {
                        info!("所有编排器句柄已释放，控制循环退出");
                        break;
                    };
                    if let Flow::Stop(reply) = self.handle_message(message) {
                        destroy_reply = reply;
                        break;
                    }
                }
                Some(event) = backend_rx.recv() => self.handle_backend_event(event),
            }
            self.schedule_flush();
        }

        drop(rx);
        self.shutdown();
        if let Some(reply) = destroy_reply {
            let _ = reply.send(());
        }
    }

    fn handle_message(&mut self, message: ControlMessage) -> Flow {
        match message {
            ControlMessage::AddFiles { files, reply } => {
                let result = self.add_files(files);
                let _ = reply.send(result);
            }
            ControlMessage::Pause { file_id, reply } => {
                let _ = reply.send(self.pause(&file_id));
            }
            ControlMessage::Resume { file_id, reply } => {
                let _ = reply.send(self.resume(&file_id));
            }
            ControlMessage::Cancel { file_id, reply } => {
                let _ = reply.send(self.cancel(&file_id));
            }
            ControlMessage::SetRateLimit {
                bytes_per_sec,
                reply,
            } => {
                let rate = bytes_per_sec.unwrap_or(0);
                self.limiter.set_rate(rate);
                info!("限速已更新: {} B/s", rate);
                let _ = reply.send(());
            }
            ControlMessage::Stats { reply } => {
                let _ = reply.send(self.queue.get_stats());
            }
            ControlMessage::Files { reply } => {
                let _ = reply.send(self.queue.files());
            }
            ControlMessage::File { file_id, reply } => {
                let _ = reply.send(self.queue.get(&file_id).cloned());
            }
            ControlMessage::Performance { reply } => {
                let _ = reply.send(self.performance_snapshot());
            }
            ControlMessage::Recoverable { reply } => {
                let _ = reply.send(self.recoverable.clone());
            }
            ControlMessage::ClearFinished { reply } => {
                let _ = reply.send(self.queue.clear_finished());
            }
            ControlMessage::Destroy { reply } => {
                info!("收到关闭请求");
                return Flow::Stop(Some(reply));
            }
            ControlMessage::InitFinished {
                file_id,
                epoch,
                outcome,
            } => self.on_init_finished(&file_id, epoch, outcome),
            ControlMessage::RateDelayElapsed {
                file_id,
                epoch,
                part_number,
            } => self.on_rate_delay_elapsed(&file_id, epoch, part_number),
            ControlMessage::RetryDelayElapsed {
                file_id,
                epoch,
                part_number,
            } => self.on_retry_delay_elapsed(&file_id, epoch, part_number),
            ControlMessage::FinalizeFinished {
                file_id,
                epoch,
                result,
            } => self.on_finalize_finished(&file_id, epoch, result),
            ControlMessage::PersistFlush => {
                if let Err(e) = self.snapshots.flush() {
                    warn!("写入上传快照失败: {:#}", e);
                }
            }
        }
        Flow::Continue
    }

    fn handle_backend_event(&mut self, event: BackendEvent) {
        match event {
            BackendEvent::Completed(outcome) => {
                if let Some(slot_id) = outcome.slot_id {
                    self.pool.complete(slot_id);
                }
                self.on_chunk_finished(
                    &outcome.file_id,
                    outcome.epoch,
                    outcome.part_number,
                    outcome.result,
                );
            }
            BackendEvent::SlotCrashed { slot_id, reason } => {
                if let Some(assignment) = self.pool.evict(slot_id) {
                    let error = UploadError::Backend { slot_id, reason };
                    self.on_chunk_finished(
                        &assignment.file_id,
                        assignment.epoch,
                        assignment.part_number,
                        Err(error.to_string()),
                    );
                }
            }
        }
    }

    // ---------------------------------------------------------------
    // 文件调度
    // ---------------------------------------------------------------

    fn add_files(&mut self, files: Vec<UploadFile>) -> AddResult {
        let result = self.queue.add_files(files);

        for rejected in &result.rejected {
            self.events.publish(UploadEvent::FileRejected {
                error: rejected.clone(),
            });
        }
        for record in &result.accepted {
            self.events.publish(UploadEvent::FileAdded {
                file_id: record.id.clone(),
                name: record.name.clone(),
                size: record.size,
            });
        }

        if !result.accepted.is_empty() {
            self.idle_notified = false;
        }
        self.pump();
        result
    }

    /// 按并发上限激活排队文件，然后检查是否进入空闲
    fn pump(&mut self) {
        while self.queue.slot_holders() < self.config.max_concurrent_files {
            let Some(file_id) = self.queue.get_next() else {
                break;
            };
            self.start_file(file_id);
        }
        self.check_idle();
    }

    fn start_file(&mut self, file_id: String) {
        let Some(source) = self.queue.source(&file_id) else {
            return;
        };
        self.queue.activate(&file_id);
        let Some(record) = self.queue.get(&file_id) else {
            return;
        };

        let descriptor = FileDescriptor {
            id: record.id.clone(),
            name: record.name.clone(),
            size: record.size,
            mime_type: record.mime_type.clone(),
            upload_id: None,
            total_chunks: total_chunks(record.size, self.chunks.chunk_size()),
        };
        info!(
            "开始上传文件: id={}, name={}, size={} bytes, 分片数={}",
            descriptor.id, descriptor.name, descriptor.size, descriptor.total_chunks
        );

        self.next_epoch += 1;
        let epoch = self.next_epoch;
        self.active.insert(
            file_id.clone(),
            ActiveFile {
                epoch,
                descriptor: descriptor.clone(),
                source,
                finalizing: false,
            },
        );
        self.persist(&file_id);

        let transport = self.transport.clone();
        let id = file_id.clone();
        self.spawn_task(
            async move {
                let outcome = initialize_upload(transport, descriptor)
                    .await
                    .map_err(|e| format!("{:#}", e));
                ControlMessage::InitFinished {
                    file_id: id,
                    epoch,
                    outcome,
                }
            },
            move |reason| ControlMessage::InitFinished {
                file_id,
                epoch,
                outcome: Err(reason),
            },
        );
    }

    fn on_init_finished(&mut self, file_id: &str, epoch: u64, outcome: Result<InitOutcome, String>) {
        if !self.is_current(file_id, epoch) {
            debug!("丢弃过期的初始化结果: file_id={}", file_id);
            return;
        }

        let init = match outcome {
            Ok(init) => init,
            Err(message) => {
                self.fail_file(file_id, UploadError::Initialization { message });
                return;
            }
        };

        if init.begin.skip_upload {
            info!("服务器已存在该文件，跳过分片上传: file_id={}", file_id);
            self.complete_file(file_id, FinalizeResponse::default(), true);
            return;
        }

        let upload_id = init.begin.upload_id;
        if let Some(active) = self.active.get_mut(file_id) {
            active.descriptor.upload_id = upload_id.clone();
        }
        let Some(size) = self.queue.get(file_id).map(|r| r.size) else {
            return;
        };
        let total = self.chunks.prepare_queue(file_id, size);
        if let Some(record) = self.queue.get_mut(file_id) {
            record.upload_id = upload_id;
            record.total_chunks = total;
            record.parts.clear();
        }

        let mut resumed = false;
        if let Some(existing) = init.existing {
            match self.chunks.resume_from_parts(file_id, &existing) {
                ReconcileOutcome::Accepted {
                    parts,
                    uploaded_size,
                } => {
                    info!(
                        "断点续传: file_id={}, 已存在分片 {}/{}, 已上传 {} bytes",
                        file_id,
                        parts.len(),
                        total,
                        uploaded_size
                    );
                    if let Some(record) = self.queue.get_mut(file_id) {
                        for part in parts {
                            record.commit_part(part);
                        }
                    }
                    self.queue.update_progress(file_id, uploaded_size);
                    resumed = true;
                }
                ReconcileOutcome::Rejected(reason) => {
                    warn!("已存在分片无效，从头上传: file_id={}, {}", file_id, reason);
                }
                ReconcileOutcome::Empty => {}
            }
        }

        // 初始化期间被暂停的文件保持暂停，等待 resume
        let paused = self
            .queue
            .get(file_id)
            .map(|r| r.status == FileStatus::Paused)
            .unwrap_or(false);
        if !paused {
            self.queue.update_status(file_id, FileStatus::Uploading);
        }
        if resumed {
            self.emit_progress(file_id, true);
        }
        self.persist(file_id);
        self.advance(file_id);
    }

    /// 推进文件：分片全部完成则合并，否则补充在途分片
    fn advance(&mut self, file_id: &str) {
        let Some(active) = self.active.get(file_id) else {
            return;
        };
        if active.finalizing {
            return;
        }
        let uploading = self
            .queue
            .get(file_id)
            .map(|r| r.status == FileStatus::Uploading)
            .unwrap_or(false);
        if !uploading {
            return;
        }

        if self.chunks.is_complete(file_id) {
            self.finalize_file(file_id);
        } else {
            self.top_up(file_id);
        }
    }

    fn top_up(&mut self, file_id: &str) {
        let Some(epoch) = self.active.get(file_id).map(|a| a.epoch) else {
            return;
        };

        while self.chunks.pending_count(file_id) < self.config.max_concurrent_chunks {
            let Some(chunk) = self.chunks.get_next(file_id) else {
                break;
            };
            let part_number = chunk.part_number;
            let size = chunk.size();
            if !self.chunks.mark_pending(file_id, chunk) {
                continue;
            }

            let wait = self.limiter.request_bytes(size);
            if wait.is_zero() {
                self.submit_chunk(file_id, part_number);
            } else {
                debug!(
                    "分片限速等待 {:?}: file_id={}, part={}",
                    wait, file_id, part_number
                );
                self.schedule(
                    wait,
                    ControlMessage::RateDelayElapsed {
                        file_id: file_id.to_string(),
                        epoch,
                        part_number,
                    },
                );
            }
        }
    }

    fn submit_chunk(&mut self, file_id: &str, part_number: u32) {
        let Some(active) = self.active.get(file_id) else {
            return;
        };
        let Some(chunk) = self.chunks.pending_chunk(file_id, part_number) else {
            return;
        };

        let range = chunk.range.clone();
        let epoch = active.epoch;
        let source = active.source.clone();
        let descriptor = active.descriptor.clone();
        let transport = self.transport.clone();

        let work = async move {
            let data = source
                .read_range(range.clone())
                .await
                .with_context(|| format!("读取分片 #{} 数据失败", part_number))?;
            let payload = ChunkPayload {
                part_number,
                start: range.start,
                end: range.end,
                data,
            };
            let response = transport.upload_part(&descriptor, payload).await?;
            Ok::<String, anyhow::Error>(response.etag)
        }
        .boxed();

        self.metrics.record_chunk_started();
        let submission = self
            .pool
            .submit(ChunkJob::new(file_id, part_number, work).with_epoch(epoch));
        debug!(
            "分片已提交: file_id={}, part={}, {:?}",
            file_id, part_number, submission
        );
    }

    fn on_chunk_finished(
        &mut self,
        file_id: &str,
        epoch: u64,
        part_number: u32,
        result: Result<String, String>,
    ) {
        if !self.is_current(file_id, epoch) {
            debug!(
                "丢弃过期的分片结果: file_id={}, part={}",
                file_id, part_number
            );
            return;
        }
        match result {
            Ok(etag) => self.on_chunk_success(file_id, part_number, etag),
            Err(message) => self.on_chunk_failure(file_id, part_number, message),
        }
    }

    fn on_chunk_success(&mut self, file_id: &str, part_number: u32, etag: String) {
        let Some(size) = self.chunks.mark_uploaded(file_id, part_number) else {
            return;
        };
        let uploaded = self.chunks.calculate_uploaded_size(file_id);
        if let Some(record) = self.queue.get_mut(file_id) {
            record.commit_part(CommittedPart {
                part_number,
                etag,
                size,
            });
        }
        self.queue.update_progress(file_id, uploaded);
        self.metrics.record_chunk(size);

        self.emit_progress(file_id, false);
        self.emit_performance(false);
        self.persist(file_id);
        self.advance(file_id);
    }

    fn on_chunk_failure(&mut self, file_id: &str, part_number: u32, message: String) {
        let Some(retry_count) = self
            .chunks
            .pending_chunk(file_id, part_number)
            .map(|c| c.retry_count)
        else {
            return;
        };
        self.metrics.record_chunk_failure();

        let delay_ms = self.config.retry_delay_for(retry_count + 1);
        let decision = self.chunks.mark_failed(
            file_id,
            part_number,
            self.config.max_retries,
            delay_ms > 0,
        );

        match decision {
            Some(RetryDecision::Requeued { retry_count }) => {
                warn!(
                    "分片上传失败，立即重试 ({}/{}): file_id={}, part={}, 错误: {}",
                    retry_count, self.config.max_retries, file_id, part_number, message
                );
                self.advance(file_id);
            }
            Some(RetryDecision::Deferred { retry_count }) => {
                warn!(
                    "分片上传失败，{}ms 后重试 ({}/{}): file_id={}, part={}, 错误: {}",
                    delay_ms, retry_count, self.config.max_retries, file_id, part_number, message
                );
                if let Some(epoch) = self.active.get(file_id).map(|a| a.epoch) {
                    self.schedule(
                        Duration::from_millis(delay_ms),
                        ControlMessage::RetryDelayElapsed {
                            file_id: file_id.to_string(),
                            epoch,
                            part_number,
                        },
                    );
                }
                self.advance(file_id);
            }
            Some(RetryDecision::Exhausted { retry_count }) => {
                error!(
                    "分片重试次数耗尽: file_id={}, part={}, 已重试 {} 次, 错误: {}",
                    file_id, part_number, retry_count, message
                );
                self.fail_file(
                    file_id,
                    UploadError::ChunkUpload {
                        part_number,
                        retries: retry_count,
                        message,
                    },
                );
            }
            None => {}
        }
    }

    fn on_rate_delay_elapsed(&mut self, file_id: &str, epoch: u64, part_number: u32) {
        if !self.is_current(file_id, epoch) {
            return;
        }
        if self.chunks.pending_chunk(file_id, part_number).is_none() {
            return;
        }

        let uploading = self
            .queue
            .get(file_id)
            .map(|r| r.status == FileStatus::Uploading)
            .unwrap_or(false);
        if uploading {
            self.submit_chunk(file_id, part_number);
        } else {
            // 等待期间被暂停，退回等待队列，恢复后重新申请令牌
            self.chunks.requeue_pending(file_id, part_number);
        }
    }

    fn on_retry_delay_elapsed(&mut self, file_id: &str, epoch: u64, part_number: u32) {
        if !self.is_current(file_id, epoch) {
            return;
        }
        if self.chunks.release_retry(file_id, part_number) {
            debug!(
                "重试延迟结束，分片重新排队: file_id={}, part={}",
                file_id, part_number
            );
            self.advance(file_id);
        }
    }

    fn finalize_file(&mut self, file_id: &str) {
        let Some(active) = self.active.get_mut(file_id) else {
            return;
        };
        if active.finalizing {
            return;
        }
        active.finalizing = true;
        let epoch = active.epoch;
        let descriptor = active.descriptor.clone();

        let parts = self
            .queue
            .get(file_id)
            .map(|r| r.sorted_parts())
            .unwrap_or_default();
        info!(
            "所有分片上传完成，开始合并: file_id={}, 分片数={}",
            file_id,
            parts.len()
        );

        let transport = self.transport.clone();
        let id = file_id.to_string();
        let panic_id = id.clone();
        self.spawn_task(
            async move {
                let result = transport
                    .finalize(&descriptor, &parts)
                    .await
                    .map_err(|e| format!("{:#}", e));
                ControlMessage::FinalizeFinished {
                    file_id: id,
                    epoch,
                    result,
                }
            },
            move |reason| ControlMessage::FinalizeFinished {
                file_id: panic_id,
                epoch,
                result: Err(reason),
            },
        );
    }

    fn on_finalize_finished(
        &mut self,
        file_id: &str,
        epoch: u64,
        result: Result<FinalizeResponse, String>,
    ) {
        if !self.is_current(file_id, epoch) {
            debug!("丢弃过期的合并结果: file_id={}", file_id);
            return;
        }
        match result {
            Ok(response) => self.complete_file(file_id, response, false),
            Err(message) => self.fail_file(file_id, UploadError::Finalize { message }),
        }
    }

    /// 文件成功结束
    fn complete_file(&mut self, file_id: &str, response: FinalizeResponse, skipped: bool) {
        self.release_file(file_id);
        self.queue.update_status(file_id, FileStatus::Complete);
        self.snapshots.remove(file_id);
        self.metrics.record_file_finished(true);

        self.emit_progress(file_id, true);
        if let Some(record) = self.queue.get(file_id) {
            info!(
                "✓ 文件上传完成: id={}, name={}, size={} bytes{}",
                record.id,
                record.name,
                record.size,
                if skipped { "（秒传）" } else { "" }
            );
            let complete = UploadEvent::FileComplete {
                file_id: record.id.clone(),
                name: record.name.clone(),
                size: record.size,
                completed_at: record
                    .completed_at
                    .unwrap_or_else(|| chrono::Utc::now().timestamp()),
            };
            self.events.publish(UploadEvent::FileSuccess {
                file_id: file_id.to_string(),
                url: response.url,
                extra: response.extra,
                skipped,
            });
            self.events.publish(complete);
        }

        self.emit_performance(true);
        self.pump();
    }

    /// 文件失败（终态）
    fn fail_file(&mut self, file_id: &str, error: UploadError) {
        self.release_file(file_id);
        if let Some(record) = self.queue.get_mut(file_id) {
            record.mark_error(error.to_string());
        }
        self.metrics.record_file_finished(false);
        self.persist(file_id);

        if let Some(record) = self.queue.get(file_id) {
            error!(
                "文件上传失败: id={}, name={}, 错误: {}",
                record.id, record.name, error
            );
            self.events.publish(UploadEvent::FileError {
                file_id: record.id.clone(),
                name: record.name.clone(),
                size: record.size,
                error,
            });
        }

        self.emit_performance(true);
        self.pump();
    }

    /// 释放文件占用的运行时资源（分片状态、节流记录）
    ///
    /// 已派发的分片不会被中断，结果到达时按过期序号丢弃
    fn release_file(&mut self, file_id: &str) {
        self.active.remove(file_id);
        self.chunks.remove(file_id);
        self.progress_throttle.remove(file_id);
    }

    // ---------------------------------------------------------------
    // 控制操作
    // ---------------------------------------------------------------

    fn pause(&mut self, file_id: &str) -> Result<(), ControlError> {
        let status = self
            .queue
            .get(file_id)
            .map(|r| r.status)
            .ok_or_else(|| ControlError::NotFound(file_id.to_string()))?;

        match status {
            FileStatus::Paused => return Ok(()),
            FileStatus::Initializing | FileStatus::Uploading => {}
            other => {
                return Err(ControlError::InvalidState {
                    file_id: file_id.to_string(),
                    status: other,
                    action: "pause",
                })
            }
        }

        let Some(active) = self.active.get(file_id) else {
            return Err(ControlError::NotFound(file_id.to_string()));
        };
        // 合并阶段不可暂停
        if active.finalizing {
            return Err(ControlError::InvalidState {
                file_id: file_id.to_string(),
                status,
                action: "pause",
            });
        }
        let descriptor = active.descriptor.clone();

        self.queue.update_status(file_id, FileStatus::Paused);
        self.persist(file_id);
        info!("文件已暂停: file_id={}", file_id);
        self.events.publish(UploadEvent::FilePaused {
            file_id: file_id.to_string(),
        });

        let transport = self.transport.clone();
        tokio::spawn(async move {
            if let Err(e) = transport.notify_pause(&descriptor).await {
                warn!(
                    "通知服务器暂停失败（忽略）: file={}, {:#}",
                    descriptor.name, e
                );
            }
        });
        Ok(())
    }

    fn resume(&mut self, file_id: &str) -> Result<(), ControlError> {
        let status = self
            .queue
            .get(file_id)
            .map(|r| r.status)
            .ok_or_else(|| ControlError::NotFound(file_id.to_string()))?;

        match status {
            FileStatus::Initializing | FileStatus::Uploading => return Ok(()),
            FileStatus::Paused => {}
            other => {
                return Err(ControlError::InvalidState {
                    file_id: file_id.to_string(),
                    status: other,
                    action: "resume",
                })
            }
        }

        // 初始化尚未完成时回到初始化中，由 InitFinished 继续推进
        let next = if self.chunks.contains(file_id) {
            FileStatus::Uploading
        } else {
            FileStatus::Initializing
        };
        self.queue.update_status(file_id, next);
        self.persist(file_id);
        info!("文件已恢复: file_id={}, 状态={}", file_id, next);
        self.events.publish(UploadEvent::FileResumed {
            file_id: file_id.to_string(),
        });

        self.advance(file_id);
        Ok(())
    }

    fn cancel(&mut self, file_id: &str) -> bool {
        let Some(record) = self.queue.remove(file_id) else {
            debug!("取消的文件不存在或已移除: {}", file_id);
            return false;
        };

        self.release_file(file_id);
        self.snapshots.remove(file_id);
        info!(
            "文件已取消: id={}, name={}, 状态={}",
            record.id, record.name, record.status
        );
        self.events.publish(UploadEvent::FileRemoved {
            file_id: record.id,
        });

        self.pump();
        true
    }

    /// 没有活跃文件也没有排队文件时发布一次 AllComplete
    fn check_idle(&mut self) {
        if self.idle_notified || self.queue.slot_holders() > 0 || self.queue.queued_len() > 0 {
            return;
        }
        self.idle_notified = true;

        let stats = self.queue.get_stats();
        info!(
            "所有文件处理完毕: 完成 {}, 失败 {}",
            stats.completed, stats.failed
        );
        self.events.publish(UploadEvent::AllComplete { stats });
    }

    fn shutdown(&mut self) {
        for file_id in self.active.keys() {
            self.chunks.remove(file_id);
        }
        self.active.clear();
        self.pool.shutdown();
        if let Err(e) = self.snapshots.flush() {
            warn!("关闭时写入上传快照失败: {:#}", e);
        }
        info!("上传编排器已关闭");
    }

    // ---------------------------------------------------------------
    // 辅助
    // ---------------------------------------------------------------

    fn is_current(&self, file_id: &str, epoch: u64) -> bool {
        self.active
            .get(file_id)
            .map(|a| a.epoch == epoch)
            .unwrap_or(false)
    }

    fn persist(&mut self, file_id: &str) {
        if let Some(record) = self.queue.get(file_id) {
            self.snapshots.upsert(SnapshotRecord::from_record(record));
        }
    }

    fn schedule_flush(&mut self) {
        if self.snapshots.take_flush_request() {
            self.schedule(self.persist_debounce, ControlMessage::PersistFlush);
        }
    }

    fn emit_progress(&mut self, file_id: &str, force: bool) {
        if !force && !self.progress_throttle.should_emit(file_id) {
            return;
        }
        let Some(record) = self.queue.get(file_id) else {
            return;
        };
        let completed_chunks = if record.status == FileStatus::Complete {
            record.total_chunks
        } else {
            record.parts.len() as u32
        };
        self.events.publish(UploadEvent::FileProgress {
            file_id: record.id.clone(),
            uploaded_size: record.uploaded_size,
            total_size: record.size,
            progress: record.progress,
            completed_chunks,
            total_chunks: record.total_chunks,
        });
    }

    fn emit_performance(&mut self, force: bool) {
        if !self.metrics.is_enabled() {
            return;
        }
        if !force && !self.perf_throttle.should_emit() {
            return;
        }
        let performance = self.performance_snapshot();
        self.events
            .publish(UploadEvent::PerformanceUpdate { performance });
    }

    fn performance_snapshot(&mut self) -> PerformanceSnapshot {
        let inflight: usize = self
            .active
            .keys()
            .map(|id| self.chunks.pending_count(id))
            .sum();
        let remaining = self.queue.remaining_bytes();
        self.metrics.snapshot(remaining, inflight)
    }

    /// 延迟后向控制循环发送消息；控制循环已退出时丢弃
    fn schedule(&self, delay: Duration, message: ControlMessage) {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(message);
            }
        });
    }

    /// 运行回调任务，结果作为消息发回；回调 panic 时由 `on_panic` 生成失败消息
    fn spawn_task<F>(
        &self,
        task: F,
        on_panic: impl FnOnce(String) -> ControlMessage + Send + 'static,
    ) where
        F: Future<Output = ControlMessage> + Send + 'static,
    {
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let message = match tokio::spawn(task).await {
                Ok(message) => message,
                Err(join_err) => on_panic(describe_join_error(join_err)),
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx.send(message);
            }
        });
    }
}

/// 调用 begin，需要上传时再查询已存在分片
///
/// 查询失败不影响上传，按没有已存在分片处理
async fn initialize_upload(
    transport: Arc<dyn UploadTransport>,
    mut file: FileDescriptor,
) -> Result<InitOutcome> {
    let begin = transport.begin(&file).await.context("begin 调用失败")?;
    if begin.skip_upload {
        return Ok(InitOutcome {
            begin,
            existing: None,
        });
    }

    file.upload_id = begin.upload_id.clone();
    let existing = match transport.list_existing_parts(&file).await {
        Ok(parts) => parts,
        Err(e) => {
            warn!(
                "查询已存在分片失败，从头上传: file={}, {:#}",
                file.name, e
            );
            None
        }
    };

    Ok(InitOutcome { begin, existing })
}
