//! 分片执行后端
//!
//! 管理一组并行执行槽位，每个槽位是一个常驻 tokio 任务：
//! - 空闲槽位接收分片任务，任务结束后通过事件通道上报结果
//! - 槽位任务 panic 时由监督任务上报故障，编排器将其驱逐
//! - 槽位全忙时分片直接执行，不在忙碌槽位后排队
//! - 槽位全部被驱逐后后端自动禁用，所有分片改为直接执行
//! - 池大小为 0 时从一开始就是直接执行模式
//!
//! 槽位表只由编排器控制循环访问，内部不加锁

use futures::future::BoxFuture;
use tokio::sync::mpsc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 分片上传工作，返回服务器 etag
pub type ChunkWork = BoxFuture<'static, anyhow::Result<String>>;

/// 提交给后端的分片任务
pub struct ChunkJob {
    pub file_id: String,
    /// 文件被调度时分配的序号，用于丢弃取消后到达的过期结果
    pub epoch: u64,
    pub part_number: u32,
    pub work: ChunkWork,
}

impl ChunkJob {
    pub fn new(file_id: impl Into<String>, part_number: u32, work: ChunkWork) -> Self {
        Self {
            file_id: file_id.into(),
            epoch: 0,
            part_number,
            work,
        }
    }

    pub fn with_epoch(mut self, epoch: u64) -> Self {
        self.epoch = epoch;
        self
    }

    fn assignment(&self) -> SlotAssignment {
        SlotAssignment {
            file_id: self.file_id.clone(),
            epoch: self.epoch,
            part_number: self.part_number,
        }
    }
}

impl std::fmt::Debug for ChunkJob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkJob")
            .field("file_id", &self.file_id)
            .field("epoch", &self.epoch)
            .field("part_number", &self.part_number)
            .finish_non_exhaustive()
    }
}

/// 分片执行结果
#[derive(Debug, Clone)]
pub struct ChunkOutcome {
    pub file_id: String,
    pub epoch: u64,
    pub part_number: u32,
    /// 执行槽位，直接执行时为 None
    pub slot_id: Option<usize>,
    /// 成功返回 etag，失败返回错误描述
    pub result: Result<String, String>,
}

/// 后端上报给编排器的事件
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// 分片执行结束（每次派发恰好一次）
    Completed(ChunkOutcome),
    /// 槽位自身崩溃，正在执行的分片没有结果
    SlotCrashed { slot_id: usize, reason: String },
}

/// 提交结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// 已派发到槽位
    Dispatched(usize),
    /// 无空闲槽位或后端禁用，直接执行
    Direct,
}

/// 槽位当前执行的分片
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    pub file_id: String,
    pub epoch: u64,
    pub part_number: u32,
}

/// 执行槽位
#[derive(Debug)]
pub struct ExecutionSlot {
    pub id: usize,
    /// None 表示空闲
    current: Option<SlotAssignment>,
    jobs: mpsc::UnboundedSender<ChunkJob>,
}

impl ExecutionSlot {
    pub fn is_busy(&self) -> bool {
        self.current.is_some()
    }

    pub fn current(&self) -> Option<&SlotAssignment> {
        self.current.as_ref()
    }
}

/// 默认槽位数：min(CPU 并行度, 8)，至少为 1
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .clamp(1, 8)
}

/// 执行槽位池
#[derive(Debug)]
pub struct WorkerPool {
    slots: Vec<ExecutionSlot>,
    enabled: bool,
    events: mpsc::UnboundedSender<BackendEvent>,
    shutdown: CancellationToken,
}

impl WorkerPool {
    /// 创建直接执行模式的后端，调用 `initialize` 后才会有槽位
    pub fn new(events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self {
            slots: Vec::new(),
            enabled: false,
            events,
            shutdown: CancellationToken::new(),
        }
    }

    /// 创建 `size` 个执行槽位，0 表示始终直接执行
    pub fn initialize(&mut self, size: usize) {
        if !self.slots.is_empty() {
            warn!("执行槽位池已初始化，忽略重复初始化");
            return;
        }
        if size == 0 {
            self.enabled = false;
            info!("执行槽位池大小为 0，所有分片直接执行");
            return;
        }

        for slot_id in 0..size {
            let (tx, rx) = mpsc::unbounded_channel();
            spawn_supervised_worker(slot_id, rx, self.events.clone(), self.shutdown.clone());
            self.slots.push(ExecutionSlot {
                id: slot_id,
                current: None,
                jobs: tx,
            });
        }
        self.enabled = true;
        info!("✓ 执行槽位池已初始化: {} 个槽位", size);
    }

    /// 是否启用槽位池（false 表示直接执行）
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// 存活槽位数
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// 忙碌槽位数
    pub fn busy_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_busy()).count()
    }

    pub fn slots(&self) -> &[ExecutionSlot] {
        &self.slots
    }

    /// 获取一个空闲槽位
    pub fn get_available(&self) -> Option<usize> {
        if !self.enabled {
            return None;
        }
        self.slots.iter().find(|s| !s.is_busy()).map(|s| s.id)
    }

    /// 派发任务到指定槽位
    ///
    /// 槽位不存在或已失效时返回原任务，由调用方直接执行；
    /// 失效的槽位会被驱逐
    pub fn dispatch(&mut self, slot_id: usize, job: ChunkJob) -> Result<(), ChunkJob> {
        let Some(index) = self.slots.iter().position(|s| s.id == slot_id) else {
            return Err(job);
        };
        let slot = &mut self.slots[index];
        if slot.is_busy() {
            return Err(job);
        }

        let assignment = job.assignment();
        match slot.jobs.send(job) {
            Ok(()) => {
                debug!(
                    "分片派发到槽位 {}: file_id={}, part={}",
                    slot_id, assignment.file_id, assignment.part_number
                );
                slot.current = Some(assignment);
                Ok(())
            }
            Err(mpsc::error::SendError(job)) => {
                warn!("槽位 {} 已失效，驱逐后改为直接执行", slot_id);
                self.evict(slot_id);
                Err(job)
            }
        }
    }

    /// 提交任务：有空闲槽位时派发，否则直接执行
    ///
    /// 卡住的分片只占用自己的槽位，其他分片不会排在它后面
    pub fn submit(&mut self, job: ChunkJob) -> Submission {
        let mut job = job;
        while let Some(slot_id) = self.get_available() {
            match self.dispatch(slot_id, job) {
                Ok(()) => return Submission::Dispatched(slot_id),
                Err(returned) => job = returned,
            }
        }

        self.run_direct(job);
        Submission::Direct
    }

    /// 槽位完成一次派发，标记空闲
    pub fn complete(&mut self, slot_id: usize) {
        if let Some(slot) = self.slots.iter_mut().find(|s| s.id == slot_id) {
            slot.current = None;
        }
    }

    /// 驱逐槽位，返回其正在执行的分片
    pub fn evict(&mut self, slot_id: usize) -> Option<SlotAssignment> {
        let index = self.slots.iter().position(|s| s.id == slot_id)?;
        let slot = self.slots.remove(index);
        warn!(
            "驱逐执行槽位 {}，剩余 {} 个槽位",
            slot_id,
            self.slots.len()
        );

        if self.slots.is_empty() && self.enabled {
            self.enabled = false;
            error!("执行槽位已全部失效，降级为直接执行");
        }
        // 丢弃发送端后工作任务退出
        slot.current
    }

    /// 直接执行（同样受监督：任务 panic 时也会上报一次失败结果）
    pub fn run_direct(&self, job: ChunkJob) {
        let events = self.events.clone();
        let ChunkJob {
            file_id,
            epoch,
            part_number,
            work,
        } = job;

        tokio::spawn(async move {
            let result = match tokio::spawn(work).await {
                Ok(result) => result.map_err(|e| format!("{:#}", e)),
                Err(join_err) => Err(describe_join_error(join_err)),
            };
            let _ = events.send(BackendEvent::Completed(ChunkOutcome {
                file_id,
                epoch,
                part_number,
                slot_id: None,
                result,
            }));
        });
    }

    /// 关闭全部槽位
    pub fn shutdown(&mut self) {
        self.shutdown.cancel();
        self.slots.clear();
        self.enabled = false;
        info!("执行槽位池已关闭");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// 启动槽位工作任务及其监督任务
fn spawn_supervised_worker(
    slot_id: usize,
    jobs: mpsc::UnboundedReceiver<ChunkJob>,
    events: mpsc::UnboundedSender<BackendEvent>,
    shutdown: CancellationToken,
) {
    let worker = tokio::spawn(worker_loop(slot_id, jobs, events.clone(), shutdown));

    tokio::spawn(async move {
        if let Err(join_err) = worker.await {
            let reason = describe_join_error(join_err);
            error!("执行槽位 {} 崩溃: {}", slot_id, reason);
            let _ = events.send(BackendEvent::SlotCrashed { slot_id, reason });
        }
    });
}

async fn worker_loop(
    slot_id: usize,
    mut jobs: mpsc::UnboundedReceiver<ChunkJob>,
    events: mpsc::UnboundedSender<BackendEvent>,
    shutdown: CancellationToken,
) {
    loop {
        let job = tokio::select! {
            _ = shutdown.cancelled() => break,
            job = jobs.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        let ChunkJob {
            file_id,
            epoch,
            part_number,
            work,
        } = job;
        let result = work.await.map_err(|e| format!("{:#}", e));
        let _ = events.send(BackendEvent::Completed(ChunkOutcome {
            file_id,
            epoch,
            part_number,
            slot_id: Some(slot_id),
            result,
        }));
    }
    debug!("执行槽位 {} 退出", slot_id);
}

pub(crate) fn describe_join_error(err: JoinError) -> String {
    if !err.is_panic() {
        return "任务被取消".to_string();
    }
    let payload = err.into_panic();
    if let Some(msg) = payload.downcast_ref::<&str>() {
        format!("panic: {}", msg)
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        format!("panic: {}", msg)
    } else {
        "panic".to_string()
    }
}
