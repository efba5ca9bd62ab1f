use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch, Semaphore};
use tokio::task::JoinSet;

use crate::config::CompactionConfig;
use crate::core::{
    ChangeRecord, PartitionId, PartitionRegistry, StateChange, StateListener, UpdateBatch,
    UpdateError,
};
use crate::event::feed::ChangeFeed;
use crate::index::builder::IndexBuilder;
use crate::index::compactor::Compactor;

type Reply = oneshot::Sender<Result<u64, UpdateError>>;

struct QueuedBatch {
    ticket: u64,
    batch: UpdateBatch,
    reply: Reply,
}

/// 单分区队列。
///
/// ticket 按提交顺序递增；`completed` 广播已处理到的 ticket，
/// worker 空闲时直接推到 `submitted`（被取消的 ticket 也算处理完）。
struct PartitionQueue {
    running: bool,
    pending: VecDeque<QueuedBatch>,
    submitted: u64,
    /// 已入队记录的最高 seq；只在 worker 运行期间有效，
    /// catch_up 从这里续拉，避免与排队批次重叠
    queued_through: u64,
    completed: watch::Sender<u64>,
}

impl PartitionQueue {
    fn new() -> Self {
        let (completed, _) = watch::channel(0);
        Self {
            running: false,
            pending: VecDeque::new(),
            submitted: 0,
            queued_through: 0,
            completed,
        }
    }
}

/// `submit` 返回的完成信号。
///
/// 在被 worker 取走之前 `cancel()` 或直接丢弃都会把批次移出队列；
/// 已在构建中的批次总会跑完。需要"提交后不管"时用 `detach()`。
pub struct PendingUpdate {
    partition: PartitionId,
    ticket: u64,
    rx: oneshot::Receiver<Result<u64, UpdateError>>,
    coordinator: Weak<UpdateCoordinator>,
    armed: bool,
}

impl PendingUpdate {
    fn resolved(partition: PartitionId, result: Result<u64, UpdateError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Self {
            partition,
            ticket: 0,
            rx,
            coordinator: Weak::new(),
            armed: false,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// 仍在排队时移出队列并返回 true；之后 await 得到 `Cancelled`
    pub fn cancel(&mut self) -> bool {
        self.armed = false;
        match self.coordinator.upgrade() {
            Some(c) => c.cancel_queued(self.partition, self.ticket),
            None => false,
        }
    }

    pub fn detach(mut self) {
        self.armed = false;
    }
}

impl Future for PendingUpdate {
    type Output = Result<u64, UpdateError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(r) => {
                self.armed = false;
                Poll::Ready(r.unwrap_or(Err(UpdateError::WorkerGone)))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingUpdate {
    fn drop(&mut self) {
        if self.armed {
            if let Some(c) = self.coordinator.upgrade() {
                c.cancel_queued(self.partition, self.ticket);
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BurstOutcome {
    Done(u64),
    Failed(UpdateError),
    /// 快速失败时尚未完成（仍在后台继续）
    Pending,
}

#[derive(Clone, Debug, Default)]
pub struct BurstReport {
    pub outcomes: BTreeMap<PartitionId, BurstOutcome>,
}

impl BurstReport {
    pub fn is_complete(&self) -> bool {
        self.outcomes
            .values()
            .all(|o| matches!(o, BurstOutcome::Done(_)))
    }

    pub fn failed(&self) -> Vec<(PartitionId, &UpdateError)> {
        self.outcomes
            .iter()
            .filter_map(|(p, o)| match o {
                BurstOutcome::Failed(e) => Some((*p, e)),
                _ => None,
            })
            .collect()
    }

    pub fn seq(&self, partition: PartitionId) -> Option<u64> {
        match self.outcomes.get(&partition) {
            Some(BurstOutcome::Done(s)) => Some(*s),
            _ => None,
        }
    }
}

/// 更新协调器：每分区一个 worker，同一分区同一时刻最多一个 `apply_batch`。
pub struct UpdateCoordinator {
    builder: Arc<IndexBuilder>,
    registry: Arc<PartitionRegistry>,
    feed: Option<Arc<dyn ChangeFeed>>,
    auto_compact: Option<(Arc<Compactor>, CompactionConfig)>,
    permits: Arc<Semaphore>,
    parallelism: Mutex<usize>,
    queues: Mutex<HashMap<PartitionId, PartitionQueue>>,
}

impl UpdateCoordinator {
    pub fn new(
        builder: Arc<IndexBuilder>,
        registry: Arc<PartitionRegistry>,
        feed: Option<Arc<dyn ChangeFeed>>,
        parallelism: usize,
    ) -> Self {
        let parallelism = parallelism.max(1);
        Self {
            builder,
            registry,
            feed,
            auto_compact: None,
            permits: Arc::new(Semaphore::new(parallelism)),
            parallelism: Mutex::new(parallelism),
            queues: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_auto_compaction(mut self, compactor: Arc<Compactor>, cfg: CompactionConfig) -> Self {
        if cfg.auto {
            self.auto_compact = Some((compactor, cfg));
        }
        self
    }

    pub fn parallelism(&self) -> usize {
        *self.parallelism.lock()
    }

    /// 调整并发构建上限；收缩时后台吃掉多余的 permit
    pub fn set_parallelism(&self, n: usize) {
        let n = n.max(1);
        let mut cur = self.parallelism.lock();
        if n > *cur {
            self.permits.add_permits(n - *cur);
        } else if n < *cur {
            let shrink = (*cur - n) as u32;
            let permits = self.permits.clone();
            tokio::spawn(async move {
                if let Ok(p) = permits.acquire_many_owned(shrink).await {
                    p.forget();
                }
            });
        }
        *cur = n;
    }

    pub fn submit(self: &Arc<Self>, batch: UpdateBatch) -> PendingUpdate {
        let p = batch.partition;
        let state = self.registry.state(p);
        if !state.is_indexable() {
            return PendingUpdate::resolved(
                p,
                Err(UpdateError::PartitionUnavailable {
                    partition: p,
                    state,
                }),
            );
        }

        let (tx, rx) = oneshot::channel();
        let (ticket, spawn) = {
            let mut qs = self.queues.lock();
            let q = qs.entry(p).or_insert_with(PartitionQueue::new);
            q.submitted += 1;
            let ticket = q.submitted;
            if let Some(last) = batch.last_seq() {
                q.queued_through = q.queued_through.max(last);
            }
            q.pending.push_back(QueuedBatch {
                ticket,
                batch,
                reply: tx,
            });
            let spawn = !q.running;
            q.running = true;
            (ticket, spawn)
        };
        self.registry.set_pending(p, true);
        if spawn {
            let this = self.clone();
            tokio::spawn(async move { this.run_worker(p).await });
        }

        PendingUpdate {
            partition: p,
            ticket,
            rx,
            coordinator: Arc::downgrade(self),
            armed: true,
        }
    }

    /// 批量提交：按分区拆分、各分区独立并行；全部完成或首个失败即返回。
    pub async fn submit_burst(self: &Arc<Self>, batches: Vec<UpdateBatch>) -> BurstReport {
        let mut per_partition: BTreeMap<PartitionId, Vec<PendingUpdate>> = BTreeMap::new();
        for b in batches {
            let p = b.partition;
            per_partition.entry(p).or_default().push(self.submit(b));
        }

        let mut report = BurstReport::default();
        let mut set = JoinSet::new();
        for (p, pendings) in per_partition {
            report.outcomes.insert(p, BurstOutcome::Pending);
            set.spawn(async move {
                let mut last = Ok(0);
                for pu in pendings {
                    last = pu.await;
                    if last.is_err() {
                        break;
                    }
                }
                (p, last)
            });
        }

        while let Some(joined) = set.join_next().await {
            let Ok((p, res)) = joined else {
                continue;
            };
            match res {
                Ok(seq) => {
                    report.outcomes.insert(p, BurstOutcome::Done(seq));
                }
                Err(e) => {
                    tracing::warn!("Burst update failed on partition {}: {}", p, e);
                    report.outcomes.insert(p, BurstOutcome::Failed(e));
                    // 快速失败：其余分区继续在后台完成
                    set.detach_all();
                    break;
                }
            }
        }
        report
    }

    pub async fn submit_records(self: &Arc<Self>, records: Vec<ChangeRecord>) -> BurstReport {
        let batches = UpdateBatch::split_by_partition(records).into_values().collect();
        self.submit_burst(batches).await
    }

    /// 等待调用时刻已排队的全部批次处理完
    pub async fn drain(&self, partitions: &[PartitionId]) {
        let waits: Vec<(u64, watch::Receiver<u64>)> = {
            let qs = self.queues.lock();
            partitions
                .iter()
                .filter_map(|p| qs.get(p))
                .map(|q| (q.submitted, q.completed.subscribe()))
                .collect()
        };
        for (target, mut rx) in waits {
            let _ = rx.wait_for(|c| *c >= target).await;
        }
    }

    /// 从 change feed 拉取 indexed-through 之后的变更并提交（不等待完成）
    pub fn catch_up(self: &Arc<Self>, partition: PartitionId) -> anyhow::Result<Option<PendingUpdate>> {
        let Some(feed) = &self.feed else {
            return Ok(None);
        };
        if !self.registry.state(partition).is_indexable() {
            return Ok(None);
        }
        let indexed = self.registry.indexed_seq(partition).unwrap_or(0);
        let since = {
            let qs = self.queues.lock();
            match qs.get(&partition) {
                Some(q) if q.running => q.queued_through.max(indexed),
                _ => indexed,
            }
        };
        let records = feed.changes_since(partition, since)?;
        if records.is_empty() {
            return Ok(None);
        }
        tracing::debug!(
            "Catching up partition {} from seq {} ({} records)",
            partition,
            since,
            records.len()
        );
        Ok(Some(self.submit(UpdateBatch::new(partition, records))))
    }

    /// update-before：先追平 feed，再等排队批次全部完成
    pub async fn update_before(self: &Arc<Self>, partitions: &[PartitionId]) {
        for &p in partitions {
            match self.catch_up(p) {
                Ok(Some(pu)) => pu.detach(),
                Ok(None) => {}
                Err(e) => tracing::warn!("Change feed read failed for partition {}: {:#}", p, e),
            }
        }
        self.drain(partitions).await;
    }

    /// update-after：后台追平，不阻塞读
    pub fn schedule_catch_up(self: &Arc<Self>, partitions: &[PartitionId]) {
        for &p in partitions {
            match self.catch_up(p) {
                Ok(Some(pu)) => pu.detach(),
                Ok(None) => {}
                Err(e) => tracing::warn!("Change feed read failed for partition {}: {:#}", p, e),
            }
        }
    }

    pub fn queued(&self, partition: PartitionId) -> usize {
        self.queues
            .lock()
            .get(&partition)
            .map(|q| q.pending.len())
            .unwrap_or(0)
    }

    pub fn is_busy(&self, partition: PartitionId) -> bool {
        self.queues
            .lock()
            .get(&partition)
            .map(|q| q.running)
            .unwrap_or(false)
    }

    fn cancel_queued(&self, partition: PartitionId, ticket: u64) -> bool {
        let removed = {
            let mut qs = self.queues.lock();
            let Some(q) = qs.get_mut(&partition) else {
                return false;
            };
            let Some(pos) = q.pending.iter().position(|b| b.ticket == ticket) else {
                return false;
            };
            q.pending.remove(pos)
        };
        match removed {
            Some(b) => {
                tracing::debug!("Cancelled queued batch {} of partition {}", ticket, partition);
                let _ = b.reply.send(Err(UpdateError::Cancelled));
                true
            }
            None => false,
        }
    }

    /// 占一个 permit，在阻塞线程池里跑一次 `apply_batch`
    async fn build(&self, batch: UpdateBatch) -> Result<u64, UpdateError> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| UpdateError::WorkerGone)?;
        let builder = self.builder.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            builder.apply_batch(&batch)
        })
        .await
        .map_err(|_| UpdateError::WorkerGone)?
        .map_err(UpdateError::from)
    }

    fn after_build(&self, p: PartitionId) {
        if let Some((compactor, cfg)) = &self.auto_compact {
            compactor.maybe_auto_compact(p, cfg);
        }
    }

    async fn run_worker(self: Arc<Self>, p: PartitionId) {
        loop {
            let group: Vec<QueuedBatch> = {
                let mut qs = self.queues.lock();
                let Some(q) = qs.get_mut(&p) else {
                    return;
                };
                if q.pending.is_empty() {
                    q.running = false;
                    q.completed.send_replace(q.submitted);
                    q.queued_through = self.registry.indexed_seq(p).unwrap_or(0);
                    drop(qs);
                    self.registry.set_pending(p, false);
                    return;
                }
                q.pending.drain(..).collect()
            };

            if group.len() > 1 {
                tracing::debug!("Coalescing {} queued batches for partition {}", group.len(), p);
            }
            let last_ticket = group.last().map(|b| b.ticket).unwrap_or(0);
            let records: Vec<ChangeRecord> = group
                .iter()
                .flat_map(|b| b.batch.records.iter().cloned())
                .collect();
            let start_seq = self.registry.indexed_seq(p).unwrap_or(0);

            match self.build(UpdateBatch::new(p, records)).await {
                Ok(_) => {
                    let mut seq = start_seq;
                    for b in group {
                        seq = b.batch.last_seq().unwrap_or(seq);
                        let _ = b.reply.send(Ok(seq));
                    }
                    self.after_build(p);
                }
                Err(e) if group.len() > 1 => {
                    // 合并后失败：逐批重放，错误只落在出问题的批次上
                    tracing::debug!(
                        "Coalesced update of partition {} failed ({}), retrying batch by batch",
                        p,
                        e
                    );
                    let mut any_ok = false;
                    for b in group {
                        let r = self.build(b.batch).await;
                        any_ok |= r.is_ok();
                        let _ = b.reply.send(r);
                    }
                    if any_ok {
                        self.after_build(p);
                    }
                }
                Err(e) => {
                    tracing::warn!("Update of partition {} failed: {}", p, e);
                    for b in group {
                        let _ = b.reply.send(Err(e.clone()));
                    }
                }
            }

            if let Some(q) = self.queues.lock().get_mut(&p) {
                q.completed.send_replace(last_ticket);
            }
        }
    }
}

impl StateListener for UpdateCoordinator {
    /// 进入 Cleanup / Missing：排队中的批次全部失败，在跑的构建照常完成
    fn on_transition(&self, change: &StateChange) {
        if change.to.is_indexable() {
            return;
        }
        let dropped: Vec<QueuedBatch> = {
            let mut qs = self.queues.lock();
            let Some(q) = qs.get_mut(&change.partition) else {
                return;
            };
            // 分区重新创建后从 seq 0 开始，旧的入队水位作废
            q.queued_through = 0;
            q.pending.drain(..).collect()
        };
        if dropped.is_empty() {
            return;
        }
        tracing::info!(
            "Partition {} entered {}: failing {} queued batches",
            change.partition,
            change.to,
            dropped.len()
        );
        for b in dropped {
            let _ = b.reply.send(Err(UpdateError::PartitionUnavailable {
                partition: change.partition,
                state: change.to,
            }));
        }
    }
}
