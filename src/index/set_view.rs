use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::config::EngineConfig;
use crate::core::{
    AdaptiveScheduler, ChangeRecord, Partition, PartitionId, PartitionRegistry, PartitionState,
    ReadError, SelectError, SetViewError, StateChange, StateListener, UpdateBatch,
};
use crate::event::coordinator::{BurstReport, PendingUpdate, UpdateCoordinator};
use crate::event::feed::{ChangeFeed, DocumentSource};
use crate::index::builder::IndexBuilder;
use crate::index::compactor::{
    CleanupWaker, CompactionHandle, CompactionReport, CompactionTarget, Compactor,
};
use crate::index::fragment::IndexFragment;
use crate::index::slot::Fragments;
use crate::query::merge::{ViewMerger, ViewStream};
use crate::query::request::MergeRequest;
use crate::query::selector::Selection;
use crate::stats::{EngineStats, GroupInfo, PartitionInfo};
use crate::storage::GroupStore;

/// 没有 Cleanup 分区等待时，maintenance loop 的最长休眠
const MAINTENANCE_TICK: Duration = Duration::from_secs(5);

/// 引擎的外部协作者（都可缺省）
#[derive(Default, Clone)]
pub struct Collaborators {
    pub feed: Option<Arc<dyn ChangeFeed>>,
    pub documents: Option<Arc<dyn DocumentSource>>,
}

/// Set view 引擎：registry / builder / compactor / coordinator / merger 各一份，外加持久化目录。
///
/// 组件之间的状态通知走 registry 的 Weak 订阅；订阅者的 Arc 由这里持有，
/// 引擎被 drop 时订阅自然失效。
pub struct SetView {
    config: EngineConfig,
    registry: Arc<PartitionRegistry>,
    fragments: Arc<Fragments>,
    stats: Arc<EngineStats>,
    builder: Arc<IndexBuilder>,
    compactor: Arc<Compactor>,
    coordinator: Arc<UpdateCoordinator>,
    merger: Arc<ViewMerger>,
    /// registry 只持 Weak：订阅者在这里保活
    _listeners: Vec<Arc<dyn StateListener>>,
    cleanup_wake: Arc<Notify>,
    scheduler: Mutex<AdaptiveScheduler>,
    store: GroupStore,
    /// 最近一次落盘的 fragment 版本；未变化的分区 checkpoint 时跳过
    saved: Mutex<HashMap<PartitionId, u64>>,
}

impl SetView {
    /// 不读磁盘，从空 registry 开始
    pub fn empty(config: EngineConfig, collab: Collaborators) -> Self {
        Self::assemble(config, collab, PartitionRegistry::new(), Fragments::new())
    }

    /// 从数据目录恢复。
    ///
    /// 分区的 indexed-through seq 以 fragment 文件为准（fragment 先于 group.state 落盘）；
    /// fragment 缺失或损坏的分区从 seq 0 重建。Cleanup 分区在这里直接释放。
    pub async fn open(config: EngineConfig, collab: Collaborators) -> anyhow::Result<Self> {
        let store = GroupStore::new(config.data_dir.clone());
        let records = match store.load_group().await? {
            Some(g) => g.partitions,
            None => Vec::new(),
        };

        let fragments = Fragments::new();
        let mut saved = HashMap::new();
        let mut restored: Vec<Partition> = Vec::with_capacity(records.len());
        for mut rec in records {
            if rec.state == PartitionState::Missing {
                continue;
            }
            match store.load_fragment(rec.id).await? {
                Some(frag) => {
                    rec.indexed_seq = frag.indexed_seq();
                    saved.insert(rec.id, frag.version());
                    fragments.insert(frag);
                }
                None => {
                    if rec.indexed_seq > 0 {
                        tracing::warn!(
                            "Partition {} has no usable fragment, rebuilding from seq 0",
                            rec.id
                        );
                    }
                    rec.indexed_seq = 0;
                    fragments.insert(IndexFragment::new(rec.id));
                }
            }
            restored.push(rec);
        }

        let known: BTreeSet<PartitionId> = restored.iter().map(|p| p.id).collect();
        for id in store.fragment_ids().await? {
            if !known.contains(&id) {
                tracing::info!("Removing orphan fragment of partition {}", id);
                store.remove_fragment(id).await?;
            }
        }

        tracing::info!(
            "Opened set view at {} ({} partitions)",
            config.data_dir.display(),
            restored.len()
        );

        let view = Self::assemble(
            config,
            collab,
            PartitionRegistry::from_records(restored),
            fragments,
        );
        *view.saved.lock() = saved;
        view.run_cleanup(true).await?;
        Ok(view)
    }

    fn assemble(
        config: EngineConfig,
        collab: Collaborators,
        registry: PartitionRegistry,
        fragments: Fragments,
    ) -> Self {
        let registry = Arc::new(registry);
        let fragments = Arc::new(fragments);
        let stats = Arc::new(EngineStats::default());
        let cleanup_wake = Arc::new(Notify::new());

        let mut scheduler = AdaptiveScheduler::new();
        let parallelism = scheduler.resolve(config.build_parallelism);

        let builder = Arc::new(IndexBuilder::new(
            registry.clone(),
            fragments.clone(),
            stats.clone(),
            cleanup_wake.clone(),
        ));
        let compactor = Arc::new(Compactor::new(
            registry.clone(),
            fragments.clone(),
            stats.clone(),
        ));
        let coordinator = Arc::new(
            UpdateCoordinator::new(builder.clone(), registry.clone(), collab.feed, parallelism)
                .with_auto_compaction(compactor.clone(), config.compaction.clone()),
        );
        let merger = Arc::new(ViewMerger::new(
            registry.clone(),
            fragments.clone(),
            coordinator.clone(),
            collab.documents,
            config.plan_cache_capacity,
            config.update_before_timeout(),
            stats.clone(),
        ));
        let listeners: Vec<Arc<dyn StateListener>> = vec![
            coordinator.clone(),
            merger.clone(),
            Arc::new(CleanupWaker::new(cleanup_wake.clone())),
        ];
        for l in &listeners {
            registry.subscribe(Arc::downgrade(l));
        }

        Self {
            store: GroupStore::new(config.data_dir.clone()),
            config,
            registry,
            fragments,
            stats,
            builder,
            compactor,
            coordinator,
            merger,
            _listeners: listeners,
            cleanup_wake,
            scheduler: Mutex::new(scheduler),
            saved: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PartitionRegistry> {
        &self.registry
    }

    pub fn coordinator(&self) -> &Arc<UpdateCoordinator> {
        &self.coordinator
    }

    // ---- 分区状态 ----

    pub async fn set_partition_state(
        &self,
        id: PartitionId,
        to: PartitionState,
    ) -> Result<StateChange, SetViewError> {
        let mut changes = self.set_partition_states(vec![(id, to)]).await?;
        Ok(changes.remove(0))
    }

    /// 批量迁移，全部合法才生效。→ Missing 经 compactor 释放（等在跑的构建结束），
    /// 并删除对应的 fragment 文件。
    pub async fn set_partition_states(
        &self,
        transitions: Vec<(PartitionId, PartitionState)>,
    ) -> Result<Vec<StateChange>, SetViewError> {
        let compactor = self.compactor.clone();
        let changes =
            tokio::task::spawn_blocking(move || compactor.apply_transitions(&transitions))
                .await
                .map_err(|e| anyhow::anyhow!("state transition task failed: {}", e))??;

        for c in &changes {
            if c.to == PartitionState::Missing {
                self.forget_fragment(c.partition).await?;
            }
        }
        Ok(changes)
    }

    pub fn partition_state(&self, id: PartitionId) -> PartitionState {
        self.registry.state(id)
    }

    pub fn list_by_state(&self, state: PartitionState) -> BTreeSet<PartitionId> {
        self.registry.list_by_state(state)
    }

    pub fn select_partitions(&self, req: &MergeRequest) -> Result<Selection, SelectError> {
        self.merger.select(req)
    }

    // ---- 更新 ----

    pub fn submit(&self, batch: UpdateBatch) -> PendingUpdate {
        self.coordinator.submit(batch)
    }

    pub async fn submit_burst(&self, batches: Vec<UpdateBatch>) -> BurstReport {
        self.coordinator.submit_burst(batches).await
    }

    pub async fn submit_records(&self, records: Vec<ChangeRecord>) -> BurstReport {
        self.coordinator.submit_records(records).await
    }

    /// 绕过队列，在当前线程同步构建一批
    pub fn apply_batch(&self, batch: &UpdateBatch) -> Result<u64, SetViewError> {
        Ok(self.builder.apply_batch(batch)?)
    }

    // ---- 读 ----

    pub async fn merge_read(&self, req: MergeRequest) -> Result<ViewStream, ReadError> {
        self.merger.merge_read(req).await
    }

    // ---- 维护 ----

    pub fn compact(&self, target: CompactionTarget) -> Result<CompactionHandle, SetViewError> {
        Ok(self.compactor.compact(target)?)
    }

    /// 启动并等待 compaction；merged compaction 顺带释放的分区同时删除 fragment 文件
    pub async fn run_compaction(
        &self,
        target: CompactionTarget,
    ) -> Result<CompactionReport, SetViewError> {
        let report = self.compact(target)?.wait().await?;
        for &p in &report.disposed {
            self.forget_fragment(p).await?;
        }
        Ok(report)
    }

    /// 释放过了宽限期（或 `force`）的 Cleanup 分区，并删除其 fragment 文件
    pub async fn run_cleanup(&self, force: bool) -> anyhow::Result<Vec<PartitionId>> {
        let compactor = self.compactor.clone();
        let grace = self.config.cleanup_grace();
        let disposed = tokio::task::spawn_blocking(move || compactor.dispose_cleanup(grace, force))
            .await
            .map_err(|e| anyhow::anyhow!("cleanup task failed: {}", e))?;
        for &p in &disposed {
            self.forget_fragment(p).await?;
        }
        Ok(disposed)
    }

    async fn forget_fragment(&self, p: PartitionId) -> anyhow::Result<()> {
        self.saved.lock().remove(&p);
        self.store.remove_fragment(p).await
    }

    /// 落盘：先写有变化的 fragment，再写 group.state
    pub async fn checkpoint(&self) -> anyhow::Result<()> {
        let started = Instant::now();
        let mut written = 0usize;
        let mut bytes = 0u64;

        for slot in self.fragments.all() {
            let p = slot.partition();
            if !self.registry.state(p).is_indexable() {
                continue;
            }
            let frag = slot.load();
            if self.saved.lock().get(&p) == Some(&frag.version()) {
                continue;
            }
            bytes += self.store.save_fragment(&frag).await?;
            self.saved.lock().insert(p, frag.version());
            written += 1;
        }

        self.store.save_group(self.registry.snapshot()).await?;
        tracing::info!(
            "Checkpoint complete: {} fragments ({} bytes) in {:?}",
            written,
            bytes,
            started.elapsed()
        );
        Ok(())
    }

    /// 后台维护：Cleanup 唤醒或定时 tick 时释放分区，调整构建并发，按间隔 checkpoint
    pub async fn maintenance_loop(self: Arc<Self>) {
        let checkpoint_every = self.config.checkpoint_interval();
        let mut last_checkpoint = Instant::now();
        loop {
            let tick = if self.registry.list_by_state(PartitionState::Cleanup).is_empty() {
                MAINTENANCE_TICK
            } else {
                self.config
                    .cleanup_grace()
                    .clamp(Duration::from_millis(10), MAINTENANCE_TICK)
            };
            tokio::select! {
                _ = tokio::time::sleep(tick) => {},
                _ = self.cleanup_wake.notified() => {},
            }

            if let Err(e) = self.run_cleanup(false).await {
                tracing::error!("Cleanup failed: {:#}", e);
            }

            if self.config.build_parallelism == 0 {
                let n = self.scheduler.lock().adjust_parallelism();
                self.coordinator.set_parallelism(n);
            }

            if let Some(every) = checkpoint_every {
                if last_checkpoint.elapsed() >= every {
                    if let Err(e) = self.checkpoint().await {
                        tracing::error!("Checkpoint failed: {:#}", e);
                    }
                    last_checkpoint = Instant::now();
                }
            }
        }
    }

    pub fn info(&self) -> GroupInfo {
        let partitions = self
            .registry
            .snapshot()
            .into_iter()
            .map(|p| {
                let (stats, compacting) = match self.fragments.get(p.id) {
                    Some(slot) => (slot.load().stats(), slot.is_compacting()),
                    None => (IndexFragment::new(p.id).stats(), false),
                };
                PartitionInfo {
                    id: p.id,
                    state: p.state,
                    indexed_seq: p.indexed_seq,
                    pending_update: p.pending_update,
                    last_error: p.last_error,
                    version: stats.version,
                    live_entries: stats.live_entries,
                    tombstones: stats.tombstones,
                    back_index_rows: stats.back_index_rows,
                    compacting,
                }
            })
            .collect();
        GroupInfo {
            partitions,
            counters: self.stats.counters(),
            process_rss_bytes: GroupInfo::read_process_rss(),
        }
    }
}
