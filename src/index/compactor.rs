use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rayon::prelude::*;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::config::CompactionConfig;
use crate::core::{
    CompactionError, PartitionId, PartitionRegistry, PartitionState, StateChange, StateError,
    StateListener,
};
use crate::index::builder::apply_record;
use crate::index::fragment::FragmentStats;
use crate::index::slot::{FragmentSlot, Fragments};
use crate::stats::EngineStats;

#[cfg(feature = "mimalloc")]
fn maybe_trim_rss() {
    // mimalloc 作为全局分配器时，glibc 的 malloc_trim 无效，需要调用 mimalloc 自己的回收。
    extern "C" {
        fn mi_collect(force: bool);
    }
    unsafe { mi_collect(true) };
}

#[cfg(all(not(feature = "mimalloc"), target_os = "linux", target_env = "gnu"))]
fn maybe_trim_rss() {
    // glibc malloc 的主动回吐：释放尽可能多的空闲块回 OS。
    unsafe {
        libc::malloc_trim(0);
    }
}

#[cfg(all(
    not(feature = "mimalloc"),
    not(all(target_os = "linux", target_env = "gnu"))
))]
fn maybe_trim_rss() {}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionTarget {
    Partition(PartitionId),
    /// 全部 Active/Passive 分区，并顺带释放 Cleanup 分区
    Merged,
}

impl fmt::Display for CompactionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionTarget::Partition(p) => write!(f, "partition {}", p),
            CompactionTarget::Merged => f.write_str("merged view"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompactionPhase {
    Idle,
    Running,
    Replaying,
    Promoting,
}

#[derive(Clone, Debug)]
pub struct PartitionCompaction {
    pub partition: PartitionId,
    pub before: FragmentStats,
    pub after: FragmentStats,
    /// 重写期间并发到达、被回放到新 fragment 上的记录数
    pub replayed: usize,
}

#[derive(Clone, Debug, Default)]
pub struct CompactionReport {
    pub compacted: Vec<PartitionCompaction>,
    pub aborted: Vec<(PartitionId, CompactionError)>,
    pub disposed: Vec<PartitionId>,
}

/// 后台 compaction 的句柄：观察阶段、取消、等待结果。
///
/// 丢弃句柄不会取消任务。
pub struct CompactionHandle {
    target: CompactionTarget,
    phase: watch::Receiver<CompactionPhase>,
    cancel: Arc<AtomicBool>,
    task: JoinHandle<Result<CompactionReport, CompactionError>>,
}

impl CompactionHandle {
    pub fn target(&self) -> CompactionTarget {
        self.target
    }

    pub fn phase(&self) -> CompactionPhase {
        *self.phase.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<CompactionPhase> {
        self.phase.clone()
    }

    /// 请求中断；旧 fragment 保持权威，任务以 `Aborted` 结束
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::Release);
    }

    pub async fn wait(self) -> Result<CompactionReport, CompactionError> {
        match self.task.await {
            Ok(r) => r,
            Err(e) => Err(CompactionError::Aborted {
                target: self.target.to_string(),
                reason: e.to_string(),
            }),
        }
    }
}

struct Control {
    phase: watch::Sender<CompactionPhase>,
    cancel: Arc<AtomicBool>,
}

impl Control {
    fn set(&self, phase: CompactionPhase) {
        self.phase.send_replace(phase);
    }
}

/// 任何退出路径都要释放 compacting 标记并关闭回放缓冲
struct Claim<'a> {
    slot: &'a FragmentSlot,
    promoted: bool,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.slot.end_compaction(self.promoted);
    }
}

pub struct Compactor {
    registry: Arc<PartitionRegistry>,
    fragments: Arc<Fragments>,
    stats: Arc<EngineStats>,
}

impl Compactor {
    pub fn new(
        registry: Arc<PartitionRegistry>,
        fragments: Arc<Fragments>,
        stats: Arc<EngineStats>,
    ) -> Self {
        Self {
            registry,
            fragments,
            stats,
        }
    }

    /// 启动后台 compaction。
    ///
    /// 单分区目标在这里同步检查状态并占位：不可用返回 `PartitionUnavailable`，
    /// 已有 compaction 在跑返回 `AlreadyRunning`。
    pub fn compact(
        self: &Arc<Self>,
        target: CompactionTarget,
    ) -> Result<CompactionHandle, CompactionError> {
        let claimed = match target {
            CompactionTarget::Partition(p) => Some(self.claim(p)?),
            CompactionTarget::Merged => None,
        };

        let (tx, rx) = watch::channel(CompactionPhase::Idle);
        let cancel = Arc::new(AtomicBool::new(false));
        let ctl = Control {
            phase: tx,
            cancel: cancel.clone(),
        };
        let this = self.clone();
        let task = tokio::task::spawn_blocking(move || {
            tracing::info!("Starting compaction of {}", target);
            let res = match claimed {
                Some(slot) => this
                    .run_partition(&slot, &ctl)
                    .map(|done| CompactionReport {
                        compacted: vec![done],
                        ..Default::default()
                    }),
                None => Ok(this.run_merged(&ctl)),
            };
            ctl.set(CompactionPhase::Idle);
            maybe_trim_rss();
            match &res {
                Ok(r) => tracing::info!(
                    "Compaction of {} complete: {} compacted, {} aborted, {} disposed",
                    target,
                    r.compacted.len(),
                    r.aborted.len(),
                    r.disposed.len()
                ),
                Err(e) => tracing::warn!("{}", e),
            }
            res
        });

        Ok(CompactionHandle {
            target,
            phase: rx,
            cancel,
            task,
        })
    }

    /// 构建完成后的自动 compaction 判定；已在跑时静默跳过
    pub fn maybe_auto_compact(
        self: &Arc<Self>,
        partition: PartitionId,
        cfg: &CompactionConfig,
    ) -> Option<CompactionHandle> {
        let slot = self.fragments.get(partition)?;
        if slot.is_compacting() {
            return None;
        }
        let frag = slot.load();
        let st = frag.stats();
        if !cfg.should_compact(st.live_entries + st.tombstones, frag.garbage_ratio()) {
            return None;
        }
        tracing::debug!(
            "Auto compaction of partition {} (garbage ratio {:.2})",
            partition,
            frag.garbage_ratio()
        );
        self.compact(CompactionTarget::Partition(partition)).ok()
    }

    fn claim(&self, p: PartitionId) -> Result<Arc<FragmentSlot>, CompactionError> {
        let state = self.registry.state(p);
        if !state.is_indexable() {
            return Err(CompactionError::PartitionUnavailable {
                partition: p,
                state,
            });
        }
        let slot = self.fragments.get_or_create(p);
        if !slot.begin_compaction() {
            return Err(CompactionError::AlreadyRunning(p));
        }
        Ok(slot)
    }

    fn aborted(&self, p: PartitionId, reason: &str) -> CompactionError {
        self.stats.compactions_aborted.fetch_add(1, Ordering::Relaxed);
        CompactionError::Aborted {
            target: CompactionTarget::Partition(p).to_string(),
            reason: reason.to_string(),
        }
    }

    /// 中断条件：取消、分区离开 Active/Passive、fragment 被释放或替换
    fn check_live(&self, slot: &Arc<FragmentSlot>, ctl: &Control) -> Result<(), CompactionError> {
        let p = slot.partition();
        if ctl.cancel.load(Ordering::Acquire) {
            return Err(self.aborted(p, "cancelled"));
        }
        let state = self.registry.state(p);
        if !state.is_indexable() {
            return Err(self.aborted(p, &format!("partition entered {}", state)));
        }
        let current = self.fragments.get(p);
        if slot.is_disposed() || !current.is_some_and(|s| Arc::ptr_eq(&s, slot)) {
            return Err(self.aborted(p, "fragment replaced"));
        }
        Ok(())
    }

    /// 单分区：快照 → 重写 → 回放 → 持 gate 排空并切换。
    /// 调用方已通过 `begin_compaction` 占位。
    fn run_partition(
        &self,
        slot: &Arc<FragmentSlot>,
        ctl: &Control,
    ) -> Result<PartitionCompaction, CompactionError> {
        let mut claim = Claim {
            slot: slot.as_ref(),
            promoted: false,
        };
        let p = slot.partition();
        ctl.set(CompactionPhase::Running);

        let base = {
            let gate = slot.lock_install();
            self.check_live(slot, ctl)?;
            slot.start_buffering(&gate);
            slot.load()
        };
        let before = base.stats();
        let mut next = base.compacted();
        drop(base);

        ctl.set(CompactionPhase::Replaying);
        let mut replayed = 0usize;
        loop {
            self.check_live(slot, ctl)?;
            let batch = slot.take_buffered();
            if batch.is_empty() {
                break;
            }
            replayed += batch.len();
            for r in &batch {
                apply_record(&mut next, r);
            }
        }

        ctl.set(CompactionPhase::Promoting);
        let gate = slot.lock_install();
        // 切换点：持 gate 排空剩余缓冲，builder 无法在此期间提交
        let tail = slot.take_buffered();
        replayed += tail.len();
        for r in &tail {
            apply_record(&mut next, r);
        }
        self.check_live(slot, ctl)?;
        next.set_version(slot.load().version() + 1);
        let after = next.stats();
        slot.install(&gate, next);
        claim.promoted = true;
        drop(gate);
        drop(claim);

        self.stats.compactions.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            "Partition {} compacted: {} -> {} tombstones, {} replayed",
            p,
            before.tombstones,
            after.tombstones,
            replayed
        );
        Ok(PartitionCompaction {
            partition: p,
            before,
            after,
            replayed,
        })
    }

    fn run_merged(&self, ctl: &Control) -> CompactionReport {
        let mut report = CompactionReport::default();
        let mut claimed = Vec::new();
        let ids: Vec<PartitionId> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|p| p.state.is_indexable())
            .map(|p| p.id)
            .collect();
        for p in ids {
            match self.claim(p) {
                Ok(slot) => claimed.push(slot),
                Err(e) => report.aborted.push((p, e)),
            }
        }

        let results: Vec<_> = claimed
            .par_iter()
            .map(|slot| (slot.partition(), self.run_partition(slot, ctl)))
            .collect();
        for (p, r) in results {
            match r {
                Ok(done) => report.compacted.push(done),
                Err(e) => report.aborted.push((p, e)),
            }
        }

        if !ctl.cancel.load(Ordering::Acquire) {
            report.disposed = self.dispose_cleanup(Duration::ZERO, true);
        }
        report
    }

    /// 释放 Cleanup 分区（宽限期已过，或 `force`）：
    /// 持 gate 等在跑的构建结束，标记 disposed，移除槽位，Cleanup → Missing。
    pub fn dispose_cleanup(&self, grace: Duration, force: bool) -> Vec<PartitionId> {
        let now = SystemTime::now();
        let mut disposed = Vec::new();
        for p in self.registry.list_by_state(PartitionState::Cleanup) {
            if !force {
                let waited = self
                    .registry
                    .get(p)
                    .and_then(|r| now.duration_since(r.changed_at).ok())
                    .unwrap_or_default();
                if waited < grace {
                    continue;
                }
            }
            match self.dispose(p) {
                Ok(()) => disposed.push(p),
                Err(e) => tracing::warn!("Cleanup of partition {} failed: {}", p, e),
            }
        }
        disposed
    }

    fn dispose(&self, p: PartitionId) -> Result<(), StateError> {
        self.apply_transitions(&[(p, PartitionState::Missing)])
            .map(|_| ())
    }

    /// 带释放语义的批量迁移：目标为 Missing 的分区先按 id 顺序持 gate
    /// （等在跑的构建结束），registry 整批提交成功后才标记 disposed 并移除槽位。
    pub fn apply_transitions(
        &self,
        transitions: &[(PartitionId, PartitionState)],
    ) -> Result<Vec<StateChange>, StateError> {
        let mut doomed: Vec<PartitionId> = transitions
            .iter()
            .filter(|(_, to)| *to == PartitionState::Missing)
            .map(|(p, _)| *p)
            .collect();
        doomed.sort();
        doomed.dedup();

        let slots: Vec<Arc<FragmentSlot>> = doomed
            .iter()
            .filter_map(|p| self.fragments.get(*p))
            .collect();
        let gates: Vec<_> = slots.iter().map(|s| s.lock_install()).collect();

        let changes = self.registry.set_partition_states(transitions)?;

        for (slot, gate) in slots.iter().zip(&gates) {
            slot.mark_disposed(gate);
            if let Some(cur) = self.fragments.get(slot.partition()) {
                if Arc::ptr_eq(&cur, slot) {
                    self.fragments.remove(slot.partition());
                }
            }
        }
        drop(gates);

        for p in doomed {
            self.stats.cleanups.fetch_add(1, Ordering::Relaxed);
            tracing::info!("Partition {} disposed", p);
        }
        Ok(changes)
    }
}

/// 分区进入 Cleanup 时唤醒 cleanup worker
pub struct CleanupWaker {
    notify: Arc<Notify>,
}

impl CleanupWaker {
    pub fn new(notify: Arc<Notify>) -> Self {
        Self { notify }
    }
}

impl StateListener for CleanupWaker {
    fn on_transition(&self, change: &StateChange) {
        if change.to == PartitionState::Cleanup {
            self.notify.notify_one();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ChangeRecord, Emit, UpdateBatch};
    use crate::index::builder::IndexBuilder;
    use serde_json::{json, Value};

    struct Fixture {
        registry: Arc<PartitionRegistry>,
        fragments: Arc<Fragments>,
        builder: Arc<IndexBuilder>,
        compactor: Arc<Compactor>,
    }

    fn fixture(partitions: &[u16]) -> Fixture {
        let registry = Arc::new(PartitionRegistry::new());
        for &p in partitions {
            registry
                .set_partition_state(PartitionId(p), PartitionState::Active)
                .unwrap();
        }
        let fragments = Arc::new(Fragments::new());
        let stats = Arc::new(EngineStats::default());
        let builder = Arc::new(IndexBuilder::new(
            registry.clone(),
            fragments.clone(),
            stats.clone(),
            Arc::new(Notify::new()),
        ));
        let compactor = Arc::new(Compactor::new(registry.clone(), fragments.clone(), stats));
        Fixture {
            registry,
            fragments,
            builder,
            compactor,
        }
    }

    /// doc 逐轮改写 key：每轮都会留下一个 tombstone
    fn churn(f: &Fixture, p: u16, from_seq: u64, rounds: u64) -> u64 {
        let pid = PartitionId(p);
        let mut seq = from_seq;
        for i in 0..rounds {
            seq += 1;
            let rec = ChangeRecord::update(
                pid,
                &format!("d{}", i % 5),
                seq,
                vec![Emit::new(format!("k{seq}").as_str(), json!(seq))],
            );
            f.builder
                .apply_batch(&UpdateBatch::new(pid, vec![rec]))
                .unwrap();
        }
        seq
    }

    fn live(f: &Fixture, p: u16) -> Vec<(String, String, Vec<Value>)> {
        f.fragments
            .get(PartitionId(p))
            .unwrap()
            .load()
            .iter_live()
            .map(|(k, d, v)| (k.to_string(), d.to_string(), v.to_vec()))
            .collect()
    }

    #[tokio::test]
    async fn compaction_preserves_rows_and_drops_garbage() {
        let f = fixture(&[0]);
        churn(&f, 0, 0, 50);
        let before_rows = live(&f, 0);
        let before = f.fragments.get(PartitionId(0)).unwrap().load().stats();
        assert!(before.tombstones > 0);

        let h = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(0)))
            .unwrap();
        let report = h.wait().await.unwrap();
        assert_eq!(report.compacted.len(), 1);
        assert_eq!(report.compacted[0].after.tombstones, 0);

        let slot = f.fragments.get(PartitionId(0)).unwrap();
        assert_eq!(live(&f, 0), before_rows);
        assert_eq!(slot.load().version(), before.version + 1);
        assert_eq!(slot.load().indexed_seq(), 50);
        assert_eq!(slot.compactions(), 1);
        assert!(!slot.is_compacting());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn concurrent_updates_are_not_lost() {
        let f = fixture(&[0]);
        churn(&f, 0, 0, 200);

        let builder = f.builder.clone();
        let writer = std::thread::spawn(move || {
            let pid = PartitionId(0);
            for seq in 201..=600u64 {
                let rec = ChangeRecord::update(
                    pid,
                    &format!("d{}", seq % 7),
                    seq,
                    vec![Emit::new(format!("k{seq}").as_str(), json!(seq))],
                );
                builder
                    .apply_batch(&UpdateBatch::new(pid, vec![rec]))
                    .unwrap();
            }
        });

        let h = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(0)))
            .unwrap();
        h.wait().await.unwrap();
        writer.join().unwrap();

        // 参照：同一序列不做 compaction
        let reference = fixture(&[0]);
        churn(&reference, 0, 0, 200);
        for seq in 201..=600u64 {
            let pid = PartitionId(0);
            let rec = ChangeRecord::update(
                pid,
                &format!("d{}", seq % 7),
                seq,
                vec![Emit::new(format!("k{seq}").as_str(), json!(seq))],
            );
            reference
                .builder
                .apply_batch(&UpdateBatch::new(pid, vec![rec]))
                .unwrap();
        }
        assert_eq!(live(&f, 0), live(&reference, 0));
        assert_eq!(
            f.fragments.get(PartitionId(0)).unwrap().load().indexed_seq(),
            600
        );
    }

    #[tokio::test]
    async fn second_compaction_is_rejected_while_running() {
        let f = fixture(&[0]);
        let slot = f.fragments.get_or_create(PartitionId(0));
        assert!(slot.begin_compaction());
        let err = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(0)))
            .err()
            .unwrap();
        assert_eq!(err, CompactionError::AlreadyRunning(PartitionId(0)));
        slot.end_compaction(false);
    }

    #[tokio::test]
    async fn cancelled_compaction_keeps_old_fragment() {
        let f = fixture(&[0]);
        churn(&f, 0, 0, 20);
        let slot = f.fragments.get(PartitionId(0)).unwrap();
        let before = slot.load();

        // 持住 gate：任务停在取快照之前
        let gate = slot.lock_install();
        let h = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(0)))
            .unwrap();
        h.cancel();
        drop(gate);

        let err = h.wait().await.unwrap_err();
        assert!(matches!(err, CompactionError::Aborted { .. }));
        assert!(Arc::ptr_eq(&before, &slot.load()));
        assert!(!slot.is_compacting());
    }

    #[tokio::test]
    async fn retry_after_abort_starts_from_scratch() {
        let f = fixture(&[0]);
        let seq = churn(&f, 0, 0, 20);
        let slot = f.fragments.get(PartitionId(0)).unwrap();

        let gate = slot.lock_install();
        let h = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(0)))
            .unwrap();
        h.cancel();
        drop(gate);
        assert!(matches!(
            h.wait().await,
            Err(CompactionError::Aborted { .. })
        ));
        assert!(!slot.is_compacting());
        assert_eq!(slot.compactions(), 0);

        // 中止后的提交不会残留在回放缓冲里
        churn(&f, 0, seq, 5);
        let rows = live(&f, 0);

        let report = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(0)))
            .unwrap()
            .wait()
            .await
            .unwrap();
        assert_eq!(report.compacted.len(), 1);
        assert_eq!(report.compacted[0].replayed, 0);
        assert_eq!(report.compacted[0].after.tombstones, 0);
        assert_eq!(live(&f, 0), rows);
        assert_eq!(slot.load().indexed_seq(), seq + 5);
        assert_eq!(slot.compactions(), 1);
        assert!(!slot.is_compacting());
    }

    #[tokio::test]
    async fn partition_leaving_active_aborts_or_is_rejected() {
        let f = fixture(&[0, 1]);
        churn(&f, 1, 0, 5);
        f.registry
            .set_partition_state(PartitionId(1), PartitionState::Cleanup)
            .unwrap();
        let err = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(1)))
            .err()
            .unwrap();
        assert_eq!(
            err,
            CompactionError::PartitionUnavailable {
                partition: PartitionId(1),
                state: PartitionState::Cleanup
            }
        );

        churn(&f, 0, 0, 5);
        let slot = f.fragments.get(PartitionId(0)).unwrap();
        let before = slot.load();
        let gate = slot.lock_install();
        let h = f
            .compactor
            .compact(CompactionTarget::Partition(PartitionId(0)))
            .unwrap();
        f.registry
            .set_partition_state(PartitionId(0), PartitionState::Cleanup)
            .unwrap();
        drop(gate);
        assert!(matches!(
            h.wait().await,
            Err(CompactionError::Aborted { .. })
        ));
        assert!(Arc::ptr_eq(&before, &slot.load()));
    }

    #[tokio::test]
    async fn merged_compaction_disposes_cleanup_partitions() {
        let f = fixture(&[0, 1, 2]);
        churn(&f, 0, 0, 10);
        churn(&f, 1, 0, 10);
        f.registry
            .set_partition_state(PartitionId(1), PartitionState::Cleanup)
            .unwrap();
        f.registry
            .set_partition_state(PartitionId(2), PartitionState::Passive)
            .unwrap();

        let h = f.compactor.compact(CompactionTarget::Merged).unwrap();
        let report = h.wait().await.unwrap();

        let mut compacted: Vec<_> = report.compacted.iter().map(|c| c.partition).collect();
        compacted.sort();
        assert_eq!(compacted, vec![PartitionId(0), PartitionId(2)]);
        assert_eq!(report.disposed, vec![PartitionId(1)]);
        assert_eq!(f.registry.state(PartitionId(1)), PartitionState::Missing);
        assert!(f.fragments.get(PartitionId(1)).is_none());
    }

    #[tokio::test]
    async fn cleanup_honours_grace_window() {
        let f = fixture(&[0]);
        churn(&f, 0, 0, 3);
        f.registry
            .set_partition_state(PartitionId(0), PartitionState::Cleanup)
            .unwrap();

        assert!(f
            .compactor
            .dispose_cleanup(Duration::from_secs(3600), false)
            .is_empty());
        assert_eq!(f.registry.state(PartitionId(0)), PartitionState::Cleanup);

        let slot = f.fragments.get(PartitionId(0)).unwrap();
        assert_eq!(
            f.compactor.dispose_cleanup(Duration::ZERO, false),
            vec![PartitionId(0)]
        );
        assert!(slot.is_disposed());
        // 释放后的槽位不再接受构建
        let err = f
            .builder
            .apply_batch(&UpdateBatch::new(
                PartitionId(0),
                vec![ChangeRecord::delete(PartitionId(0), "d0", 4)],
            ))
            .unwrap_err();
        assert_eq!(
            err,
            crate::core::BuildError::PartitionMissing(PartitionId(0))
        );
    }

    #[tokio::test]
    async fn burst_with_invalid_transition_disposes_nothing() {
        let f = fixture(&[0, 1]);
        churn(&f, 0, 0, 2);
        f.registry
            .set_partition_state(PartitionId(0), PartitionState::Cleanup)
            .unwrap();
        let slot = f.fragments.get(PartitionId(0)).unwrap();

        // 1 是 Active，不能直接 → Missing：整批拒绝
        let err = f
            .compactor
            .apply_transitions(&[
                (PartitionId(0), PartitionState::Missing),
                (PartitionId(1), PartitionState::Missing),
            ])
            .unwrap_err();
        assert!(matches!(err, StateError::InvalidTransition { .. }));
        assert!(!slot.is_disposed());
        assert_eq!(f.registry.state(PartitionId(0)), PartitionState::Cleanup);

        // 同一批次内释放后重新激活：拿到的是全新的空 fragment
        let changes = f
            .compactor
            .apply_transitions(&[
                (PartitionId(0), PartitionState::Missing),
                (PartitionId(0), PartitionState::Active),
            ])
            .unwrap();
        assert_eq!(changes.len(), 2);
        assert!(slot.is_disposed());
        assert_eq!(f.registry.indexed_seq(PartitionId(0)), Some(0));
        assert_eq!(
            f.fragments.get_or_create(PartitionId(0)).load().live_entries(),
            0
        );
    }
}
