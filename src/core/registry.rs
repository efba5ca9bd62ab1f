use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Weak;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::core::error::StateError;
use crate::core::partition::{Partition, PartitionId, PartitionState};

/// 一次已生效的状态迁移
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct StateChange {
    pub partition: PartitionId,
    pub from: PartitionState,
    pub to: PartitionState,
}

/// 状态迁移订阅者（coordinator / merger / cleanup 唤醒）。
///
/// 回调在 registry 锁释放之后同步调用，实现方不得反向阻塞等待 registry。
pub trait StateListener: Send + Sync {
    fn on_transition(&self, change: &StateChange);
}

/// 分区状态表：整个引擎唯一的全局可变状态。
///
/// - 所有迁移都经过这里，并主动推送给订阅者（不轮询）
/// - registry 只持有订阅者的 Weak，订阅者可以反过来持有 `Arc<PartitionRegistry>`
pub struct PartitionRegistry {
    partitions: RwLock<BTreeMap<PartitionId, Partition>>,
    listeners: RwLock<Vec<Weak<dyn StateListener>>>,
    generation: AtomicU64,
}

impl Default for PartitionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionRegistry {
    pub fn new() -> Self {
        Self {
            partitions: RwLock::new(BTreeMap::new()),
            listeners: RwLock::new(Vec::new()),
            generation: AtomicU64::new(0),
        }
    }

    /// 从持久化记录恢复（Missing 记录直接丢弃）
    pub fn from_records(records: impl IntoIterator<Item = Partition>) -> Self {
        let reg = Self::new();
        {
            let mut g = reg.partitions.write();
            for mut p in records {
                if p.state == PartitionState::Missing {
                    continue;
                }
                p.pending_update = false;
                g.insert(p.id, p);
            }
        }
        reg
    }

    pub fn subscribe(&self, listener: Weak<dyn StateListener>) {
        self.listeners.write().push(listener);
    }

    /// 每次迁移 +1，供缓存校验
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn state(&self, id: PartitionId) -> PartitionState {
        self.partitions
            .read()
            .get(&id)
            .map(|p| p.state)
            .unwrap_or(PartitionState::Missing)
    }

    pub fn get(&self, id: PartitionId) -> Option<Partition> {
        self.partitions.read().get(&id).cloned()
    }

    pub fn indexed_seq(&self, id: PartitionId) -> Option<u64> {
        self.partitions.read().get(&id).map(|p| p.indexed_seq)
    }

    pub fn list_by_state(&self, state: PartitionState) -> BTreeSet<PartitionId> {
        self.partitions
            .read()
            .values()
            .filter(|p| p.state == state)
            .map(|p| p.id)
            .collect()
    }

    /// 全部分区记录（按 id 排序）
    pub fn snapshot(&self) -> Vec<Partition> {
        self.partitions.read().values().cloned().collect()
    }

    pub fn set_partition_state(
        &self,
        id: PartitionId,
        to: PartitionState,
    ) -> Result<StateChange, StateError> {
        let mut changes = self.set_partition_states(&[(id, to)])?;
        Ok(changes.remove(0))
    }

    /// 批量迁移：先在副本上逐条校验，全部合法才一次性提交；任何一条非法则整体拒绝。
    /// 同一批次内允许对同一分区连续迁移（例如 Missing→Active→Passive）。
    pub fn set_partition_states(
        &self,
        transitions: &[(PartitionId, PartitionState)],
    ) -> Result<Vec<StateChange>, StateError> {
        let mut changes = Vec::with_capacity(transitions.len());
        {
            let mut g = self.partitions.write();
            let mut work = g.clone();
            let now = SystemTime::now();
            for &(id, to) in transitions {
                let from = work
                    .get(&id)
                    .map(|p| p.state)
                    .unwrap_or(PartitionState::Missing);
                if !from.can_transition_to(to) {
                    return Err(StateError::InvalidTransition {
                        partition: id,
                        from,
                        to,
                    });
                }
                match to {
                    PartitionState::Missing => {
                        work.remove(&id);
                    }
                    PartitionState::Active if from == PartitionState::Missing => {
                        work.insert(id, Partition::new(id, to));
                    }
                    _ => {
                        if let Some(p) = work.get_mut(&id) {
                            p.state = to;
                            p.changed_at = now;
                        }
                    }
                }
                changes.push(StateChange {
                    partition: id,
                    from,
                    to,
                });
            }
            *g = work;
            self.generation.fetch_add(1, Ordering::AcqRel);
        }

        for c in &changes {
            tracing::info!(
                "Partition {} state: {} -> {}",
                c.partition,
                c.from,
                c.to
            );
        }
        self.notify(&changes);
        Ok(changes)
    }

    fn notify(&self, changes: &[StateChange]) {
        let live: Vec<_> = {
            let mut ls = self.listeners.write();
            ls.retain(|w| w.strong_count() > 0);
            ls.iter().filter_map(|w| w.upgrade()).collect()
        };
        for c in changes {
            for l in &live {
                l.on_transition(c);
            }
        }
    }

    /// builder 推进已索引 seq；不存在的分区或回退请求返回 false。
    pub(crate) fn advance_seq(&self, id: PartitionId, seq: u64) -> bool {
        let mut g = self.partitions.write();
        let Some(p) = g.get_mut(&id) else {
            return false;
        };
        if seq < p.indexed_seq {
            tracing::warn!(
                "Refusing to move partition {} backwards: {} -> {}",
                id,
                p.indexed_seq,
                seq
            );
            return false;
        }
        p.indexed_seq = seq;
        p.last_error = None;
        true
    }

    pub(crate) fn set_pending(&self, id: PartitionId, pending: bool) {
        if let Some(p) = self.partitions.write().get_mut(&id) {
            p.pending_update = pending;
        }
    }

    pub(crate) fn record_error(&self, id: PartitionId, err: String) {
        if let Some(p) = self.partitions.write().get_mut(&id) {
            p.last_error = Some(err);
        }
    }
}
