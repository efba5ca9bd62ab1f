use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::{Mutex, MutexGuard, RwLock};

use crate::core::{ChangeRecord, PartitionId};
use crate::index::fragment::IndexFragment;

/// 一个分区的 fragment 发布点。
///
/// - `current`：当前版本；读者 `load_full()` 拿到 Arc 快照后完全不受后续写影响
/// - `install_gate`：串行化所有"安装新版本"的动作（builder 提交 / compaction promote / cleanup 释放）
/// - `replay`：compaction 进行期间为 `Some`，builder 每次提交都把记录追加进去
pub struct FragmentSlot {
    partition: PartitionId,
    current: ArcSwap<IndexFragment>,
    install_gate: Mutex<()>,
    replay: Mutex<Option<Vec<ChangeRecord>>>,
    compacting: AtomicBool,
    compactions: AtomicU64,
    disposed: AtomicBool,
}

impl FragmentSlot {
    pub fn new(fragment: IndexFragment) -> Self {
        Self {
            partition: fragment.partition(),
            current: ArcSwap::from_pointee(fragment),
            install_gate: Mutex::new(()),
            replay: Mutex::new(None),
            compacting: AtomicBool::new(false),
            compactions: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    /// 读者快照
    pub fn load(&self) -> Arc<IndexFragment> {
        self.current.load_full()
    }

    pub(crate) fn lock_install(&self) -> MutexGuard<'_, ()> {
        self.install_gate.lock()
    }

    /// 单指针切换；调用方必须持有 install gate
    pub(crate) fn install(&self, _gate: &MutexGuard<'_, ()>, next: IndexFragment) {
        self.current.store(Arc::new(next));
    }

    /// builder 提交后调用（持有 install gate）：compaction 期间缓冲本批记录
    pub(crate) fn buffer_for_compaction(&self, _gate: &MutexGuard<'_, ()>, records: &[ChangeRecord]) {
        if let Some(buf) = self.replay.lock().as_mut() {
            buf.extend_from_slice(records);
        }
    }

    pub(crate) fn begin_compaction(&self) -> bool {
        !self.compacting.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn start_buffering(&self, _gate: &MutexGuard<'_, ()>) {
        *self.replay.lock() = Some(Vec::new());
    }

    /// 取出目前已缓冲的记录（保持缓冲开启）
    pub(crate) fn take_buffered(&self) -> Vec<ChangeRecord> {
        match self.replay.lock().as_mut() {
            Some(buf) => std::mem::take(buf),
            None => Vec::new(),
        }
    }

    pub(crate) fn end_compaction(&self, promoted: bool) {
        *self.replay.lock() = None;
        if promoted {
            self.compactions.fetch_add(1, Ordering::Relaxed);
        }
        self.compacting.store(false, Ordering::Release);
    }

    pub fn is_compacting(&self) -> bool {
        self.compacting.load(Ordering::Acquire)
    }

    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    pub(crate) fn mark_disposed(&self, _gate: &MutexGuard<'_, ()>) {
        self.disposed.store(true, Ordering::Release);
    }

    /// cleanup 已释放：持有旧 Arc 的 builder/compactor 不得再安装新版本
    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// 全部分区的 fragment 槽位
#[derive(Default)]
pub struct Fragments {
    slots: RwLock<BTreeMap<PartitionId, Arc<FragmentSlot>>>,
}

impl Fragments {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: PartitionId) -> Option<Arc<FragmentSlot>> {
        self.slots.read().get(&id).cloned()
    }

    pub fn get_or_create(&self, id: PartitionId) -> Arc<FragmentSlot> {
        if let Some(s) = self.slots.read().get(&id) {
            return s.clone();
        }
        self.slots
            .write()
            .entry(id)
            .or_insert_with(|| Arc::new(FragmentSlot::new(IndexFragment::new(id))))
            .clone()
    }

    pub fn insert(&self, fragment: IndexFragment) {
        let id = fragment.partition();
        self.slots
            .write()
            .insert(id, Arc::new(FragmentSlot::new(fragment)));
    }

    pub(crate) fn remove(&self, id: PartitionId) -> Option<Arc<FragmentSlot>> {
        self.slots.write().remove(&id)
    }

    /// 对给定分区逐个取快照（各分区自身一致；缺失的分区视为空）
    pub fn snapshot(&self, ids: &[PartitionId]) -> Vec<Arc<IndexFragment>> {
        let slots = self.slots.read();
        ids.iter()
            .map(|id| match slots.get(id) {
                Some(s) => s.load(),
                None => Arc::new(IndexFragment::new(*id)),
            })
            .collect()
    }

    pub fn all(&self) -> Vec<Arc<FragmentSlot>> {
        self.slots.read().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn readers_keep_their_version_across_install() {
        let slot = FragmentSlot::new(IndexFragment::new(PartitionId(1)));
        let before = slot.load();

        let mut next = (*before).clone();
        next.set_version(before.version() + 1);
        {
            let g = slot.lock_install();
            slot.install(&g, next);
        }

        assert_eq!(before.version(), 0);
        assert_eq!(slot.load().version(), 1);
    }

    #[test]
    fn buffering_only_while_compacting() {
        let slot = FragmentSlot::new(IndexFragment::new(PartitionId(1)));
        let rec = ChangeRecord::delete(PartitionId(1), "d", 1);
        {
            let g = slot.lock_install();
            slot.buffer_for_compaction(&g, &[rec.clone()]);
        }
        assert!(slot.take_buffered().is_empty());

        assert!(slot.begin_compaction());
        assert!(!slot.begin_compaction());
        {
            let g = slot.lock_install();
            slot.start_buffering(&g);
            slot.buffer_for_compaction(&g, &[rec.clone()]);
        }
        assert_eq!(slot.take_buffered(), vec![rec]);
        slot.end_compaction(true);
        assert!(!slot.is_compacting());
        assert_eq!(slot.compactions(), 1);
    }

    #[test]
    fn fragments_snapshot_fills_missing_with_empty() {
        let frags = Fragments::new();
        frags.get_or_create(PartitionId(2));
        let snap = frags.snapshot(&[PartitionId(2), PartitionId(9)]);
        assert_eq!(snap.len(), 2);
        assert_eq!(snap[1].partition(), PartitionId(9));
    }
}
