use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::{PartitionId, ViewKey};
use crate::query::range::{is_empty_range, KeyRange};

/// 单个 (key, doc) 槽位。
///
/// 删除/不再 emit 的 key 先写 tombstone，读路径跳过；compaction 时物理丢弃。
#[derive(Clone, Debug, PartialEq)]
pub enum EntrySlot {
    Live { values: Vec<Value>, seq: u64 },
    Tombstone { seq: u64 },
}

impl EntrySlot {
    pub fn is_live(&self) -> bool {
        matches!(self, EntrySlot::Live { .. })
    }
}

/// 反向索引行：doc 上一版本 emit 过的 key 集合
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BackIndexRow {
    pub keys: Vec<ViewKey>,
    pub seq: u64,
    /// 文档已删除：行只保留删除 seq，compaction 时回收
    pub deleted: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FragmentStats {
    pub version: u64,
    pub indexed_seq: u64,
    pub live_entries: usize,
    pub tombstones: usize,
    pub back_index_rows: usize,
    pub deleted_docs: usize,
}

/// 一层有序槽位 + 反向索引行。
#[derive(Clone, Debug, Default)]
struct Layer {
    entries: BTreeMap<ViewKey, BTreeMap<String, EntrySlot>>,
    back_index: HashMap<String, BackIndexRow>,
}

impl Layer {
    fn slot(&self, key: &ViewKey, doc_id: &str) -> Option<&EntrySlot> {
        self.entries.get(key).and_then(|d| d.get(doc_id))
    }

    /// 区间内、游标之后（按方向）的下一个槽位，tombstone 也返回
    fn next_slot<'a>(
        &'a self,
        after: Option<(&ViewKey, &str)>,
        lo: Bound<&ViewKey>,
        hi: Bound<&ViewKey>,
        descending: bool,
    ) -> Option<(&'a ViewKey, &'a str, &'a EntrySlot)> {
        let Some((k, d)) = after else {
            return self.first_slot(lo, hi, descending);
        };
        if let Some((kref, docs)) = self.entries.get_key_value(k) {
            let found = if descending {
                docs.range::<str, _>((Bound::Unbounded, Bound::Excluded(d)))
                    .next_back()
            } else {
                docs.range::<str, _>((Bound::Excluded(d), Bound::Unbounded))
                    .next()
            };
            if let Some((doc, slot)) = found {
                return Some((kref, doc.as_str(), slot));
            }
        }
        if descending {
            self.first_slot(lo, Bound::Excluded(k), true)
        } else {
            self.first_slot(Bound::Excluded(k), hi, false)
        }
    }

    fn first_slot<'a>(
        &'a self,
        lo: Bound<&ViewKey>,
        hi: Bound<&ViewKey>,
        descending: bool,
    ) -> Option<(&'a ViewKey, &'a str, &'a EntrySlot)> {
        if is_empty_range(lo, hi) {
            return None;
        }
        let mut range = self.entries.range::<ViewKey, _>((lo, hi));
        if descending {
            range.rev().find_map(|(k, docs)| {
                docs.iter().next_back().map(|(d, s)| (k, d.as_str(), s))
            })
        } else {
            range.find_map(|(k, docs)| docs.iter().next().map(|(d, s)| (k, d.as_str(), s)))
        }
    }
}

/// delta 层折叠进 base 的下限（槽位 + 反向索引行）
const MIN_FOLD_THRESHOLD: usize = 1024;

/// 分区索引片段（不可变值语义）。
///
/// 两层结构：`base` 是大而共享的底层，`delta` 是最近一次折叠以来的增量，
/// 同一 (key, doc_id) 槽位或同一 doc 的反向索引行以 delta 为准。
/// - entries：key → (doc_id → slot)，两级都有序，读时按 (key, doc_id) 顺序输出
/// - back_index：doc_id → 上次 emit 的 keys，用于增量 diff
///
/// 当前版本由 `FragmentSlot` 以 `Arc` 发布。克隆只复制两个 `Arc`，修改只写 delta
/// （`Arc::make_mut`），delta 超过 `fold_threshold` 时才折叠进 base；
/// 一次构建的代价随 delta 大小增长，与片段总量无关。
#[derive(Clone, Debug)]
pub struct IndexFragment {
    partition: PartitionId,
    version: u64,
    indexed_seq: u64,
    base: Arc<Layer>,
    delta: Arc<Layer>,
    delta_len: usize,
    live: usize,
    tombstones: usize,
    back_rows: usize,
    deleted_docs: usize,
}

impl IndexFragment {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            version: 0,
            indexed_seq: 0,
            base: Arc::default(),
            delta: Arc::default(),
            delta_len: 0,
            live: 0,
            tombstones: 0,
            back_rows: 0,
            deleted_docs: 0,
        }
    }

    pub fn partition(&self) -> PartitionId {
        self.partition
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn indexed_seq(&self) -> u64 {
        self.indexed_seq
    }

    pub fn live_entries(&self) -> usize {
        self.live
    }

    pub fn stats(&self) -> FragmentStats {
        FragmentStats {
            version: self.version,
            indexed_seq: self.indexed_seq,
            live_entries: self.live,
            tombstones: self.tombstones,
            back_index_rows: self.back_rows,
            deleted_docs: self.deleted_docs,
        }
    }

    /// 可回收比例：tombstone + 已删除文档的反向索引行
    pub fn garbage_ratio(&self) -> f64 {
        let total = self.live + self.tombstones + self.back_rows;
        if total == 0 {
            return 0.0;
        }
        (self.tombstones + self.deleted_docs) as f64 / total as f64
    }

    pub(crate) fn set_indexed_seq(&mut self, seq: u64) {
        self.indexed_seq = seq;
    }

    pub(crate) fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn slot(&self, key: &ViewKey, doc_id: &str) -> Option<&EntrySlot> {
        self.delta
            .slot(key, doc_id)
            .or_else(|| self.base.slot(key, doc_id))
    }

    fn write_slot(&mut self, key: ViewKey, doc_id: &str, slot: EntrySlot) {
        let delta = Arc::make_mut(&mut self.delta);
        let prev = delta
            .entries
            .entry(key)
            .or_default()
            .insert(doc_id.to_string(), slot);
        if prev.is_none() {
            self.delta_len += 1;
        }
    }

    pub fn back_index_row(&self, doc_id: &str) -> Option<&BackIndexRow> {
        self.delta
            .back_index
            .get(doc_id)
            .or_else(|| self.base.back_index.get(doc_id))
    }

    pub(crate) fn set_back_index(&mut self, doc_id: &str, row: BackIndexRow) {
        match self.back_index_row(doc_id).map(|r| r.deleted) {
            Some(true) => self.deleted_docs -= 1,
            Some(false) => {}
            None => self.back_rows += 1,
        }
        if row.deleted {
            self.deleted_docs += 1;
        }
        let delta = Arc::make_mut(&mut self.delta);
        if delta.back_index.insert(doc_id.to_string(), row).is_none() {
            self.delta_len += 1;
        }
    }

    /// 写入（或覆盖）一个 live 槽位；值未变化时返回 false
    pub(crate) fn upsert(&mut self, key: ViewKey, doc_id: &str, values: Vec<Value>, seq: u64) -> bool {
        let was_live = match self.slot(&key, doc_id) {
            Some(EntrySlot::Live { values: cur, .. }) if *cur == values => return false,
            Some(slot) => Some(slot.is_live()),
            None => None,
        };
        match was_live {
            Some(true) => {}
            Some(false) => {
                self.tombstones -= 1;
                self.live += 1;
            }
            None => self.live += 1,
        }
        self.write_slot(key, doc_id, EntrySlot::Live { values, seq });
        true
    }

    /// live 槽位 → tombstone；不存在或已是 tombstone 时不动
    pub(crate) fn tombstone(&mut self, key: &ViewKey, doc_id: &str, seq: u64) {
        if !self.slot(key, doc_id).is_some_and(EntrySlot::is_live) {
            return;
        }
        self.live -= 1;
        self.tombstones += 1;
        self.write_slot(key.clone(), doc_id, EntrySlot::Tombstone { seq });
    }

    pub fn get(&self, key: &ViewKey, doc_id: &str) -> Option<&[Value]> {
        match self.slot(key, doc_id)? {
            EntrySlot::Live { values, .. } => Some(values.as_slice()),
            EntrySlot::Tombstone { .. } => None,
        }
    }

    /// 文档当前 live 的 key（有序）
    pub fn doc_keys(&self, doc_id: &str) -> Vec<ViewKey> {
        let Some(row) = self.back_index_row(doc_id) else {
            return Vec::new();
        };
        let mut keys: Vec<ViewKey> = row
            .keys
            .iter()
            .filter(|k| self.get(k, doc_id).is_some())
            .cloned()
            .collect();
        keys.sort();
        keys
    }

    /// max(√总量, MIN_FOLD_THRESHOLD)：单次构建复制 delta 与摊还折叠 base 的代价持平
    fn fold_threshold(&self) -> usize {
        let total = self.live + self.tombstones + self.back_rows;
        ((total as f64).sqrt() as usize).max(MIN_FOLD_THRESHOLD)
    }

    pub(crate) fn maybe_fold(&mut self) {
        if self.delta_len > self.fold_threshold() {
            self.fold_delta();
        }
    }

    /// delta 并入 base；base 仍被旧版本引用时在这里复制一次
    pub(crate) fn fold_delta(&mut self) {
        if self.delta_len == 0 {
            return;
        }
        let delta = std::mem::take(&mut self.delta);
        let delta = Arc::try_unwrap(delta).unwrap_or_else(|shared| (*shared).clone());
        let base = Arc::make_mut(&mut self.base);
        for (k, docs) in delta.entries {
            base.entries.entry(k).or_default().extend(docs);
        }
        base.back_index.extend(delta.back_index);
        self.delta_len = 0;
    }

    /// 两层合并后的下一个槽位；同一位置 delta 优先
    fn next_slot<'a>(
        &'a self,
        after: Option<(&ViewKey, &str)>,
        lo: Bound<&ViewKey>,
        hi: Bound<&ViewKey>,
        descending: bool,
    ) -> Option<(&'a ViewKey, &'a str, &'a EntrySlot)> {
        let b = self.base.next_slot(after, lo, hi, descending);
        let d = self.delta.next_slot(after, lo, hi, descending);
        match (b, d) {
            (None, None) => None,
            (Some(x), None) => Some(x),
            (None, Some(y)) => Some(y),
            (Some(x), Some(y)) => {
                let ord = (x.0, x.1).cmp(&(y.0, y.1));
                let ord = if descending { ord.reverse() } else { ord };
                Some(if ord == Ordering::Less { x } else { y })
            }
        }
    }

    /// 按 (key, doc_id) 升序遍历全部 live 槽位
    pub fn iter_live(&self) -> impl Iterator<Item = (&ViewKey, &str, &[Value])> + '_ {
        let all = KeyRange::all();
        let mut after: Option<(&ViewKey, &str)> = None;
        std::iter::from_fn(move || {
            let (k, d, values) = self.next_live(after, &all, false)?;
            after = Some((k, d));
            Some((k, d, values))
        })
    }

    /// 按 (key, doc_id) 升序遍历全部槽位（含 tombstone）
    fn iter_slots(&self) -> impl Iterator<Item = (&ViewKey, &str, &EntrySlot)> + '_ {
        let mut after: Option<(&ViewKey, &str)> = None;
        std::iter::from_fn(move || {
            let (k, d, slot) = self.next_slot(after, Bound::Unbounded, Bound::Unbounded, false)?;
            after = Some((k, d));
            Some((k, d, slot))
        })
    }

    fn iter_back_index(&self) -> impl Iterator<Item = (&String, &BackIndexRow)> + '_ {
        self.base
            .back_index
            .iter()
            .filter(|(d, _)| !self.delta.back_index.contains_key(d.as_str()))
            .chain(self.delta.back_index.iter())
    }

    /// 游标推进：返回 `after` 之后（按迭代方向）区间内的下一个 live 槽位。
    ///
    /// 每次 O(log n) 重新定位，游标只需保存上一个 (key, doc_id)，
    /// 因此可以与 `Arc<IndexFragment>` 一起放进迭代器，不需要自引用。
    pub fn next_live<'a>(
        &'a self,
        after: Option<(&ViewKey, &str)>,
        range: &KeyRange,
        descending: bool,
    ) -> Option<(&'a ViewKey, &'a str, &'a [Value])> {
        let (lo, hi) = range.bounds(descending);
        let mut cursor = after;
        loop {
            let (k, d, slot) = self.next_slot(cursor, lo, hi, descending)?;
            if let EntrySlot::Live { values, .. } = slot {
                return Some((k, d, values.as_slice()));
            }
            cursor = Some((k, d));
        }
    }

    /// 按 key 顺序重写：只保留 live 槽位与未删除文档的反向索引行
    pub fn compacted(&self) -> IndexFragment {
        let mut layer = Layer::default();
        for (k, d, slot) in self.iter_slots() {
            if slot.is_live() {
                layer
                    .entries
                    .entry(k.clone())
                    .or_default()
                    .insert(d.to_string(), slot.clone());
            }
        }
        layer.back_index = self
            .iter_back_index()
            .filter(|(_, r)| !r.deleted)
            .map(|(d, r)| (d.clone(), r.clone()))
            .collect();

        IndexFragment {
            partition: self.partition,
            version: self.version,
            indexed_seq: self.indexed_seq,
            back_rows: layer.back_index.len(),
            base: Arc::new(layer),
            delta: Arc::default(),
            delta_len: 0,
            live: self.live,
            tombstones: 0,
            deleted_docs: 0,
        }
    }

    pub fn to_image(&self) -> FragmentImage {
        let mut rows = Vec::with_capacity(self.live + self.tombstones);
        for (k, doc, slot) in self.iter_slots() {
            let (seq, values) = match slot {
                EntrySlot::Live { values, seq } => {
                    (*seq, Some(values.iter().map(|v| v.to_string()).collect()))
                }
                EntrySlot::Tombstone { seq } => (*seq, None),
            };
            rows.push(RowImage {
                key: k.to_json(),
                doc_id: doc.to_string(),
                seq,
                values,
            });
        }
        let mut back_index: Vec<BackIndexImage> = self
            .iter_back_index()
            .map(|(doc, r)| BackIndexImage {
                doc_id: doc.clone(),
                keys: r.keys.iter().map(ViewKey::to_json).collect(),
                seq: r.seq,
                deleted: r.deleted,
            })
            .collect();
        back_index.sort_by(|a, b| a.doc_id.cmp(&b.doc_id));

        FragmentImage {
            partition: self.partition,
            indexed_seq: self.indexed_seq,
            rows,
            back_index,
        }
    }

    pub fn from_image(image: FragmentImage) -> anyhow::Result<Self> {
        let mut frag = IndexFragment::new(image.partition);
        frag.indexed_seq = image.indexed_seq;
        let mut layer = Layer::default();
        for row in image.rows {
            let key = ViewKey::from_json(&row.key)?;
            let slot = match row.values {
                Some(vs) => {
                    let values = vs
                        .iter()
                        .map(|v| serde_json::from_str::<Value>(v))
                        .collect::<Result<Vec<_>, _>>()?;
                    frag.live += 1;
                    EntrySlot::Live {
                        values,
                        seq: row.seq,
                    }
                }
                None => {
                    frag.tombstones += 1;
                    EntrySlot::Tombstone { seq: row.seq }
                }
            };
            layer.entries.entry(key).or_default().insert(row.doc_id, slot);
        }
        for b in image.back_index {
            let keys = b
                .keys
                .iter()
                .map(|k| ViewKey::from_json(k))
                .collect::<Result<Vec<_>, _>>()?;
            if b.deleted {
                frag.deleted_docs += 1;
            }
            layer.back_index.insert(
                b.doc_id,
                BackIndexRow {
                    keys,
                    seq: b.seq,
                    deleted: b.deleted,
                },
            );
        }
        frag.back_rows = layer.back_index.len();
        frag.base = Arc::new(layer);
        Ok(frag)
    }

    #[cfg(test)]
    pub(crate) fn shares_base_with(&self, other: &IndexFragment) -> bool {
        Arc::ptr_eq(&self.base, &other.base)
    }

    #[cfg(test)]
    pub(crate) fn delta_len(&self) -> usize {
        self.delta_len
    }
}

/// 落盘格式：key/value 统一编码为 JSON 文本（bincode 不支持 `deserialize_any`）
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FragmentImage {
    pub partition: PartitionId,
    pub indexed_seq: u64,
    pub rows: Vec<RowImage>,
    pub back_index: Vec<BackIndexImage>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RowImage {
    pub key: String,
    pub doc_id: String,
    pub seq: u64,
    /// None = tombstone
    pub values: Option<Vec<String>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BackIndexImage {
    pub doc_id: String,
    pub keys: Vec<String>,
    pub seq: u64,
    pub deleted: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn frag_with(rows: &[(&str, &str, Value)]) -> IndexFragment {
        let mut f = IndexFragment::new(PartitionId(0));
        for (i, (k, d, v)) in rows.iter().enumerate() {
            f.upsert((*k).into(), d, vec![v.clone()], i as u64 + 1);
        }
        f
    }

    fn collect(f: &IndexFragment, range: &KeyRange, descending: bool) -> Vec<(String, String)> {
        let mut out = Vec::new();
        let mut after: Option<(ViewKey, String)> = None;
        loop {
            let next = f
                .next_live(after.as_ref().map(|(k, d)| (k, d.as_str())), range, descending)
                .map(|(k, d, _)| (k.clone(), d.to_string()));
            let Some((k, d)) = next else { break };
            out.push((k.to_string(), d.clone()));
            after = Some((k, d));
        }
        out
    }

    #[test]
    fn cursor_walks_both_directions_and_skips_tombstones() {
        let mut f = frag_with(&[
            ("a", "d1", json!(1)),
            ("b", "d1", json!(2)),
            ("b", "d2", json!(3)),
            ("c", "d3", json!(4)),
        ]);
        f.tombstone(&"b".into(), "d1", 9);

        let asc = collect(&f, &KeyRange::all(), false);
        assert_eq!(
            asc,
            vec![
                ("\"a\"".to_string(), "d1".to_string()),
                ("\"b\"".to_string(), "d2".to_string()),
                ("\"c\"".to_string(), "d3".to_string()),
            ]
        );

        let desc = collect(&f, &KeyRange::all(), true);
        assert_eq!(desc.len(), 3);
        assert_eq!(desc[0].1, "d3");
        assert_eq!(desc[2].1, "d1");
    }

    #[test]
    fn cursor_honours_key_range() {
        let f = frag_with(&[
            ("a", "d1", json!(1)),
            ("b", "d2", json!(2)),
            ("c", "d3", json!(3)),
        ]);
        let r = KeyRange::new(Some("b".into()), Some("c".into())).exclusive_end();
        assert_eq!(collect(&f, &r, false).len(), 1);

        let r = KeyRange::new(Some("c".into()), Some("a".into()));
        assert_eq!(collect(&f, &r, true).len(), 3);

        // 反向区间为空，不 panic
        let r = KeyRange::new(Some("c".into()), Some("a".into()));
        assert!(collect(&f, &r, false).is_empty());
    }

    #[test]
    fn upsert_over_tombstone_revives_slot() {
        let mut f = frag_with(&[("a", "d1", json!(1))]);
        f.tombstone(&"a".into(), "d1", 2);
        assert_eq!(f.stats().tombstones, 1);
        assert!(f.upsert("a".into(), "d1", vec![json!(5)], 3));
        assert_eq!(f.stats().tombstones, 0);
        assert_eq!(f.live_entries(), 1);
        assert_eq!(f.get(&"a".into(), "d1"), Some(&[json!(5)][..]));
        assert!(!f.upsert("a".into(), "d1", vec![json!(5)], 4));
    }

    #[test]
    fn compacted_drops_garbage_but_keeps_rows() {
        let mut f = frag_with(&[("a", "d1", json!(1)), ("b", "d2", json!(2))]);
        f.set_back_index("d1", BackIndexRow { keys: vec!["a".into()], seq: 1, deleted: false });
        f.set_back_index("d2", BackIndexRow { keys: vec![], seq: 3, deleted: true });
        f.tombstone(&"b".into(), "d2", 3);
        assert!(f.garbage_ratio() > 0.0);

        let c = f.compacted();
        assert_eq!(c.stats().tombstones, 0);
        assert_eq!(c.stats().deleted_docs, 0);
        assert_eq!(c.stats().back_index_rows, 1);
        assert_eq!(c.garbage_ratio(), 0.0);
        let before: Vec<_> = f.iter_live().map(|(k, d, v)| (k.clone(), d.to_string(), v.to_vec())).collect();
        let after: Vec<_> = c.iter_live().map(|(k, d, v)| (k.clone(), d.to_string(), v.to_vec())).collect();
        assert_eq!(before, after);
    }

    #[test]
    fn image_roundtrip_preserves_tombstones() {
        let mut f = frag_with(&[("a", "d1", json!({"n": 1})), ("b", "d2", json!([2]))]);
        f.tombstone(&"b".into(), "d2", 3);
        f.set_back_index("d1", BackIndexRow { keys: vec!["a".into()], seq: 1, deleted: false });
        f.set_indexed_seq(3);

        let back = IndexFragment::from_image(f.to_image()).unwrap();
        assert_eq!(back.stats().live_entries, 1);
        assert_eq!(back.stats().tombstones, 1);
        assert_eq!(back.indexed_seq(), 3);
        assert_eq!(back.doc_keys("d1"), vec![ViewKey::from("a")]);
    }

    #[test]
    fn delta_overrides_base_until_folded() {
        let mut f = frag_with(&[("a", "d1", json!(1)), ("b", "d2", json!(2)), ("c", "d3", json!(3))]);
        f.fold_delta();
        assert_eq!(f.delta_len(), 0);
        let old = f.clone();

        f.tombstone(&"b".into(), "d2", 4);
        f.upsert("a".into(), "d1", vec![json!(10)], 5);
        f.upsert("bb".into(), "d4", vec![json!(6)], 6);
        assert!(f.shares_base_with(&old));
        assert_eq!(f.delta_len(), 3);

        // 旧版本不受影响
        assert_eq!(old.live_entries(), 3);
        assert_eq!(old.get(&"b".into(), "d2"), Some(&[json!(2)][..]));

        let rows = |f: &IndexFragment| -> Vec<(String, String, Vec<Value>)> {
            f.iter_live()
                .map(|(k, d, v)| (k.to_string(), d.to_string(), v.to_vec()))
                .collect()
        };
        let layered = rows(&f);
        assert_eq!(
            layered,
            vec![
                ("\"a\"".to_string(), "d1".to_string(), vec![json!(10)]),
                ("\"bb\"".to_string(), "d4".to_string(), vec![json!(6)]),
                ("\"c\"".to_string(), "d3".to_string(), vec![json!(3)]),
            ]
        );
        let desc: Vec<String> = collect(&f, &KeyRange::all(), true)
            .into_iter()
            .map(|(_, d)| d)
            .collect();
        assert_eq!(desc, vec!["d3", "d4", "d1"]);

        f.fold_delta();
        assert!(!f.shares_base_with(&old));
        assert_eq!(rows(&f), layered);
        assert_eq!(f.stats().tombstones, 1);
        assert_eq!(f.stats().live_entries, 3);
    }

    #[test]
    fn image_of_layered_fragment_matches_folded() {
        let mut f = frag_with(&[("a", "d1", json!(1)), ("b", "d2", json!(2))]);
        f.set_back_index("d1", BackIndexRow { keys: vec!["a".into()], seq: 1, deleted: false });
        f.fold_delta();
        f.tombstone(&"a".into(), "d1", 3);
        f.set_back_index("d1", BackIndexRow { keys: vec![], seq: 3, deleted: true });

        let back = IndexFragment::from_image(f.to_image()).unwrap();
        assert_eq!(back.stats(), f.stats());
        assert!(back.back_index_row("d1").unwrap().deleted);
        assert_eq!(back.iter_live().count(), 1);
    }
}

