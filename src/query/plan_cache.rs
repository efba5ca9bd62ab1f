use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;

use crate::query::request::SelectionKey;
use crate::query::selector::Selection;

struct Plan {
    generation: u64,
    selection: Selection,
    hits: AtomicU64,
}

/// 合并计划缓存（DashMap 实现）。
///
/// 条目带 registry generation：任何状态迁移都会让旧条目失效；
/// 状态通知到达时也会整体清空。满了先挤掉过期 generation 的计划，
/// 没有过期的再挤掉命中最少的。
pub struct PlanCache {
    plans: DashMap<SelectionKey, Plan>,
    capacity: usize,
}

impl PlanCache {
    pub fn with_capacity(cap: usize) -> Self {
        Self {
            plans: DashMap::with_capacity(cap),
            capacity: cap,
        }
    }

    pub fn get(&self, key: &SelectionKey, generation: u64) -> Option<Selection> {
        let plan = self.plans.get(key)?;
        if plan.generation != generation {
            return None;
        }
        plan.hits.fetch_add(1, Ordering::Relaxed);
        Some(plan.selection.clone())
    }

    pub fn insert(&self, key: SelectionKey, generation: u64, selection: Selection) {
        if self.capacity == 0 {
            return;
        }
        if self.plans.len() >= self.capacity && !self.plans.contains_key(&key) {
            let victim = self
                .plans
                .iter()
                .min_by_key(|e| {
                    let p = e.value();
                    (p.generation == generation, p.hits.load(Ordering::Relaxed))
                })
                .map(|e| e.key().clone());
            if let Some(k) = victim {
                self.plans.remove(&k);
            }
        }
        self.plans.insert(
            key,
            Plan {
                generation,
                selection,
                hits: AtomicU64::new(0),
            },
        );
    }

    pub fn clear(&self) {
        if !self.plans.is_empty() {
            tracing::debug!("Plan cache cleared ({} entries)", self.plans.len());
        }
        self.plans.clear();
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }
}
