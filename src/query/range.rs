use std::ops::Bound;

use crate::core::ViewKey;

/// 读请求的 key 区间。
///
/// `start` / `end` 按**迭代方向**解释：descending 时 `start` 是较大的一端。
#[derive(Clone, Debug)]
pub struct KeyRange {
    pub start: Option<ViewKey>,
    pub end: Option<ViewKey>,
    /// end 是否包含（默认 true）
    pub inclusive_end: bool,
}

impl Default for KeyRange {
    fn default() -> Self {
        Self::all()
    }
}

impl KeyRange {
    pub fn all() -> Self {
        Self {
            start: None,
            end: None,
            inclusive_end: true,
        }
    }

    pub fn new(start: Option<ViewKey>, end: Option<ViewKey>) -> Self {
        Self {
            start,
            end,
            inclusive_end: true,
        }
    }

    pub fn exclusive_end(mut self) -> Self {
        self.inclusive_end = false;
        self
    }

    pub fn contains(&self, key: &ViewKey, descending: bool) -> bool {
        let (lo, hi) = self.bounds(descending);
        lower_ok(lo, key) && upper_ok(hi, key)
    }

    /// 升序视角下的 (lower, upper)
    pub fn bounds(&self, descending: bool) -> (Bound<&ViewKey>, Bound<&ViewKey>) {
        let start = self.start.as_ref().map(Bound::Included).unwrap_or(Bound::Unbounded);
        let end = match self.end.as_ref() {
            None => Bound::Unbounded,
            Some(k) if self.inclusive_end => Bound::Included(k),
            Some(k) => Bound::Excluded(k),
        };
        if descending {
            (end, start)
        } else {
            (start, end)
        }
    }
}

fn lower_ok(b: Bound<&ViewKey>, key: &ViewKey) -> bool {
    match b {
        Bound::Unbounded => true,
        Bound::Included(k) => key >= k,
        Bound::Excluded(k) => key > k,
    }
}

fn upper_ok(b: Bound<&ViewKey>, key: &ViewKey) -> bool {
    match b {
        Bound::Unbounded => true,
        Bound::Included(k) => key <= k,
        Bound::Excluded(k) => key < k,
    }
}

/// `BTreeMap::range` 在 lo > hi（或两端相等且都 Excluded）时会 panic，这里先判空。
pub fn is_empty_range(lo: Bound<&ViewKey>, hi: Bound<&ViewKey>) -> bool {
    match (lo, hi) {
        (Bound::Unbounded, _) | (_, Bound::Unbounded) => false,
        (Bound::Included(a), Bound::Included(b)) => a > b,
        (Bound::Included(a), Bound::Excluded(b))
        | (Bound::Excluded(a), Bound::Included(b))
        | (Bound::Excluded(a), Bound::Excluded(b)) => a >= b,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascending_and_descending_bounds() {
        let r = KeyRange::new(Some("b".into()), Some("d".into()));
        assert!(r.contains(&"b".into(), false));
        assert!(r.contains(&"d".into(), false));
        assert!(!r.contains(&"e".into(), false));

        // descending：start 是较大的一端
        let r = KeyRange::new(Some("d".into()), Some("b".into())).exclusive_end();
        assert!(r.contains(&"d".into(), true));
        assert!(r.contains(&"c".into(), true));
        assert!(!r.contains(&"b".into(), true));
    }

    #[test]
    fn empty_range_detection() {
        let a: ViewKey = "a".into();
        let b: ViewKey = "b".into();
        assert!(is_empty_range(Bound::Included(&b), Bound::Included(&a)));
        assert!(is_empty_range(Bound::Excluded(&a), Bound::Excluded(&a)));
        assert!(is_empty_range(Bound::Excluded(&a), Bound::Included(&a)));
        assert!(!is_empty_range(Bound::Included(&a), Bound::Included(&a)));
        assert!(!is_empty_range(Bound::Unbounded, Bound::Excluded(&a)));
    }
}
