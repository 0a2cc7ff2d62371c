//! # OrderedMap: Persistent AVL Tree
//!
//! The ordered container behind every object store and every index. Each
//! mutation returns a *new* map that shares every untouched subtree with its
//! predecessor; the predecessor is never modified. This is the whole trick
//! behind transaction isolation: a transaction's working copy starts as a
//! clone of the committed map (one `Arc` bump), and writes path-copy at most
//! `O(log n)` nodes while readers of the committed version carry on unaware.
//!
//! ```text
//!   v1:        d              v2 = v1.with(e):      d'
//!            /   \                                /    \
//!           b     f          (shared)  --->      b      f'
//!          / \   / \                            / \    /  \
//!         a   c e   g                          a   c  e'   g   (only d', f', e' are new)
//! ```
//!
//! Entries live behind `Arc<(K, V)>`, so rebalancing never clones keys or
//! values; only the small node shells are rebuilt.

use std::cmp::Ordering;
use std::fmt;
use std::ops::Bound;
use std::sync::Arc;

use crate::error::{StoreError, StoreResult};

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

type Link<K, V> = Option<Arc<Node<K, V>>>;

struct Node<K, V> {
    entry: Arc<(K, V)>,
    left: Link<K, V>,
    right: Link<K, V>,
    height: u8,
}

impl<K, V> Node<K, V> {
    fn key(&self) -> &K {
        &self.entry.0
    }
}

fn height<K, V>(link: &Link<K, V>) -> u8 {
    link.as_ref().map_or(0, |n| n.height)
}

fn make<K, V>(entry: Arc<(K, V)>, left: Link<K, V>, right: Link<K, V>) -> Arc<Node<K, V>> {
    let height = 1 + height(&left).max(height(&right));
    Arc::new(Node {
        entry,
        left,
        right,
        height,
    })
}

/// Build a node from parts, applying at most a double rotation. Callers
/// guarantee the subtrees' heights differ by at most two.
fn balance<K, V>(entry: Arc<(K, V)>, left: Link<K, V>, right: Link<K, V>) -> Arc<Node<K, V>> {
    let hl = height(&left);
    let hr = height(&right);

    if hl > hr + 1 {
        if let Some(l) = &left {
            if height(&l.left) >= height(&l.right) {
                let new_right = make(entry, l.right.clone(), right);
                return make(l.entry.clone(), l.left.clone(), Some(new_right));
            }
            if let Some(lr) = &l.right {
                let new_left = make(l.entry.clone(), l.left.clone(), lr.left.clone());
                let new_right = make(entry, lr.right.clone(), right);
                return make(lr.entry.clone(), Some(new_left), Some(new_right));
            }
        }
    } else if hr > hl + 1 {
        if let Some(r) = &right {
            if height(&r.right) >= height(&r.left) {
                let new_left = make(entry, left, r.left.clone());
                return make(r.entry.clone(), Some(new_left), r.right.clone());
            }
            if let Some(rl) = &r.left {
                let new_left = make(entry, left, rl.left.clone());
                let new_right = make(r.entry.clone(), rl.right.clone(), r.right.clone());
                return make(rl.entry.clone(), Some(new_left), Some(new_right));
            }
        }
    }

    make(entry, left, right)
}

enum Inserted<K, V> {
    Added(Arc<Node<K, V>>),
    Replaced(Arc<Node<K, V>>),
    Occupied,
}

fn insert<K: Ord, V>(
    link: &Link<K, V>,
    entry: Arc<(K, V)>,
    allow_overwrite: bool,
) -> Inserted<K, V> {
    let node = match link {
        None => return Inserted::Added(make(entry, None, None)),
        Some(node) => node,
    };

    match entry.0.cmp(node.key()) {
        Ordering::Less => match insert(&node.left, entry, allow_overwrite) {
            Inserted::Added(l) => {
                Inserted::Added(balance(node.entry.clone(), Some(l), node.right.clone()))
            }
            Inserted::Replaced(l) => {
                Inserted::Replaced(make(node.entry.clone(), Some(l), node.right.clone()))
            }
            Inserted::Occupied => Inserted::Occupied,
        },
        Ordering::Greater => match insert(&node.right, entry, allow_overwrite) {
            Inserted::Added(r) => {
                Inserted::Added(balance(node.entry.clone(), node.left.clone(), Some(r)))
            }
            Inserted::Replaced(r) => {
                Inserted::Replaced(make(node.entry.clone(), node.left.clone(), Some(r)))
            }
            Inserted::Occupied => Inserted::Occupied,
        },
        Ordering::Equal if allow_overwrite => {
            Inserted::Replaced(make(entry, node.left.clone(), node.right.clone()))
        }
        Ordering::Equal => Inserted::Occupied,
    }
}

/// Returns `None` when the key is absent (the tree is unchanged), otherwise
/// the new subtree root.
fn remove<K: Ord, V>(link: &Link<K, V>, key: &K) -> Option<Link<K, V>> {
    let node = link.as_ref()?;
    match key.cmp(node.key()) {
        Ordering::Less => {
            let left = remove(&node.left, key)?;
            Some(Some(balance(node.entry.clone(), left, node.right.clone())))
        }
        Ordering::Greater => {
            let right = remove(&node.right, key)?;
            Some(Some(balance(node.entry.clone(), node.left.clone(), right)))
        }
        Ordering::Equal => match (&node.left, &node.right) {
            (None, right) => Some(right.clone()),
            (left, None) => Some(left.clone()),
            (Some(_), Some(right)) => {
                let (successor, new_right) = remove_min(right);
                Some(Some(balance(successor, node.left.clone(), new_right)))
            }
        },
    }
}

fn remove_min<K, V>(node: &Arc<Node<K, V>>) -> (Arc<(K, V)>, Link<K, V>) {
    match &node.left {
        None => (node.entry.clone(), node.right.clone()),
        Some(left) => {
            let (min, new_left) = remove_min(left);
            (
                min,
                Some(balance(node.entry.clone(), new_left, node.right.clone())),
            )
        }
    }
}

// ---------------------------------------------------------------------------
// OrderedMap
// ---------------------------------------------------------------------------

/// Persistent ordered map. Cloning is `O(1)`.
pub struct OrderedMap<K, V> {
    root: Link<K, V>,
    len: usize,
}

impl<K, V> Clone for OrderedMap<K, V> {
    fn clone(&self) -> Self {
        Self {
            root: self.root.clone(),
            len: self.len,
        }
    }
}

impl<K, V> Default for OrderedMap<K, V> {
    fn default() -> Self {
        Self { root: None, len: 0 }
    }
}

impl<K, V> OrderedMap<K, V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// True when both maps are the very same version (same root allocation).
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (&self.root, &other.root) {
            (None, None) => true,
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Ascending iteration over every entry.
    pub fn iter(&self) -> Range<'_, K, V>
    where
        K: Ord + Clone,
    {
        self.range(Bound::Unbounded, Bound::Unbounded)
    }

    pub fn first(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(left) = node.left.as_deref() {
            node = left;
        }
        Some((&node.entry.0, &node.entry.1))
    }

    pub fn last(&self) -> Option<(&K, &V)> {
        let mut node = self.root.as_deref()?;
        while let Some(right) = node.right.as_deref() {
            node = right;
        }
        Some((&node.entry.0, &node.entry.1))
    }
}

impl<K: Ord, V> OrderedMap<K, V> {
    pub fn get(&self, key: &K) -> Option<&V> {
        let mut link = self.root.as_deref();
        while let Some(node) = link {
            match key.cmp(node.key()) {
                Ordering::Less => link = node.left.as_deref(),
                Ordering::Greater => link = node.right.as_deref(),
                Ordering::Equal => return Some(&node.entry.1),
            }
        }
        None
    }

    pub fn has(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Returns a new map containing `key -> value`.
    ///
    /// Fails with `ConstraintError` when the key is present and
    /// `allow_overwrite` is false. `self` is never modified.
    pub fn with(&self, key: K, value: V, allow_overwrite: bool) -> StoreResult<Self> {
        match insert(&self.root, Arc::new((key, value)), allow_overwrite) {
            Inserted::Added(root) => Ok(Self {
                root: Some(root),
                len: self.len + 1,
            }),
            Inserted::Replaced(root) => Ok(Self {
                root: Some(root),
                len: self.len,
            }),
            Inserted::Occupied => Err(StoreError::constraint("key already exists")),
        }
    }

    /// Insert-or-replace shorthand for `with(key, value, true)`.
    pub fn inserted(&self, key: K, value: V) -> Self {
        match insert(&self.root, Arc::new((key, value)), true) {
            Inserted::Added(root) => Self {
                root: Some(root),
                len: self.len + 1,
            },
            Inserted::Replaced(root) => Self {
                root: Some(root),
                len: self.len,
            },
            Inserted::Occupied => self.clone(),
        }
    }

    /// Returns a new map without `key`. Absent keys yield an `O(1)` clone.
    pub fn without(&self, key: &K) -> Self {
        match remove(&self.root, key) {
            Some(root) => Self {
                root,
                len: self.len - 1,
            },
            None => self.clone(),
        }
    }
}

impl<K: Ord + Clone, V> OrderedMap<K, V> {
    /// Lazy ascending iteration over the keys within `[lower, upper]`
    /// (each bound inclusive, exclusive or open).
    pub fn range(&self, lower: Bound<&K>, upper: Bound<&K>) -> Range<'_, K, V> {
        Range::new(self.root.as_deref(), lower, upper, false)
    }

    /// Same as [`OrderedMap::range`] but descending.
    pub fn range_rev(&self, lower: Bound<&K>, upper: Bound<&K>) -> Range<'_, K, V> {
        Range::new(self.root.as_deref(), lower, upper, true)
    }

    /// Direction-parameterized range.
    pub fn entries(&self, lower: Bound<&K>, upper: Bound<&K>, reverse: bool) -> Range<'_, K, V> {
        Range::new(self.root.as_deref(), lower, upper, reverse)
    }
}

impl<K: Ord, V> FromIterator<(K, V)> for OrderedMap<K, V> {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        iter.into_iter()
            .fold(Self::new(), |map, (k, v)| map.inserted(k, v))
    }
}

impl<K: Ord + Clone + fmt::Debug, V: fmt::Debug> fmt::Debug for OrderedMap<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// ---------------------------------------------------------------------------
// Range Iterator
// ---------------------------------------------------------------------------

fn owned_bound<K: Clone>(bound: Bound<&K>) -> Bound<K> {
    match bound {
        Bound::Included(k) => Bound::Included(k.clone()),
        Bound::Excluded(k) => Bound::Excluded(k.clone()),
        Bound::Unbounded => Bound::Unbounded,
    }
}

fn after_lower<K: Ord>(key: &K, lower: &Bound<K>) -> bool {
    match lower {
        Bound::Included(b) => key >= b,
        Bound::Excluded(b) => key > b,
        Bound::Unbounded => true,
    }
}

fn before_upper<K: Ord>(key: &K, upper: &Bound<K>) -> bool {
    match upper {
        Bound::Included(b) => key <= b,
        Bound::Excluded(b) => key < b,
        Bound::Unbounded => true,
    }
}

/// Lazy in-order walk bounded on both sides. Holds an explicit stack of
/// the pending ancestors, so memory is `O(log n)`.
pub struct Range<'a, K, V> {
    stack: Vec<&'a Node<K, V>>,
    lower: Bound<K>,
    upper: Bound<K>,
    reverse: bool,
}

impl<'a, K: Ord + Clone, V> Range<'a, K, V> {
    fn new(root: Option<&'a Node<K, V>>, lower: Bound<&K>, upper: Bound<&K>, reverse: bool) -> Self {
        let mut range = Self {
            stack: Vec::new(),
            lower: owned_bound(lower),
            upper: owned_bound(upper),
            reverse,
        };
        range.seek(root);
        range
    }

    /// Push the path to the first in-range node of the subtree.
    fn seek(&mut self, mut link: Option<&'a Node<K, V>>) {
        while let Some(node) = link {
            if self.reverse {
                if before_upper(node.key(), &self.upper) {
                    self.stack.push(node);
                    link = node.right.as_deref();
                } else {
                    link = node.left.as_deref();
                }
            } else if after_lower(node.key(), &self.lower) {
                self.stack.push(node);
                link = node.left.as_deref();
            } else {
                link = node.right.as_deref();
            }
        }
    }
}

impl<'a, K: Ord + Clone, V> Iterator for Range<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let node = self.stack.pop()?;
        let in_range = if self.reverse {
            after_lower(node.key(), &self.lower)
        } else {
            before_upper(node.key(), &self.upper)
        };
        if !in_range {
            self.stack.clear();
            return None;
        }

        if self.reverse {
            self.seek(node.left.as_deref());
        } else {
            self.seek(node.right.as_deref());
        }
        Some((&node.entry.0, &node.entry.1))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    // -- Helpers -------------------------------------------------------------

    fn check_balanced<K: Ord, V>(link: &Link<K, V>) -> u8 {
        match link {
            None => 0,
            Some(n) => {
                let hl = check_balanced(&n.left);
                let hr = check_balanced(&n.right);
                assert!(hl.abs_diff(hr) <= 1, "AVL balance violated");
                assert_eq!(n.height, 1 + hl.max(hr));
                n.height
            }
        }
    }

    fn keys(map: &OrderedMap<i64, i64>) -> Vec<i64> {
        map.iter().map(|(k, _)| *k).collect()
    }

    fn proptest_config() -> ProptestConfig {
        let cases = std::env::var("PROPTEST_CASES")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(128);
        ProptestConfig::with_cases(cases)
    }

    // -- Basic operations ----------------------------------------------------

    #[test]
    fn with_and_get() {
        let m = OrderedMap::new().with(2, "b", false).unwrap();
        let m = m.with(1, "a", false).unwrap();
        assert_eq!(m.get(&1), Some(&"a"));
        assert_eq!(m.get(&2), Some(&"b"));
        assert_eq!(m.get(&3), None);
        assert_eq!(m.len(), 2);
    }

    #[test]
    fn with_rejects_existing_key_without_overwrite() {
        let m = OrderedMap::new().with(1, "a", false).unwrap();
        let err = m.with(1, "z", false).unwrap_err();
        assert_eq!(err.name(), "ConstraintError");
        assert_eq!(m.get(&1), Some(&"a"));

        let m2 = m.with(1, "z", true).unwrap();
        assert_eq!(m2.get(&1), Some(&"z"));
        assert_eq!(m2.len(), 1);
    }

    #[test]
    fn without_removes_and_keeps_old_version() {
        let m: OrderedMap<i64, i64> = (0..50).map(|i| (i, i * 10)).collect();
        let m2 = m.without(&25);
        assert!(!m2.has(&25));
        assert!(m.has(&25));
        assert_eq!(m2.len(), 49);
        assert_eq!(m.len(), 50);
        check_balanced(&m2.root);

        let m3 = m2.without(&1000);
        assert!(m3.ptr_eq(&m2));
    }

    #[test]
    fn bounded_ranges_both_directions() {
        let m: OrderedMap<i64, ()> = (1..=10).map(|i| (i, ())).collect();

        let fwd: Vec<i64> = m
            .range(Bound::Excluded(&3), Bound::Included(&6))
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(fwd, vec![4, 5, 6]);

        let rev: Vec<i64> = m
            .range_rev(Bound::Included(&3), Bound::Excluded(&6))
            .map(|(k, _)| *k)
            .collect();
        assert_eq!(rev, vec![5, 4, 3]);

        let empty: Vec<i64> = m
            .range(Bound::Included(&11), Bound::Unbounded)
            .map(|(k, _)| *k)
            .collect();
        assert!(empty.is_empty());
    }

    #[test]
    fn range_is_restartable() {
        let m: OrderedMap<i64, ()> = (1..=5).map(|i| (i, ())).collect();
        let first: Vec<_> = m.iter().map(|(k, _)| *k).collect();
        let second: Vec<_> = m.iter().map(|(k, _)| *k).collect();
        assert_eq!(first, second);
    }

    #[test]
    fn first_and_last() {
        let m: OrderedMap<i64, ()> = [5, 3, 9, 1].into_iter().map(|i| (i, ())).collect();
        assert_eq!(m.first().map(|(k, _)| *k), Some(1));
        assert_eq!(m.last().map(|(k, _)| *k), Some(9));
        assert!(OrderedMap::<i64, ()>::new().first().is_none());
    }

    #[test]
    fn sequential_inserts_stay_balanced() {
        let m: OrderedMap<i64, ()> = (0..1024).map(|i| (i, ())).collect();
        let h = check_balanced(&m.root);
        assert!(h <= 15, "height {} too large for 1024 keys", h);
    }

    // -- Properties ----------------------------------------------------------

    proptest! {
        #![proptest_config(proptest_config())]

        #[test]
        fn traversal_is_strictly_ascending(ops in prop::collection::vec((any::<i16>(), any::<bool>()), 0..200)) {
            let mut model = BTreeMap::new();
            let mut map = OrderedMap::new();
            for (k, remove_it) in ops {
                let k = k as i64;
                if remove_it {
                    model.remove(&k);
                    map = map.without(&k);
                } else {
                    model.insert(k, k);
                    map = map.inserted(k, k);
                }
            }
            let got = keys(&map);
            prop_assert!(got.windows(2).all(|w| w[0] < w[1]));
            prop_assert_eq!(got, model.keys().copied().collect::<Vec<_>>());
            prop_assert_eq!(map.len(), model.len());
            check_balanced(&map.root);
        }

        #[test]
        fn prior_versions_are_unchanged(base in prop::collection::vec(any::<i16>(), 0..100), k in any::<i16>()) {
            let m1: OrderedMap<i64, i64> = base.iter().map(|&x| (x as i64, 0)).collect();
            let before: Vec<(i64, i64)> = m1.iter().map(|(k, v)| (*k, *v)).collect();
            let m2 = m1.with(k as i64, 1, true).unwrap();
            let m3 = m2.without(&(base.first().copied().unwrap_or(0) as i64));
            let after: Vec<(i64, i64)> = m1.iter().map(|(k, v)| (*k, *v)).collect();
            prop_assert_eq!(before, after);
            prop_assert_eq!(m2.get(&(k as i64)), Some(&1));
            drop(m3);
        }

        #[test]
        fn reverse_range_mirrors_forward(keys_in in prop::collection::vec(any::<i16>(), 0..100), lo in any::<i16>(), hi in any::<i16>()) {
            let m: OrderedMap<i64, ()> = keys_in.iter().map(|&x| (x as i64, ())).collect();
            let (lo, hi) = (lo.min(hi) as i64, lo.max(hi) as i64);
            let fwd: Vec<i64> = m.range(Bound::Included(&lo), Bound::Excluded(&hi)).map(|(k, _)| *k).collect();
            let mut rev: Vec<i64> = m.range_rev(Bound::Included(&lo), Bound::Excluded(&hi)).map(|(k, _)| *k).collect();
            rev.reverse();
            prop_assert_eq!(fwd, rev);
        }
    }
}
