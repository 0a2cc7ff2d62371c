//! Key ranges.

use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::key::Key;

/// A contiguous interval of keys. Either side may be open-ended.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyRange {
    pub lower: Option<Key>,
    pub upper: Option<Key>,
    pub lower_open: bool,
    pub upper_open: bool,
}

impl KeyRange {
    /// Every key.
    pub fn all() -> Self {
        Self::default()
    }

    /// Exactly one key.
    pub fn only(key: impl Into<Key>) -> Self {
        let key = key.into();
        Self {
            lower: Some(key.clone()),
            upper: Some(key),
            lower_open: false,
            upper_open: false,
        }
    }

    pub fn lower_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            lower: Some(key.into()),
            lower_open: open,
            ..Self::default()
        }
    }

    pub fn upper_bound(key: impl Into<Key>, open: bool) -> Self {
        Self {
            upper: Some(key.into()),
            upper_open: open,
            ..Self::default()
        }
    }

    /// Both sides bounded. Fails with `DataError` when the range is empty by
    /// construction (`lower > upper`, or equal with either side open).
    pub fn bound(
        lower: impl Into<Key>,
        upper: impl Into<Key>,
        lower_open: bool,
        upper_open: bool,
    ) -> StoreResult<Self> {
        let (lower, upper) = (lower.into(), upper.into());
        if lower > upper || (lower == upper && (lower_open || upper_open)) {
            return Err(StoreError::data("lower bound exceeds upper bound"));
        }
        Ok(Self {
            lower: Some(lower),
            upper: Some(upper),
            lower_open,
            upper_open,
        })
    }

    pub fn includes(&self, key: &Key) -> bool {
        let above = match &self.lower {
            Some(l) if self.lower_open => key > l,
            Some(l) => key >= l,
            None => true,
        };
        let below = match &self.upper {
            Some(u) if self.upper_open => key < u,
            Some(u) => key <= u,
            None => true,
        };
        above && below
    }

    /// True when the range addresses a single key.
    pub fn is_only(&self) -> bool {
        match (&self.lower, &self.upper) {
            (Some(l), Some(u)) => l == u && !self.lower_open && !self.upper_open,
            _ => false,
        }
    }

    pub fn lower_bound_ref(&self) -> Bound<&Key> {
        match &self.lower {
            Some(k) if self.lower_open => Bound::Excluded(k),
            Some(k) => Bound::Included(k),
            None => Bound::Unbounded,
        }
    }

    pub fn upper_bound_ref(&self) -> Bound<&Key> {
        match &self.upper {
            Some(k) if self.upper_open => Bound::Excluded(k),
            Some(k) => Bound::Included(k),
            None => Bound::Unbounded,
        }
    }
}

impl From<Key> for KeyRange {
    fn from(key: Key) -> Self {
        KeyRange::only(key)
    }
}

impl From<&str> for KeyRange {
    fn from(key: &str) -> Self {
        KeyRange::only(key)
    }
}

impl From<String> for KeyRange {
    fn from(key: String) -> Self {
        KeyRange::only(key)
    }
}

/// Tighter of two lower bounds.
pub(crate) fn max_lower<'a>(a: Bound<&'a Key>, b: Bound<&'a Key>) -> Bound<&'a Key> {
    match (a, b) {
        (Bound::Unbounded, x) | (x, Bound::Unbounded) => x,
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.max(y)),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.max(y)),
        (Bound::Included(i), Bound::Excluded(e)) | (Bound::Excluded(e), Bound::Included(i)) => {
            if i > e {
                Bound::Included(i)
            } else {
                Bound::Excluded(e)
            }
        }
    }
}

/// Tighter of two upper bounds.
pub(crate) fn min_upper<'a>(a: Bound<&'a Key>, b: Bound<&'a Key>) -> Bound<&'a Key> {
    match (a, b) {
        (Bound::Unbounded, x) | (x, Bound::Unbounded) => x,
        (Bound::Included(x), Bound::Included(y)) => Bound::Included(x.min(y)),
        (Bound::Excluded(x), Bound::Excluded(y)) => Bound::Excluded(x.min(y)),
        (Bound::Included(i), Bound::Excluded(e)) | (Bound::Excluded(e), Bound::Included(i)) => {
            if i < e {
                Bound::Included(i)
            } else {
                Bound::Excluded(e)
            }
        }
    }
}
