//! Sort Key Allocation
//!
//! Siblings are ordered by an `i64` sort key drawn from a gapped keyspace:
//! new keys are spaced `gap` apart (1000 by default) so most inserts only
//! touch the moving node. When no integer fits between two neighbours the
//! whole sibling group is renumbered to `gap, 2*gap, 3*gap, ...`.
//!
//! The allocator is pure. Stores call it while holding their transaction and
//! apply the returned [`Placement`] atomically.

use thiserror::Error;
use uuid::Uuid;

/// Default spacing between consecutive sibling keys
pub const DEFAULT_SORT_GAP: i64 = 1000;

/// A sibling's identity and current key, as read inside a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SiblingKey {
    pub id: Uuid,
    pub sort: i64,
}

impl SiblingKey {
    pub fn new(id: Uuid, sort: i64) -> Self {
        Self { id, sort }
    }
}

/// Outcome of an allocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Placement {
    /// Only the moving node changes; it takes this key
    Key(i64),
    /// Every member of the group (moving node included) gets a new key,
    /// listed in final order
    Renumber(Vec<SiblingKey>),
}

impl Placement {
    /// Key assigned to `id` by this placement, if any.
    pub fn key_for(&self, id: Uuid) -> Option<i64> {
        match self {
            Placement::Key(key) => Some(*key),
            Placement::Renumber(keys) => keys.iter().find(|k| k.id == id).map(|k| k.sort),
        }
    }

    pub fn is_renumber(&self) -> bool {
        matches!(self, Placement::Renumber(_))
    }
}

/// The group grew past what `i64` keys at the configured gap can hold
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("sort keyspace exhausted: {members} siblings do not fit at gap {gap}")]
pub struct KeyspaceExhausted {
    pub members: usize,
    pub gap: i64,
}

/// Computes sibling sort keys for append, targeted insert and reorder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortKeyAllocator {
    gap: i64,
}

impl Default for SortKeyAllocator {
    fn default() -> Self {
        Self {
            gap: DEFAULT_SORT_GAP,
        }
    }
}

impl SortKeyAllocator {
    /// Create an allocator with the given gap. Gaps below 2 leave no room for
    /// midpoints and are raised to 2.
    pub fn new(gap: i64) -> Self {
        Self { gap: gap.max(2) }
    }

    pub fn gap(&self) -> i64 {
        self.gap
    }

    /// Key for appending after `max` (the current largest key in the group).
    ///
    /// Returns `None` if the addition would overflow.
    pub fn next_key(&self, max: Option<i64>) -> Option<i64> {
        match max {
            None => Some(self.gap),
            Some(max) => max.checked_add(self.gap),
        }
    }

    /// A key strictly between `below` and `above`, or `None` if there is no
    /// room.
    ///
    /// # Examples
    /// ```
    /// # use pagetree_core::db::SortKeyAllocator;
    /// let alloc = SortKeyAllocator::default();
    /// assert_eq!(alloc.key_between(None, None), Some(1000));        // empty group
    /// assert_eq!(alloc.key_between(None, Some(1000)), Some(500));   // before first
    /// assert_eq!(alloc.key_between(Some(3000), None), Some(4000));  // after last
    /// assert_eq!(alloc.key_between(Some(1000), Some(2000)), Some(1500));
    /// assert_eq!(alloc.key_between(Some(1000), Some(1001)), None);  // no room
    /// ```
    pub fn key_between(&self, below: Option<i64>, above: Option<i64>) -> Option<i64> {
        match (below, above) {
            (None, None) => Some(self.gap),
            (Some(below), None) => self.next_key(Some(below)),
            // Keys before the first sibling stay positive
            (None, Some(above)) => Self::midpoint(0, above),
            (Some(below), Some(above)) => Self::midpoint(below, above),
        }
    }

    fn midpoint(below: i64, above: i64) -> Option<i64> {
        let span = (above as i128) - (below as i128);
        if span < 2 {
            return None;
        }
        Some((below as i128 + span / 2) as i64)
    }

    /// Assign `gap, 2*gap, ...` to `ids` in the given order.
    pub fn renumber(&self, ids: &[Uuid]) -> Result<Vec<SiblingKey>, KeyspaceExhausted> {
        let exhausted = || KeyspaceExhausted {
            members: ids.len(),
            gap: self.gap,
        };
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                let position = i64::try_from(i + 1).map_err(|_| exhausted())?;
                let sort = position.checked_mul(self.gap).ok_or_else(exhausted)?;
                Ok(SiblingKey::new(*id, sort))
            })
            .collect()
    }

    /// Place `moving` at the end of a group.
    ///
    /// `siblings` are the group's other members. Falls back to renumbering
    /// when the next key would overflow.
    pub fn place_last(
        &self,
        siblings: &[SiblingKey],
        moving: Uuid,
    ) -> Result<Placement, KeyspaceExhausted> {
        let ordered = Self::ordered(siblings, moving);
        let max = ordered.last().map(|k| k.sort);
        match self.next_key(max) {
            Some(key) => Ok(Placement::Key(key)),
            None => {
                let mut ids: Vec<Uuid> = ordered.iter().map(|k| k.id).collect();
                ids.push(moving);
                Ok(Placement::Renumber(self.renumber(&ids)?))
            }
        }
    }

    /// Place `moving` at a caller-chosen key.
    ///
    /// A free `target` already lies strictly between its neighbours and is
    /// used as-is. If a sibling holds exactly `target`, the group is
    /// renumbered with `moving` immediately before that sibling; duplicates
    /// are never produced.
    pub fn place_at(
        &self,
        siblings: &[SiblingKey],
        moving: Uuid,
        target: i64,
    ) -> Result<Placement, KeyspaceExhausted> {
        let ordered = Self::ordered(siblings, moving);
        match ordered.iter().position(|k| k.sort == target) {
            None => Ok(Placement::Key(target)),
            Some(collision) => {
                tracing::debug!(
                    target_sort = target,
                    colliding = %ordered[collision].id,
                    "sort target taken, renumbering group"
                );
                Ok(Placement::Renumber(
                    self.renumber(&Self::insert_at(&ordered, collision, moving))?,
                ))
            }
        }
    }

    /// Place `moving` directly before or after `anchor`.
    ///
    /// Uses the midpoint between the two neighbours when there is room and
    /// renumbers otherwise. Returns `None` when `anchor` is not among
    /// `siblings`.
    pub fn place_next_to(
        &self,
        siblings: &[SiblingKey],
        moving: Uuid,
        anchor: Uuid,
        after: bool,
    ) -> Option<Result<Placement, KeyspaceExhausted>> {
        let ordered = Self::ordered(siblings, moving);
        let anchor_index = ordered.iter().position(|k| k.id == anchor)?;
        let index = if after { anchor_index + 1 } else { anchor_index };

        let below = index.checked_sub(1).map(|i| ordered[i].sort);
        let above = ordered.get(index).map(|k| k.sort);

        Some(match self.key_between(below, above) {
            Some(key) => Ok(Placement::Key(key)),
            None => self
                .renumber(&Self::insert_at(&ordered, index, moving))
                .map(Placement::Renumber),
        })
    }

    /// Renumber an existing group, preserving its order.
    pub fn compact(&self, siblings: &[SiblingKey]) -> Result<Vec<SiblingKey>, KeyspaceExhausted> {
        let mut ordered = siblings.to_vec();
        ordered.sort_by_key(|k| k.sort);
        let ids: Vec<Uuid> = ordered.iter().map(|k| k.id).collect();
        self.renumber(&ids)
    }

    /// Siblings sorted by key, with the moving node filtered out.
    fn ordered(siblings: &[SiblingKey], moving: Uuid) -> Vec<SiblingKey> {
        let mut ordered: Vec<SiblingKey> =
            siblings.iter().copied().filter(|k| k.id != moving).collect();
        ordered.sort_by_key(|k| k.sort);
        ordered
    }

    fn insert_at(ordered: &[SiblingKey], index: usize, moving: Uuid) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = ordered.iter().map(|k| k.id).collect();
        ids.insert(index, moving);
        ids
    }
}
