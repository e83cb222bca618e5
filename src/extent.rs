//! Free-space tracking for a container body.
//!
//! The body `[0, body_size)` is tiled by three kinds of range: live entries,
//! *free* extents that may be handed out, and *pending* extents.  A pending
//! extent was released during this session but is still referenced by the
//! index last flushed to disk, so it must not be overwritten until the next
//! flush commits.  [`ExtentAllocator::promote_pending`] turns them into free
//! space once that has happened.
//!
//! A checksummed container's stored digest covers free space too, so
//! [`ExtentAllocator::seal`] parks its committed free space as pending and
//! new data goes to the body tail until a flush without a digest.
//!
//! Offsets are body-relative.  The allocator never hands out space beyond
//! the 32-bit limit the index can address.

use std::collections::BTreeMap;
use tracing::debug;

use crate::error::{Error, Result};

/// Largest body a 32-bit index can address.
pub const MAX_BODY: u64 = u32::MAX as u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Extent {
    pub offset: u64,
    pub length: u64,
}

impl Extent {
    pub fn new(offset: u64, length: u64) -> Self {
        Extent { offset, length }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.length
    }

    pub fn overlaps(&self, offset: u64, length: u64) -> bool {
        length > 0 && self.length > 0 && offset < self.end() && self.offset < offset + length
    }
}

// ── ExtentSet ────────────────────────────────────────────────────────────────

/// Disjoint, coalesced ranges keyed by start offset.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct ExtentSet {
    map: BTreeMap<u64, u64>,
}

impl ExtentSet {
    fn total(&self) -> u64 {
        self.map.values().sum()
    }

    fn iter(&self) -> impl Iterator<Item = Extent> + '_ {
        self.map.iter().map(|(&o, &l)| Extent::new(o, l))
    }

    /// Insert a range and merge it with both neighbours.
    fn insert(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let mut start = offset;
        let mut end = offset + length;

        if let Some((&prev, &plen)) = self.map.range(..start).next_back() {
            if prev + plen == start {
                self.map.remove(&prev);
                start = prev;
            }
        }
        if let Some(&nlen) = self.map.get(&end) {
            self.map.remove(&end);
            end += nlen;
        }
        self.map.insert(start, end - start);
    }

    /// Remove `[offset, offset + length)` from whatever extents cover it.
    fn carve(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        let end = offset + length;
        let hits: Vec<Extent> = self
            .iter()
            .filter(|e| e.overlaps(offset, length))
            .collect();
        for e in hits {
            self.map.remove(&e.offset);
            if e.offset < offset {
                self.map.insert(e.offset, offset - e.offset);
            }
            if e.end() > end {
                self.map.insert(end, e.end() - end);
            }
        }
    }

    fn shift(&mut self, delta: i64) {
        self.map = self
            .map
            .iter()
            .map(|(&o, &l)| ((o as i64 + delta) as u64, l))
            .collect();
    }

    fn last(&self) -> Option<Extent> {
        self.map.iter().next_back().map(|(&o, &l)| Extent::new(o, l))
    }
}

// ── ExtentAllocator ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtentAllocator {
    body_size: u64,
    free:      ExtentSet,
    pending:   ExtentSet,
    /// Ranges referenced by the last flushed index.
    committed: Vec<Extent>,
    /// Bytes just past the body that belong to the last flushed layout
    /// (the stored digest).  Absorbed as pending when the body grows.
    guard:     u64,
    /// Allocations prefer offsets at or above this point.
    floor:     u64,
}

impl ExtentAllocator {
    /// Rebuild allocator state from the entries of a decoded index.  Every
    /// gap becomes free space and every entry range counts as committed.
    pub fn from_entries<I>(body_size: u64, entries: I) -> Self
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut ranges: Vec<Extent> = entries
            .into_iter()
            .filter(|&(_, l)| l > 0)
            .map(|(o, l)| Extent::new(o, l))
            .collect();
        ranges.sort_by_key(|e| e.offset);

        let mut free = ExtentSet::default();
        let mut cursor = 0;
        for e in &ranges {
            if e.offset > cursor {
                free.insert(cursor, e.offset - cursor);
            }
            cursor = cursor.max(e.end());
        }
        if body_size > cursor {
            free.insert(cursor, body_size - cursor);
        }

        Self {
            body_size,
            free,
            pending: ExtentSet::default(),
            committed: ranges,
            guard: 0,
            floor: 0,
        }
    }

    pub fn body_size(&self) -> u64 {
        self.body_size
    }

    pub fn free_bytes(&self) -> u64 {
        self.free.total()
    }

    pub fn pending_bytes(&self) -> u64 {
        self.pending.total()
    }

    pub fn free_extents(&self) -> Vec<Extent> {
        self.free.iter().collect()
    }

    pub fn pending_extents(&self) -> Vec<Extent> {
        self.pending.iter().collect()
    }

    pub fn set_floor(&mut self, floor: u64) {
        self.floor = floor;
    }

    pub fn set_guard(&mut self, guard: u64) {
        self.guard = guard;
    }

    /// Park all free space as pending because a stored digest covers it.
    pub fn seal(&mut self) {
        let free = std::mem::take(&mut self.free);
        for e in free.iter() {
            self.pending.insert(e.offset, e.length);
        }
    }

    /// True when `[offset, offset + length)` is referenced by the last
    /// flushed index and must be treated copy-on-write.
    pub fn is_committed(&self, offset: u64, length: u64) -> bool {
        self.committed.iter().any(|e| e.overlaps(offset, length))
    }

    /// Reserve `length` bytes and return their offset.
    ///
    /// Best fit over free extents, lowest offset on ties, preferring
    /// extents at or above the floor.  Without a fit the body grows.
    pub fn allocate(&mut self, length: u64) -> Result<u64> {
        if length == 0 {
            return Ok(0);
        }

        let best = |above_floor: bool| {
            self.free
                .iter()
                .filter(|e| e.length >= length && (!above_floor || e.offset >= self.floor))
                .min_by_key(|e| (e.length, e.offset))
        };

        if let Some(e) = best(true).or_else(|| best(false)) {
            self.free.carve(e.offset, length);
            debug!(offset = e.offset, length, "allocated from free extent");
            return Ok(e.offset);
        }

        let offset = self.grow(length)?;
        debug!(offset, length, body_size = self.body_size, "allocated by growing body");
        Ok(offset)
    }

    /// Give a range back.  Ranges the flushed index still references are
    /// quarantined until the next successful flush.
    pub fn release(&mut self, offset: u64, length: u64) {
        if length == 0 {
            return;
        }
        if self.is_committed(offset, length) {
            self.pending.insert(offset, length);
        } else {
            self.free.insert(offset, length);
        }
    }

    /// Try to extend an uncommitted allocation in place.
    pub fn grow_in_place(&mut self, offset: u64, old_len: u64, new_len: u64) -> Result<bool> {
        if new_len <= old_len {
            return Ok(true);
        }
        let end = offset + old_len;
        let extra = new_len - old_len;
        let adjacent = self.free.map.get(&end).copied().unwrap_or(0);

        if adjacent >= extra {
            self.free.carve(end, extra);
            return Ok(true);
        }
        if end + adjacent == self.body_size && self.guard == 0 {
            let new_end = offset + new_len;
            if new_end > MAX_BODY {
                return Err(out_of_bounds(new_end));
            }
            self.free.carve(end, adjacent);
            self.body_size = new_end;
            return Ok(true);
        }
        Ok(false)
    }

    /// Shrink an uncommitted allocation in place.
    pub fn shrink_in_place(&mut self, offset: u64, old_len: u64, new_len: u64) {
        if new_len < old_len {
            self.release(offset + new_len, old_len - new_len);
        }
    }

    /// Take `[0, length)` out of both sets so nothing can be allocated
    /// there.  The body is extended first if it is shorter.
    pub fn carve_front(&mut self, length: u64) {
        if length > self.body_size {
            let guard_end = self.body_size + self.guard;
            self.free.insert(self.body_size, length - self.body_size);
            self.body_size = length;
            self.guard = guard_end.saturating_sub(length);
        }
        self.free.carve(0, length);
        self.pending.carve(0, length);
    }

    /// Move every tracked range by `delta` bytes and resize the body to
    /// match.  Used when the prefix ahead of the body changes size.
    /// Committed ranges pushed below zero are clipped away.
    pub fn shift(&mut self, delta: i64) {
        self.free.shift(delta);
        self.pending.shift(delta);
        self.committed = self
            .committed
            .iter()
            .filter_map(|e| {
                let start = (e.offset as i64 + delta).max(0);
                let end = e.end() as i64 + delta;
                (end > start).then(|| Extent::new(start as u64, (end - start) as u64))
            })
            .collect();
        self.body_size = (self.body_size as i64 + delta) as u64;
    }

    /// Add `[0, length)` as free space at the front of an already
    /// shifted body.
    pub fn free_front(&mut self, length: u64) {
        self.free.insert(0, length);
    }

    /// Called after a successful flush: the given entry ranges become the
    /// new committed set.  Pending space becomes free, or with `sealed` all
    /// free space becomes pending.
    pub fn promote_pending<I>(&mut self, entries: I, guard: u64, sealed: bool)
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        if sealed {
            self.seal();
        } else {
            let pending = std::mem::take(&mut self.pending);
            for e in pending.iter() {
                self.free.insert(e.offset, e.length);
            }
        }
        self.committed = entries
            .into_iter()
            .filter(|&(_, l)| l > 0)
            .map(|(o, l)| Extent::new(o, l))
            .collect();
        self.guard = guard;
    }

    /// Check that free, pending and entry ranges tile `[0, body_size)`.
    pub fn check_tiling<I>(&self, entries: I) -> std::result::Result<(), String>
    where
        I: IntoIterator<Item = (u64, u64)>,
    {
        let mut ranges: Vec<(u64, u64, &'static str)> = entries
            .into_iter()
            .filter(|&(_, l)| l > 0)
            .map(|(o, l)| (o, l, "entry"))
            .collect();
        ranges.extend(self.free.iter().map(|e| (e.offset, e.length, "free")));
        ranges.extend(self.pending.iter().map(|e| (e.offset, e.length, "pending")));
        ranges.sort_by_key(|r| r.0);

        let mut cursor = 0;
        for (offset, length, kind) in ranges {
            if offset != cursor {
                return Err(format!("{kind} range at {offset} but previous range ends at {cursor}"));
            }
            cursor = offset + length;
        }
        if cursor != self.body_size {
            return Err(format!("ranges end at {cursor}, body is {}", self.body_size));
        }
        Ok(())
    }

    fn grow(&mut self, length: u64) -> Result<u64> {
        if self.guard > 0 {
            self.pending.insert(self.body_size, self.guard);
            self.body_size += self.guard;
            self.guard = 0;
        }
        let start = match self.free.last() {
            Some(tail) if tail.end() == self.body_size => tail.offset,
            _ => self.body_size,
        };
        let end = start + length;
        if end > MAX_BODY {
            return Err(out_of_bounds(end));
        }
        self.free.carve(start, self.body_size - start);
        self.body_size = end;
        Ok(start)
    }
}

fn out_of_bounds(end: u64) -> Error {
    Error::OutOfBounds(format!("body would end at {end}, past the 32-bit limit"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_appends_to_empty_body() {
        let mut a = ExtentAllocator::default();
        assert_eq!(a.allocate(10).unwrap(), 0);
        assert_eq!(a.allocate(5).unwrap(), 10);
        assert_eq!(a.body_size(), 15);
        assert!(a.check_tiling([(0, 10), (10, 5)]).is_ok());
    }

    #[test]
    fn best_fit_prefers_smallest_then_lowest() {
        let mut a = ExtentAllocator::from_entries(100, [(10, 10), (30, 40), (75, 25)]);
        // free: [0,10) [20,30) [70,75)
        assert_eq!(a.allocate(5).unwrap(), 70);
        assert_eq!(a.allocate(10).unwrap(), 0);
        assert_eq!(a.allocate(10).unwrap(), 20);
        assert_eq!(a.free_bytes(), 0);
    }

    #[test]
    fn floor_is_preferred_but_not_required() {
        let mut a = ExtentAllocator::from_entries(100, [(8, 50), (60, 40)]);
        a.set_floor(50);
        // free: [0,8) [58,60)
        assert_eq!(a.allocate(2).unwrap(), 58);
        assert_eq!(a.allocate(4).unwrap(), 0);
    }

    #[test]
    fn release_merges_both_neighbours() {
        let mut a = ExtentAllocator::default();
        let x = a.allocate(10).unwrap();
        let y = a.allocate(10).unwrap();
        let z = a.allocate(10).unwrap();
        a.release(x, 10);
        a.release(z, 10);
        a.release(y, 10);
        assert_eq!(a.free_extents(), vec![Extent::new(0, 30)]);
    }

    #[test]
    fn committed_release_is_quarantined() {
        let mut a = ExtentAllocator::from_entries(20, [(0, 10), (10, 10)]);
        a.release(0, 10);
        assert_eq!(a.free_bytes(), 0);
        assert_eq!(a.pending_bytes(), 10);
        assert_eq!(a.allocate(10).unwrap(), 20);

        a.promote_pending([(10, 10), (20, 10)], 0, false);
        assert_eq!(a.free_extents(), vec![Extent::new(0, 10)]);
    }

    #[test]
    fn sealed_free_space_is_not_reused() {
        let mut a = ExtentAllocator::from_entries(30, [(10, 10)]);
        a.seal();
        assert_eq!(a.free_bytes(), 0);
        assert_eq!(a.pending_bytes(), 20);
        assert_eq!(a.allocate(5).unwrap(), 30);

        // Released uncommitted space is reusable until the next flush.
        a.release(30, 5);
        assert_eq!(a.allocate(5).unwrap(), 30);
        a.promote_pending([(10, 10), (30, 5)], 20, true);
        assert_eq!(a.free_bytes(), 0);
        assert!(a.check_tiling([(10, 10), (30, 5)]).is_ok());

        a.promote_pending([(10, 10), (30, 5)], 0, false);
        assert_eq!(a.free_extents(), vec![Extent::new(0, 10), Extent::new(20, 10)]);
    }

    #[test]
    fn growth_absorbs_guard_as_pending() {
        let mut a = ExtentAllocator::from_entries(10, [(0, 10)]);
        a.set_guard(32);
        assert_eq!(a.allocate(4).unwrap(), 42);
        assert_eq!(a.pending_extents(), vec![Extent::new(10, 32)]);
        assert!(a.check_tiling([(0, 10), (42, 4)]).is_ok());
    }

    #[test]
    fn grow_reuses_free_tail() {
        let mut a = ExtentAllocator::from_entries(20, [(0, 10)]);
        assert_eq!(a.allocate(15).unwrap(), 10);
        assert_eq!(a.body_size(), 25);
    }

    #[test]
    fn grow_in_place_uses_adjacent_space() {
        let mut a = ExtentAllocator::default();
        let x = a.allocate(10).unwrap();
        assert!(a.grow_in_place(x, 10, 30).unwrap());
        assert_eq!(a.body_size(), 30);

        let y = a.allocate(5).unwrap();
        assert!(!a.grow_in_place(x, 30, 31).unwrap());
        a.shrink_in_place(y, 5, 1);
        assert!(a.check_tiling([(x, 30), (y, 1)]).is_ok());
    }

    #[test]
    fn out_of_bounds_past_u32() {
        let mut a = ExtentAllocator::from_entries(MAX_BODY - 4, [(0, MAX_BODY - 4)]);
        assert!(matches!(a.allocate(8), Err(Error::OutOfBounds(_))));
        assert_eq!(a.allocate(4).unwrap(), MAX_BODY - 4);
    }

    #[test]
    fn carve_front_and_shift() {
        let mut a = ExtentAllocator::from_entries(40, [(20, 20)]);
        a.carve_front(12);
        a.shift(-12);
        assert_eq!(a.body_size(), 28);
        assert!(a.check_tiling([(8, 20)]).is_ok());
    }
}
