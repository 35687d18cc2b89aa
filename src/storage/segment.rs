use std::ops::Range;

use roaring::RoaringTreemap;

use crate::error::{Error, Result};
use crate::transaction::Transaction;
use crate::types::{is_transaction_id, RowId, Timestamp};

/// Timestamp given to pieces split off a range the splitting transaction
/// inserted itself: committed and deleted for everyone, reusable at once.
pub const ZOMBIE_TS: Timestamp = 1;

/// A half-open row range with uniform visibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    pub start: RowId,
    pub end: RowId,
    /// Owning tid or commit timestamp.
    pub ts: Timestamp,
    /// Previous `ts`, kept for rollback of the last transition.
    pub oldts: Timestamp,
    pub deleted: bool,
}

impl Segment {
    pub fn new(start: RowId, end: RowId, ts: Timestamp) -> Self {
        Segment {
            start,
            end,
            ts,
            oldts: 0,
            deleted: false,
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end == self.start
    }

    pub fn contains(&self, rid: RowId) -> bool {
        self.start <= rid && rid < self.end
    }

    /// Present for `tr` and therefore deletable by it.
    #[inline]
    pub fn valid_for_delete(&self, tr: &Transaction) -> bool {
        !self.deleted && tr.valid_for_read(self.ts)
    }

    /// Absent from `tr`'s point of view.
    #[inline]
    pub fn is_deleted_for(&self, tr: &Transaction) -> bool {
        (self.deleted && (tr.valid_for_read(self.ts) || !tr.old_valid_for_read(self.ts, self.oldts)))
            || (!self.deleted && !tr.valid_for_read(self.ts))
    }

    /// Present when `tr` scans candidates.
    #[inline]
    pub fn is_valid_for(&self, tr: &Transaction) -> bool {
        (!self.deleted && tr.valid_for_read(self.ts))
            || (self.deleted && tr.old_valid_for_read(self.ts, self.oldts))
    }
}

/// Row slots handed out by a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// One contiguous run.
    Dense { start: RowId, count: u64 },
    /// Ascending slots gathered from several reused ranges.
    Offsets(Vec<RowId>),
}

impl Claim {
    pub fn len(&self) -> u64 {
        match self {
            Claim::Dense { count, .. } => *count,
            Claim::Offsets(offsets) => offsets.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<RowId> {
        match self {
            Claim::Dense { start, count } => (*start..*start + *count).collect(),
            Claim::Offsets(offsets) => offsets.clone(),
        }
    }

    /// Number of leading slots that overwrite rows below `base_len`; the rest extend.
    pub fn start_of_appends(&self, base_len: u64) -> usize {
        match self {
            Claim::Dense { start, count } => {
                if *start >= base_len {
                    0
                } else {
                    (base_len - *start).min(*count) as usize
                }
            }
            Claim::Offsets(offsets) => offsets.partition_point(|&o| o < base_len),
        }
    }
}

/// Candidate rows for a scan.
#[derive(Debug, Clone, PartialEq)]
pub enum Candidates {
    Dense(Range<RowId>),
    Bitmap(RoaringTreemap),
}

impl Candidates {
    pub fn len(&self) -> u64 {
        match self {
            Candidates::Dense(r) => r.end - r.start,
            Candidates::Bitmap(bm) => bm.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_vec(&self) -> Vec<RowId> {
        match self {
            Candidates::Dense(r) => r.clone().collect(),
            Candidates::Bitmap(bm) => bm.iter().collect(),
        }
    }
}

/// Ordered segment chain of one table storage.
#[derive(Debug, Clone, Default)]
pub struct Segments {
    list: Vec<Segment>,
    /// Rows marked deleted since the last vacuum; a hint for reuse.
    deleted: u64,
    /// Slots handed out again by claims since the last vacuum.
    nr_reused: u64,
}

impl Segments {
    pub fn new() -> Self {
        Segments::default()
    }

    /// A chain whose first `cnt` rows belong to `tid`.
    pub fn with_rows(tid: Timestamp, cnt: u64) -> Self {
        let list = if cnt == 0 {
            Vec::new()
        } else {
            vec![Segment::new(0, cnt, tid)]
        };
        Segments {
            list,
            deleted: 0,
            nr_reused: 0,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Segment> {
        self.list.iter()
    }

    pub fn as_slice(&self) -> &[Segment] {
        &self.list
    }

    pub fn len(&self) -> usize {
        self.list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    pub fn tail(&self) -> Option<&Segment> {
        self.list.last()
    }

    /// End of the chain regardless of visibility.
    pub fn high_water(&self) -> RowId {
        self.list.last().map(|s| s.end).unwrap_or(0)
    }

    pub fn deleted_hint(&self) -> u64 {
        self.deleted
    }

    pub fn nr_reused(&self) -> u64 {
        self.nr_reused
    }

    pub fn reset_reuse(&mut self) {
        self.nr_reused = 0;
        self.deleted = 0;
    }

    /// Index of the segment holding `rid`.
    pub fn find(&self, rid: RowId) -> Option<usize> {
        let idx = self.list.partition_point(|s| s.end <= rid);
        match self.list.get(idx) {
            Some(s) if s.contains(rid) => Some(idx),
            _ => None,
        }
    }

    pub fn segment_at(&self, rid: RowId) -> Option<&Segment> {
        self.find(rid).map(|i| &self.list[i])
    }

    /// Retag `[start, start + cnt)` inside segment `idx` for `tid`.
    ///
    /// Returns the index of the retagged piece.
    pub fn split(&mut self, idx: usize, start: RowId, cnt: u64, tid: Timestamp, deleted: bool) -> Result<usize> {
        let o = *self
            .list
            .get(idx)
            .ok_or_else(|| Error::internal(format!("split of missing segment {}", idx)))?;
        if cnt == 0 || start < o.start || start + cnt > o.end {
            return Err(Error::internal(format!(
                "split [{}, {}) outside segment [{}, {})",
                start,
                start + cnt,
                o.start,
                o.end
            )));
        }
        if o.start == start && o.end == start + cnt {
            let seg = &mut self.list[idx];
            seg.oldts = seg.ts;
            seg.ts = tid;
            seg.deleted = deleted;
            return Ok(idx);
        }
        self.list.try_reserve(2)?;

        let mut n = Segment::new(start, start + cnt, tid);
        if o.ts == tid {
            n.ts = ZOMBIE_TS;
            n.deleted = true;
        } else {
            n.oldts = o.ts;
            n.deleted = deleted;
        }
        if start == o.start {
            self.list[idx].start = n.end;
            self.list.insert(idx, n);
            Ok(idx)
        } else if start + cnt == o.end {
            self.list[idx].end = n.start;
            self.list.insert(idx + 1, n);
            Ok(idx + 1)
        } else {
            let n2 = Segment { start: n.end, ..o };
            self.list[idx].end = n.start;
            self.list.splice(idx + 1..idx + 1, [n, n2]);
            Ok(idx + 1)
        }
    }

    fn extend(&mut self, tid: Timestamp, cnt: u64) -> Result<RowId> {
        if let Some(t) = self.list.last_mut()
            && t.ts == tid
            && !t.deleted
        {
            let slot = t.end;
            t.end += cnt;
            return Ok(slot);
        }
        let start = self.high_water();
        self.list.try_reserve(1)?;
        self.list.push(Segment::new(start, start + cnt, tid));
        Ok(start)
    }

    /// Reserve `cnt` row slots for `tr`.
    ///
    /// Deleted ranges older than `oldest` are reused first; with
    /// `allow_scatter` the claim may be spread over several of them.
    pub fn claim(&mut self, tr: &Transaction, cnt: u64, oldest: Timestamp, allow_scatter: bool) -> Result<Claim> {
        if cnt == 0 {
            return Ok(Claim::Dense {
                start: self.high_water(),
                count: 0,
            });
        }
        if cnt > 1 && allow_scatter {
            return self.claim_scattered(tr, cnt, oldest);
        }
        let tid = tr.tid;
        if self.deleted != 0 {
            let mut i = 0;
            while i < self.list.len() {
                let seg = self.list[i];
                if seg.deleted && seg.ts < oldest && seg.len() >= cnt {
                    if i > 0 && self.list[i - 1].ts == tid && !self.list[i - 1].deleted {
                        let slot = self.list[i - 1].end;
                        self.list[i - 1].end += cnt;
                        self.list[i].start += cnt;
                        if self.list[i].is_empty() {
                            self.list.remove(i);
                        }
                        self.note_reused(cnt);
                        return Ok(Claim::Dense { start: slot, count: cnt });
                    }
                    let idx = self.split(i, seg.start, cnt, tid, false)?;
                    let s = &mut self.list[idx];
                    s.ts = tid;
                    s.deleted = false;
                    let slot = s.start;
                    self.note_reused(cnt);
                    return Ok(Claim::Dense { start: slot, count: cnt });
                }
                i += 1;
            }
        }
        let start = self.extend(tid, cnt)?;
        Ok(Claim::Dense { start, count: cnt })
    }

    fn claim_scattered(&mut self, tr: &Transaction, cnt: u64, oldest: Timestamp) -> Result<Claim> {
        let tid = tr.tid;
        let mut runs: Vec<(RowId, u64)> = Vec::new();
        let mut remaining = cnt;

        if self.deleted != 0 {
            let mut i = 0;
            while i < self.list.len() && remaining > 0 {
                let seg = self.list[i];
                if seg.deleted && seg.ts < oldest && !seg.is_empty() {
                    if seg.len() >= remaining {
                        if i > 0 && self.list[i - 1].ts == tid && !self.list[i - 1].deleted {
                            let slot = self.list[i - 1].end;
                            self.list[i - 1].end += remaining;
                            self.list[i].start += remaining;
                            if self.list[i].is_empty() {
                                self.list.remove(i);
                            }
                            runs.push((slot, remaining));
                            self.note_reused(remaining);
                            remaining = 0;
                            break;
                        }
                        i = self.split(i, seg.start, remaining, tid, false)?;
                    } else {
                        let s = &mut self.list[i];
                        s.oldts = s.ts;
                    }
                    let s = &mut self.list[i];
                    s.ts = tid;
                    s.deleted = false;
                    let (slot, len) = (s.start, s.len());
                    runs.push((slot, len));
                    self.note_reused(len);
                    remaining -= len;
                }
                i += 1;
            }
        }
        if remaining > 0 {
            let slot = self.extend(tid, remaining)?;
            runs.push((slot, remaining));
        }
        match runs.as_slice() {
            [(start, count)] => Ok(Claim::Dense {
                start: *start,
                count: *count,
            }),
            _ => {
                let mut offsets = Vec::new();
                offsets.try_reserve(cnt as usize)?;
                for (start, len) in runs {
                    offsets.extend(start..start + len);
                }
                offsets.sort_unstable();
                Ok(Claim::Offsets(offsets))
            }
        }
    }

    fn note_reused(&mut self, cnt: u64) {
        self.nr_reused += cnt;
        self.deleted = self.deleted.saturating_sub(cnt);
    }

    /// Mark `[start, start + cnt)` deleted for `tr`.
    ///
    /// Rows already absent for `tr` are skipped; rows `tr` cannot delete, or
    /// for which `conflicts` reports pending updates, are a conflict.
    pub fn delete_range(
        &mut self,
        tr: &Transaction,
        mut start: RowId,
        mut cnt: u64,
        conflicts: &mut dyn FnMut(RowId, u64) -> bool,
    ) -> Result<u64> {
        let mut deleted = 0;
        let mut i = self.list.partition_point(|s| s.end <= start);
        while cnt > 0 {
            let seg = match self.list.get(i) {
                Some(seg) if seg.contains(start) => *seg,
                _ => {
                    return Err(Error::InvalidOperation(format!(
                        "row {} is beyond the table end {}",
                        start,
                        self.high_water()
                    )));
                }
            };
            let lcnt = cnt.min(seg.end - start);
            if seg.is_deleted_for(tr) {
                start += lcnt;
                cnt -= lcnt;
                i += 1;
                continue;
            }
            if !seg.valid_for_delete(tr) {
                return Err(Error::conflict(format!("rows [{}, {}) changed concurrently", start, start + lcnt)));
            }
            if conflicts(start, lcnt) {
                return Err(Error::conflict(format!("rows [{}, {}) have pending updates", start, start + lcnt)));
            }
            let idx = self.split(i, start, lcnt, tr.tid, true)?;
            self.deleted += lcnt;
            deleted += lcnt;
            start += lcnt;
            cnt -= lcnt;
            i = idx + 1;
        }
        Ok(deleted)
    }

    /// Mark one row deleted; anything but a live row is a conflict.
    pub fn delete_row(
        &mut self,
        tr: &Transaction,
        rid: RowId,
        conflicts: &mut dyn FnMut(RowId, u64) -> bool,
    ) -> Result<()> {
        let idx = self.find(rid).ok_or_else(|| {
            Error::InvalidOperation(format!("row {} is beyond the table end {}", rid, self.high_water()))
        })?;
        if !self.list[idx].valid_for_delete(tr) {
            return Err(Error::conflict(format!("row {} changed concurrently", rid)));
        }
        if conflicts(rid, 1) {
            return Err(Error::conflict(format!("row {} has a pending update", rid)));
        }
        self.split(idx, rid, 1, tr.tid, true)?;
        self.deleted += 1;
        Ok(())
    }

    /// Revert every range owned by `tr` and coalesce ranges nobody can tell apart.
    ///
    /// Returns the ranges merged away, stamped with `now`.
    pub fn rollback(&mut self, tr: &Transaction, oldest: Timestamp, now: Timestamp) -> Vec<Segment> {
        let tid = tr.tid;
        for seg in self.list.iter_mut().filter(|s| s.ts == tid) {
            let len = seg.len();
            let was_insert = !seg.deleted || seg.ts == seg.oldts;
            if was_insert {
                self.deleted += len;
            } else {
                self.deleted = self.deleted.saturating_sub(len);
            }
            seg.deleted = was_insert;
            seg.ts = if seg.oldts == tid { 0 } else { seg.oldts };
            seg.oldts = 0;
        }
        let mut removed = self.coalesce(|prev, cur| prev.ts <= oldest && cur.ts <= oldest && prev.deleted == cur.deleted);
        for seg in removed.iter_mut() {
            seg.ts = now;
        }
        removed
    }

    /// Stamp `tid`'s ranges with `commit_ts` and coalesce committed neighbours
    /// no active snapshot can distinguish.
    ///
    /// Returns the ranges merged away that readers may still hold; empty when
    /// `commit_ts == oldest`.
    pub fn merge(&mut self, tid: Timestamp, commit_ts: Timestamp, oldest: Timestamp, active: &[Timestamp]) -> Vec<Segment> {
        for seg in self.list.iter_mut().filter(|s| s.ts == tid) {
            if !seg.deleted {
                seg.oldts = 0;
            }
            seg.ts = commit_ts;
        }
        if is_transaction_id(commit_ts) {
            return Vec::new();
        }
        let mut removed = self.coalesce(|prev, cur| {
            !is_transaction_id(prev.ts)
                && !is_transaction_id(cur.ts)
                && prev.deleted == cur.deleted
                && !active.iter().any(|&a| separates(prev.ts, cur.ts, a))
                // deleted ranges also answer old snapshots through `oldts`
                && (!prev.deleted
                    || prev.oldts == cur.oldts
                    || !active.iter().any(|&a| separates(prev.oldts, cur.oldts, a)))
        });
        if commit_ts == oldest {
            return Vec::new();
        }
        for seg in removed.iter_mut() {
            seg.ts = commit_ts;
        }
        removed
    }

    fn coalesce(&mut self, mut mergeable: impl FnMut(&Segment, &Segment) -> bool) -> Vec<Segment> {
        let mut removed = Vec::new();
        let mut kept = 0usize;
        for r in 0..self.list.len() {
            let cur = self.list[r];
            if kept > 0 {
                let prev = self.list[kept - 1];
                if prev.end == cur.start && mergeable(&prev, &cur) {
                    self.list[kept - 1].end = cur.end;
                    removed.push(cur);
                    continue;
                }
            }
            self.list[kept] = cur;
            kept += 1;
        }
        self.list.truncate(kept);
        removed
    }

    /// End of the last range `tr` owns or can see.
    pub fn end_including_deleted(&self, tr: &Transaction) -> RowId {
        self.list
            .iter()
            .rev()
            .find(|s| s.ts == tr.tid || s.is_valid_for(tr))
            .map(|s| s.end)
            .unwrap_or(0)
    }

    /// End of the last range visible to `tr`.
    pub fn end_for(&self, tr: &Transaction) -> RowId {
        self.list
            .iter()
            .rev()
            .find(|s| s.is_valid_for(tr))
            .map(|s| s.end)
            .unwrap_or(0)
    }

    /// Write `tr`'s ranges into a deletion bitmap.
    ///
    /// Rows between the bitmap's current count and an owned range are marked
    /// deleted; `count` grows to cover everything `tr` touched.
    pub fn materialize_deletes(&self, tr: &Transaction, bitmap: &mut RoaringTreemap, count: &mut u64) {
        let nr = self.end_including_deleted(tr);
        let mut cnt = *count;
        for s in &self.list {
            if s.start >= nr {
                break;
            }
            if s.ts == tr.tid && !s.is_empty() {
                if cnt < s.start {
                    bitmap.insert_range(cnt..s.start);
                }
                if s.deleted {
                    bitmap.insert_range(s.start..s.end);
                } else {
                    bitmap.remove_range(s.start..s.end);
                }
                cnt = cnt.max(s.end);
            }
        }
        if nr > *count {
            *count = nr;
        }
    }

    /// True when some range is invisible to `tr`; committed ranges only unless `uncommitted`.
    pub fn conflicts(&self, tr: &Transaction, uncommitted: bool) -> bool {
        self.list
            .iter()
            .any(|s| (uncommitted || !is_transaction_id(s.ts)) && !tr.valid_for_read(s.ts))
    }

    pub fn in_transaction(&self, tid: Timestamp) -> bool {
        self.list.iter().any(|s| s.ts == tid)
    }

    pub fn count_inserts(&self, tid: Timestamp) -> u64 {
        self.list
            .iter()
            .filter(|s| !s.deleted && s.ts == tid)
            .map(Segment::len)
            .sum()
    }

    pub fn count_deleted(&self, tr: &Transaction) -> u64 {
        self.list.iter().filter(|s| s.is_deleted_for(tr)).map(Segment::len).sum()
    }

    pub fn count_deleted_in_range(&self, tr: &Transaction, start: RowId, end: RowId) -> u64 {
        let first = self.list.partition_point(|s| s.end <= start);
        self.list[first..]
            .iter()
            .take_while(|s| s.start < end)
            .filter(|s| s.is_deleted_for(tr))
            .map(|s| s.end.min(end) - s.start.max(start))
            .sum()
    }

    pub fn has_deletes_in_range(&self, tr: &Transaction, start: RowId, end: RowId) -> bool {
        let first = self.list.partition_point(|s| s.end <= start);
        self.list[first..]
            .iter()
            .take_while(|s| s.start < end)
            .any(|s| s.is_deleted_for(tr))
    }

    /// Row `rid` was inserted by `tid` and is still live.
    pub fn is_append(&self, tid: Timestamp, rid: RowId) -> bool {
        self.segment_at(rid).is_some_and(|s| s.ts == tid && !s.deleted)
    }

    /// Row `rid` was deleted at or after `tr`'s snapshot.
    pub fn is_deleted_since(&self, tr: &Transaction, rid: RowId) -> bool {
        self.segment_at(rid).is_some_and(|s| s.ts >= tr.ts && s.deleted)
    }

    /// Rows of `[start, end)` present for `tr`.
    pub fn candidates(&self, tr: &Transaction, start: RowId, end: RowId) -> Candidates {
        if start >= end {
            return Candidates::Dense(start..start);
        }
        if !self.has_deletes_in_range(tr, start, end) {
            return Candidates::Dense(start..end);
        }
        let mut bitmap = RoaringTreemap::new();
        let first = self.list.partition_point(|s| s.end <= start);
        for s in self.list[first..].iter().take_while(|s| s.start < end) {
            if s.is_valid_for(tr) {
                bitmap.insert_range(s.start.max(start)..s.end.min(end));
            }
        }
        Candidates::Bitmap(bitmap)
    }

    /// Verify the chain partitions `[0, high_water)`.
    pub fn check_partition(&self) -> Result<()> {
        let mut expected = 0;
        for s in &self.list {
            if s.start != expected || s.start >= s.end {
                return Err(Error::internal(format!(
                    "segment [{}, {}) breaks the partition at {}",
                    s.start, s.end, expected
                )));
            }
            expected = s.end;
        }
        Ok(())
    }
}

/// An active snapshot at `active` can tell ranges stamped `a` and `b` apart.
fn separates(a: Timestamp, b: Timestamp, active: Timestamp) -> bool {
    !(a < active && b < active) && !(a > active && b > active)
}
