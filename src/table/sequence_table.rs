use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, RwLock};
use tracing::{debug, trace, warn};
use crate::seqno::Seqno;
use crate::seqno_range::SeqnoRange;

type Slots<T> = Box<[Option<T>]>;

/// A row covers `row_size` consecutive seqnos. Its slots are allocated lazily on the first
///  insert and dropped again when a purge leaves the row empty, so sparse tables do not pay for
///  rows they don't use.
type Row<T> = Mutex<Option<Slots<T>>>;

struct Matrix<T> {
    /// seqno of the first slot in the first row, always row aligned and never above the
    ///  low-water mark
    offset: Seqno,
    rows: VecDeque<Row<T>>,
}

impl<T> Matrix<T> {
    fn locate(&self, seqno: Seqno, row_size: usize) -> Option<(usize, usize)> {
        let idx = seqno.to_raw().checked_sub(self.offset.to_raw())?;
        let row_size = row_size as u64;
        let row = usize::try_from(idx / row_size).ok()?;
        if row >= self.rows.len() {
            return None;
        }
        Some((row, (idx % row_size) as usize))
    }

    /// seqno *after* the last slot of the last row
    fn end(&self, row_size: usize) -> Seqno {
        self.offset + (self.rows.len() * row_size) as u64
    }
}

/// Sparse storage of entries keyed by [Seqno], organized as a deque of fixed-size rows.
///
/// Concurrency is split in two levels:
/// * The row structure (which rows exist and where they start) is guarded by a `RwLock`. All
///    regular operations including purging take it for reading, so they can run in parallel.
///    It is taken for writing only to append rows at the end or to drop purged rows from the
///    front.
/// * Each row has its own mutex, so inserts at different seqnos only contend if they happen to
///    fall into the same row, and then only for the duration of a single slot update. Purging
///    and draining lock one row at a time.
///
/// Insertion is check-and-set per slot: for any number of racing `put` calls for the same seqno,
///  exactly one succeeds.
///
/// NB: The low-water mark is an atomic that purges move *before* they clear a row, and `put`
///      checks it while holding the row's lock. So an insert racing with a purge of its row is
///      either rejected or removed by the purge.
pub struct SequenceTable<T> {
    row_size: usize,
    matrix: RwLock<Matrix<T>>,
    /// the lowest seqno that can still be inserted - everything below is purged for good
    low_water_mark: AtomicU64,
    /// serializes `purge` and `remove_up_to` with each other, not with inserts
    purging: Mutex<()>,
    size: AtomicUsize,
    /// raw value of the highest seqno ever inserted *plus one*, 0 if there was no insert yet
    highest_plus_one: AtomicU64,
}

impl<T> SequenceTable<T> {
    pub fn new(first_seqno: Seqno, row_size: usize, initial_rows: usize) -> SequenceTable<T> {
        assert!(row_size > 0, "row size must be positive");

        let mut rows = VecDeque::with_capacity(initial_rows);
        rows.resize_with(initial_rows, || Mutex::new(None));

        SequenceTable {
            row_size,
            matrix: RwLock::new(Matrix {
                offset: first_seqno,
                rows,
            }),
            low_water_mark: AtomicU64::new(first_seqno.to_raw()),
            purging: Mutex::new(()),
            size: AtomicUsize::new(0),
            highest_plus_one: AtomicU64::new(0),
        }
    }

    fn new_slots(&self) -> Slots<T> {
        let mut v = Vec::with_capacity(self.row_size);
        v.resize_with(self.row_size, || None);
        v.into_boxed_slice()
    }

    /// Inserts an entry, returning `false` without any change if the seqno is already present
    ///  or below the low-water mark. Capacity is added transparently if the seqno is beyond the
    ///  current last row.
    ///
    /// NB: All rows between the low-water mark and `seqno` are allocated (though not their
    ///      slots), so callers must bound how far ahead of the window they insert.
    pub fn put(&self, seqno: Seqno, value: T) -> bool {
        if seqno.to_raw() > u64::MAX - self.row_size as u64 {
            warn!("seqno {} is too close to the end of the seqno space - ignoring", seqno);
            return false;
        }

        loop {
            {
                let matrix = self.matrix.read().expect("table lock poisoned");
                if let Some((row_idx, slot_idx)) = matrix.locate(seqno, self.row_size) {
                    let mut row = matrix.rows[row_idx].lock().expect("row lock poisoned");
                    if seqno < self.low_water_mark() {
                        trace!("seqno {} is below the low-water mark - ignoring", seqno);
                        return false;
                    }
                    let slots = row.get_or_insert_with(|| self.new_slots());
                    if slots[slot_idx].is_some() {
                        trace!("seqno {} is already present - ignoring", seqno);
                        return false;
                    }
                    slots[slot_idx] = Some(value);
                    self.size.fetch_add(1, Ordering::AcqRel);
                    self.highest_plus_one.fetch_max(seqno.to_raw() + 1, Ordering::AcqRel);
                    return true;
                }

                if seqno < matrix.offset || seqno < self.low_water_mark() {
                    trace!("seqno {} is below the low-water mark - ignoring", seqno);
                    return false;
                }
            }

            self.grow_to(seqno);
        }
    }

    fn grow_to(&self, seqno: Seqno) {
        let mut matrix = self.matrix.write().expect("table lock poisoned");
        let old_num_rows = matrix.rows.len();
        while matrix.end(self.row_size) <= seqno {
            matrix.rows.push_back(Mutex::new(None));
        }
        if matrix.rows.len() != old_num_rows {
            debug!("growing sequence table from {} to {} rows to fit seqno {}", old_num_rows, matrix.rows.len(), seqno);
        }
    }

    /// Runs `f` on the entry for `seqno` while holding its row's lock, i.e. atomically with regard
    ///  to concurrent `put` / `remove` / `purge` for the same seqno.
    pub fn update<R>(&self, seqno: Seqno, f: impl FnOnce(&mut T) -> R) -> Option<R> {
        let matrix = self.matrix.read().expect("table lock poisoned");
        let (row_idx, slot_idx) = matrix.locate(seqno, self.row_size)?;
        let mut row = matrix.rows[row_idx].lock().expect("row lock poisoned");
        row.as_mut()?
            .get_mut(slot_idx)?
            .as_mut()
            .map(f)
    }

    pub fn contains(&self, seqno: Seqno) -> bool {
        self.update(seqno, |_| ()).is_some()
    }

    /// Removes a single entry. This does not move the low-water mark, so the seqno can be
    ///  inserted again afterwards, and it does not reclaim the row's memory - that is done
    ///  when the row is purged.
    pub fn remove(&self, seqno: Seqno) -> Option<T> {
        let matrix = self.matrix.read().expect("table lock poisoned");
        let (row_idx, slot_idx) = matrix.locate(seqno, self.row_size)?;
        let mut row = matrix.rows[row_idx].lock().expect("row lock poisoned");
        let removed = row.as_mut()?[slot_idx].take();
        if removed.is_some() {
            self.size.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }

    /// Drops every entry up to and including `seqno`, moving the low-water mark to the seqno
    ///  after it. Only the rows between the old and the new low-water mark are touched: they are
    ///  cleared one at a time under their own lock, and rows that end up completely below the
    ///  low-water mark are dropped afterwards.
    ///
    /// Returns the removed entries in ascending seqno order.
    pub fn purge(&self, seqno: Seqno) -> Vec<(Seqno, T)> {
        let _purging = self.purging.lock().expect("purge lock poisoned");

        let new_low_water_mark = seqno.saturating_next();
        let old_low_water_mark = Seqno::from_raw(
            self.low_water_mark.fetch_max(new_low_water_mark.to_raw(), Ordering::SeqCst));
        if new_low_water_mark <= old_low_water_mark {
            return Vec::new();
        }

        let mut removed = Vec::new();
        {
            let matrix = self.matrix.read().expect("table lock poisoned");
            let end = std::cmp::min(new_low_water_mark, matrix.end(self.row_size));
            let mut cur = std::cmp::max(old_low_water_mark, matrix.offset);
            while cur < end {
                let Some((row_idx, slot_idx)) = matrix.locate(cur, self.row_size) else {
                    break;
                };
                let row_end = cur + (self.row_size - slot_idx) as u64;
                let mut row = matrix.rows[row_idx].lock().expect("row lock poisoned");
                if let Some(slots) = row.as_mut() {
                    let stop = std::cmp::min(row_end, end);
                    for (i, slot) in slots[slot_idx..].iter_mut().enumerate() {
                        let slot_seqno = cur + i as u64;
                        if slot_seqno >= stop {
                            break;
                        }
                        if let Some(value) = slot.take() {
                            removed.push((slot_seqno, value));
                        }
                    }
                    if slots.iter().all(Option::is_none) {
                        *row = None;
                    }
                }
                cur = row_end;
            }
        }

        self.size.fetch_sub(removed.len(), Ordering::AcqRel);
        self.drop_rows_below(new_low_water_mark);

        trace!("purged {} entries up to {}", removed.len(), seqno);
        removed
    }

    /// Removes up to `max` entries from the low-water mark upward, stopping at the first
    ///  absent seqno or after `up_to` (inclusive). The low-water mark moves past each entry
    ///  while its row is locked, so removed entries can never be inserted again.
    pub fn remove_up_to(&self, up_to: Seqno, max: usize) -> Vec<(Seqno, T)> {
        let _purging = self.purging.lock().expect("purge lock poisoned");

        let mut removed = Vec::new();
        let mut cur = self.low_water_mark();
        {
            let matrix = self.matrix.read().expect("table lock poisoned");
            while cur <= up_to && removed.len() < max {
                let Some((row_idx, slot_idx)) = matrix.locate(cur, self.row_size) else {
                    break;
                };
                let mut row = matrix.rows[row_idx].lock().expect("row lock poisoned");
                let Some(slots) = row.as_mut() else {
                    break;
                };

                let mut is_done = false;
                for slot in slots[slot_idx..].iter_mut() {
                    if cur > up_to || removed.len() >= max {
                        is_done = true;
                        break;
                    }
                    let Some(value) = slot.take() else {
                        is_done = true;
                        break;
                    };
                    removed.push((cur, value));
                    cur = cur.next();
                    self.low_water_mark.store(cur.to_raw(), Ordering::SeqCst);
                }
                if slots.iter().all(Option::is_none) {
                    *row = None;
                }
                if is_done {
                    break;
                }
            }
        }

        if !removed.is_empty() {
            self.size.fetch_sub(removed.len(), Ordering::AcqRel);
            self.drop_rows_below(cur);
        }
        removed
    }

    fn drop_rows_below(&self, low_water_mark: Seqno) {
        let num_rows_below = |matrix: &Matrix<T>| (low_water_mark - matrix.offset) / self.row_size as u64;

        if num_rows_below(&*self.matrix.read().expect("table lock poisoned")) == 0 {
            return;
        }

        let mut matrix = self.matrix.write().expect("table lock poisoned");
        let num_below = num_rows_below(&*matrix);
        let num_dropped = std::cmp::min(num_below, matrix.rows.len() as u64);
        for _ in 0..num_dropped {
            matrix.rows.pop_front();
        }
        // the offset stays row-aligned even if the low-water mark jumps past all existing rows
        matrix.offset += num_below * self.row_size as u64;
    }

    /// number of entries, maintained incrementally
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// number of entries, counted by scanning all rows. This is for verifying the bookkeeping
    ///  behind [SequenceTable::size].
    pub fn compute_size(&self) -> usize {
        let matrix = self.matrix.read().expect("table lock poisoned");
        matrix.rows.iter()
            .map(|row| {
                row.lock().expect("row lock poisoned")
                    .as_ref()
                    .map(|slots| slots.iter().filter(|s| s.is_some()).count())
                    .unwrap_or(0)
            })
            .sum()
    }

    pub fn low_water_mark(&self) -> Seqno {
        Seqno::from_raw(self.low_water_mark.load(Ordering::SeqCst))
    }

    /// the highest seqno that was ever inserted, regardless of whether it was removed since
    pub fn high_water_mark(&self) -> Option<Seqno> {
        match self.highest_plus_one.load(Ordering::Acquire) {
            0 => None,
            n => Some(Seqno::from_raw(n - 1)),
        }
    }

    /// number of seqnos covered by the current rows
    pub fn capacity(&self) -> usize {
        self.num_rows() * self.row_size
    }

    pub fn num_rows(&self) -> usize {
        self.matrix.read().expect("table lock poisoned").rows.len()
    }

    /// The smallest seqno that is currently stored
    pub fn lowest(&self) -> Option<Seqno> {
        let matrix = self.matrix.read().expect("table lock poisoned");
        for (row_idx, row) in matrix.rows.iter().enumerate() {
            let row = row.lock().expect("row lock poisoned");
            if let Some(slots) = row.as_ref() {
                if let Some(slot_idx) = slots.iter().position(Option::is_some) {
                    return Some(matrix.offset + (row_idx * self.row_size + slot_idx) as u64);
                }
            }
        }
        None
    }

    /// a bitmap of which seqnos in `[from, to]` are present
    pub fn missing(&self, from: Seqno, to: Seqno) -> SeqnoRange {
        let mut result = SeqnoRange::new(from, to);
        self.for_each_in(from, to, |seqno, _| { result.set(seqno); });
        result
    }

    /// Calls `f` for every entry in `[from, to]`, in ascending order. Rows are locked one at a
    ///  time, so this is not a snapshot of the table as a whole.
    pub fn for_each_in(&self, from: Seqno, to: Seqno, mut f: impl FnMut(Seqno, &T)) {
        let matrix = self.matrix.read().expect("table lock poisoned");
        let from = std::cmp::max(from, std::cmp::max(self.low_water_mark(), matrix.offset));
        let end = std::cmp::min(to.saturating_next(), matrix.end(self.row_size));

        let mut cur = from;
        while cur < end {
            let Some((row_idx, slot_idx)) = matrix.locate(cur, self.row_size) else {
                break;
            };
            let row = matrix.rows[row_idx].lock().expect("row lock poisoned");
            let Some(slots) = row.as_ref() else {
                cur += (self.row_size - slot_idx) as u64;
                continue;
            };
            for (i, slot) in slots[slot_idx..].iter().enumerate() {
                let seqno = cur + i as u64;
                if seqno >= end {
                    break;
                }
                if let Some(value) = slot {
                    f(seqno, value);
                }
            }
            cur += (self.row_size - slot_idx) as u64;
        }
    }
}

impl<T: Clone> SequenceTable<T> {
    pub fn get(&self, seqno: Seqno) -> Option<T> {
        self.update(seqno, |value| value.clone())
    }

    /// clones of all entries in `[from, to]`, up to `max` of them
    pub fn range_snapshot(&self, from: Seqno, to: Seqno, max: usize) -> Vec<(Seqno, T)> {
        let mut result = Vec::new();
        self.for_each_in(from, to, |seqno, value| {
            if result.len() < max {
                result.push((seqno, value.clone()));
            }
        });
        result
    }
}
