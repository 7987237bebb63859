use std::fmt::{Debug, Formatter};
use bit_set::BitSet;
use crate::seqno::Seqno;

/// A contiguous span of sequence numbers `[low, high]` (both inclusive) with one bit per seqno
///  marking it as received (set) or missing (clear).
///
/// This is the unit in which gaps are reported and retransmissions requested: A receiver
///  typically creates a range over its receive window, sets the bits for what it has, and sends
///  the missing runs to the sender.
///
/// NB: Passing a seqno outside `[low, high]` is a bug in the calling code, and all accessors
///      panic on it.
#[derive(Clone, Eq, PartialEq)]
pub struct SeqnoRange {
    low: Seqno,
    high: Seqno,
    received: BitSet,
}

impl Debug for SeqnoRange {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{}]", self.low, self.high)?;
        if self.num_received() > 0 {
            write!(f, " (received {} of {})", self.num_received(), self.len())?;
        }
        Ok(())
    }
}

impl SeqnoRange {
    /// creates a range with all seqnos marked as missing
    pub fn new(low: Seqno, high: Seqno) -> SeqnoRange {
        assert!(low <= high, "malformed seqno range: low {} is above high {}", low, high);
        let len = high - low + 1;
        let len: usize = len.try_into()
            .expect("seqno range is too big to be represented as a bit set");

        SeqnoRange {
            low,
            high,
            received: BitSet::with_capacity(len),
        }
    }

    /// convenience for creating a range from raw numbers
    pub fn from_raw(low: u64, high: u64) -> SeqnoRange {
        Self::new(Seqno::from_raw(low), Seqno::from_raw(high))
    }

    pub fn low(&self) -> Seqno {
        self.low
    }

    pub fn high(&self) -> Seqno {
        self.high
    }

    pub fn bounds(&self) -> (u64, u64) {
        (self.low.to_raw(), self.high.to_raw())
    }

    pub fn len(&self) -> u64 {
        self.high - self.low + 1
    }

    pub fn is_empty(&self) -> bool {
        false
    }

    pub fn contains(&self, seqno: Seqno) -> bool {
        seqno >= self.low && seqno <= self.high
    }

    fn index(&self, seqno: Seqno) -> usize {
        assert!(self.contains(seqno), "seqno {} is outside of range {:?}", seqno, self);
        (seqno - self.low) as usize
    }

    /// marks a seqno as received, returning `true` if it was not marked before
    pub fn set(&mut self, seqno: Seqno) -> bool {
        let idx = self.index(seqno);
        self.received.insert(idx)
    }

    /// marks a seqno as missing, returning `true` if it was marked as received before
    pub fn clear(&mut self, seqno: Seqno) -> bool {
        let idx = self.index(seqno);
        self.received.remove(idx)
    }

    pub fn is_set(&self, seqno: Seqno) -> bool {
        let idx = self.index(seqno);
        self.received.contains(idx)
    }

    pub fn num_received(&self) -> u64 {
        self.received.iter().count() as u64
    }

    pub fn num_missing(&self) -> u64 {
        self.len() - self.num_received()
    }

    pub fn is_complete(&self) -> bool {
        self.num_missing() == 0
    }

    pub fn received(&self) -> impl Iterator<Item = Seqno> + '_ {
        self.received.iter()
            .map(move |idx| self.low + idx as u64)
    }

    pub fn missing(&self) -> impl Iterator<Item = Seqno> + '_ {
        self.low.to_inclusive(self.high)
            .filter(move |&seqno| !self.received.contains((seqno - self.low) as usize))
    }

    /// The missing seqnos of this range, grouped into maximal contiguous runs. Each returned
    ///  range has all bits clear.
    pub fn missing_runs(&self) -> Vec<SeqnoRange> {
        let mut result = Vec::new();
        let mut run_start: Option<Seqno> = None;

        for seqno in self.low.to_inclusive(self.high) {
            let is_missing = !self.received.contains((seqno - self.low) as usize);
            match (is_missing, run_start) {
                (true, None) => run_start = Some(seqno),
                (false, Some(start)) => {
                    result.push(SeqnoRange::new(start, seqno.prev().expect("run start is below seqno")));
                    run_start = None;
                }
                _ => {}
            }
        }
        if let Some(start) = run_start {
            result.push(SeqnoRange::new(start, self.high));
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn range_with(low: u64, high: u64, received: &[u64]) -> SeqnoRange {
        let mut result = SeqnoRange::from_raw(low, high);
        for &r in received {
            result.set(Seqno::from_raw(r));
        }
        result
    }

    #[test]
    fn test_new_all_missing() {
        let range = SeqnoRange::from_raw(5, 9);
        assert_eq!(range.len(), 5);
        assert_eq!(range.num_missing(), 5);
        assert!(!range.is_complete());
        assert_eq!(range.missing().count(), 5);
    }

    #[test]
    fn test_single() {
        let mut range = SeqnoRange::from_raw(7, 7);
        assert_eq!(range.len(), 1);
        assert!(range.set(Seqno::from_raw(7)));
        assert!(!range.set(Seqno::from_raw(7)));
        assert!(range.is_complete());
    }

    #[test]
    #[should_panic]
    fn test_new_malformed() {
        SeqnoRange::from_raw(5, 4);
    }

    #[rstest]
    #[case::below(4)]
    #[case::above(10)]
    #[should_panic]
    fn test_set_out_of_bounds(#[case] seqno: u64) {
        SeqnoRange::from_raw(5, 9).set(Seqno::from_raw(seqno));
    }

    #[test]
    #[should_panic]
    fn test_is_set_out_of_bounds() {
        SeqnoRange::from_raw(5, 9).is_set(Seqno::from_raw(100));
    }

    #[test]
    fn test_set_clear() {
        let mut range = range_with(1, 4, &[2, 3]);
        assert_eq!(range.num_received(), 2);
        assert!(range.is_set(Seqno::from_raw(2)));
        assert!(range.clear(Seqno::from_raw(2)));
        assert!(!range.clear(Seqno::from_raw(2)));
        assert!(!range.is_set(Seqno::from_raw(2)));
        assert_eq!(range.received().collect::<Vec<_>>(), vec![Seqno::from_raw(3)]);
        assert_eq!(range.num_received(), 1);
        assert_eq!(range.num_missing(), 3);
        assert!(!range.is_complete());
    }

    #[rstest]
    #[case::none_received(1, 4, vec![], vec![(1,4)])]
    #[case::all_received(1, 4, vec![1,2,3,4], vec![])]
    #[case::single_gap(1, 5, vec![1,2,3,5], vec![(4,4)])]
    #[case::leading_gap(1, 5, vec![3,4,5], vec![(1,2)])]
    #[case::trailing_gap(1, 5, vec![1,2], vec![(3,5)])]
    #[case::several(10, 20, vec![10,13,14,18], vec![(11,12), (15,17), (19,20)])]
    fn test_missing_runs(#[case] low: u64, #[case] high: u64, #[case] received: Vec<u64>, #[case] expected: Vec<(u64, u64)>) {
        let range = range_with(low, high, &received);
        let runs = range.missing_runs();
        assert_eq!(runs.iter().map(|r| r.bounds()).collect::<Vec<_>>(), expected);
        assert!(runs.iter().all(|r| r.num_received() == 0));
        assert_eq!(runs.iter().map(|r| r.len()).sum::<u64>(), range.num_missing());
    }
}
