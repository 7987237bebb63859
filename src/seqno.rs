use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// Per-sender sequence number. Sequence numbers start at a configurable value (1 by default) and
///  increase monotonically; there is no wrap-around handling since a u64 does not realistically
///  run out.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Seqno(u64);

impl Display for Seqno {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Seqno {
    pub const ZERO: Seqno = Seqno(0);
    pub const MAX: Seqno = Seqno(u64::MAX);

    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub const fn to_raw(&self) -> u64 {
        self.0
    }

    pub fn next(&self) -> Seqno {
        Seqno(
            self.0.checked_add(1)
                .expect("sequence number overflow")
        )
    }

    pub fn saturating_next(&self) -> Seqno {
        Seqno(self.0.saturating_add(1))
    }

    pub fn prev(&self) -> Option<Seqno> {
        self.checked_minus(1)
    }

    pub fn checked_minus(&self, other: u64) -> Option<Seqno> {
        self.0.checked_sub(other).map(Seqno)
    }

    /// iterator over all seqnos from `self` (inclusive) to `other` (exclusive)
    pub fn to(&self, other: Seqno) -> impl Iterator<Item = Seqno> {
        (self.0..other.0).map(Seqno)
    }

    /// iterator over all seqnos from `self` to `other`, both inclusive
    pub fn to_inclusive(&self, other: Seqno) -> impl Iterator<Item = Seqno> {
        (self.0..=other.0).map(Seqno)
    }
}

impl From<u64> for Seqno {
    fn from(value: u64) -> Self {
        Seqno(value)
    }
}

impl Add<u64> for Seqno {
    type Output = Seqno;

    fn add(self, rhs: u64) -> Self::Output {
        Seqno(
            self.0.checked_add(rhs)
                .expect("sequence number overflow")
        )
    }
}

impl AddAssign<u64> for Seqno {
    fn add_assign(&mut self, rhs: u64) {
        *self = *self + rhs;
    }
}

/// NB: subtraction returns `None` rather than panicking, since callers typically compute window
///      boundaries that may fall below zero
impl Sub<u64> for Seqno {
    type Output = Option<Seqno>;

    fn sub(self, rhs: u64) -> Self::Output {
        self.checked_minus(rhs)
    }
}

/// number of seqnos between two seqnos, i.e. `high - low` for `low <= high`
impl Sub<Seqno> for Seqno {
    type Output = u64;

    fn sub(self, rhs: Seqno) -> Self::Output {
        self.0.checked_sub(rhs.0)
            .expect("subtracting a bigger sequence number from a smaller one")
    }
}
