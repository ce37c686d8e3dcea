//! Lace coordinates.
//!
//! Every member of the overlay owns one cell of an unbounded 2-D grid. Cells
//! are handed out in a fixed fill order so the grid grows as a square:
//!
//! ```text
//!   1 3 6
//!   2 4 8
//!   5 7 9
//! ```
//!
//! which is the sequence (1,1), (2,1), (1,2), (2,2), (3,1), (1,3), (3,2),
//! (2,3), (3,3), ... with `x` as the row and `y` as the column. Two members
//! are peers when they share a row or a column, so a flood reaches every
//! member in at most two hops.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A cell of the lace grid. `(0, 0)` means "unassigned".
///
/// On the wire a coordinate is a two-element array `[x, y]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "(u32, u32)", into = "(u32, u32)")]
pub struct Coord {
    /// Row.
    pub x: u32,
    /// Column.
    pub y: u32,
}

impl Coord {
    /// The unassigned coordinate.
    pub const UNASSIGNED: Coord = Coord { x: 0, y: 0 };

    /// The first cell, taken by whoever founds a lace.
    pub const ORIGIN: Coord = Coord { x: 1, y: 1 };

    /// Create a coordinate.
    #[must_use]
    pub const fn new(x: u32, y: u32) -> Self {
        Self { x, y }
    }

    /// True if both components are non-zero.
    #[must_use]
    pub fn is_assigned(&self) -> bool {
        self.x != 0 && self.y != 0
    }

    /// The cell that follows this one in fill order.
    ///
    /// `(x, y) -> (x+1, 1)` when `x = y`, `(y, x)` when `x > y`, and
    /// `(y, x+1)` when `x < y`. The successor of the unassigned coordinate
    /// is therefore the origin. `None` past the last representable cell.
    #[must_use]
    pub fn next(&self) -> Option<Coord> {
        let Coord { x, y } = *self;
        match x.cmp(&y) {
            Ordering::Equal => Some(Coord::new(x.checked_add(1)?, 1)),
            Ordering::Greater => Some(Coord::new(y, x)),
            Ordering::Less => Some(Coord::new(y, x.checked_add(1)?)),
        }
    }

    /// Locality predicate: true if `other` shares a row or a column with us.
    ///
    /// An unassigned coordinate is compatible with nothing.
    #[must_use]
    pub fn is_compatible(&self, other: &Coord) -> bool {
        if !self.is_assigned() || !other.is_assigned() {
            return false;
        }
        self.x == other.x || self.y == other.y
    }

    /// One-based position in fill order; `0` for anything unassigned.
    #[must_use]
    pub fn ordinal(&self) -> u64 {
        if !self.is_assigned() {
            return 0;
        }
        let (x, y) = (u64::from(self.x), u64::from(self.y));
        let n = x.max(y);
        let shell = (n - 1) * (n - 1);
        let offset = if x == y {
            2 * (n - 1)
        } else if x == n {
            2 * (y - 1)
        } else {
            2 * (x - 1) + 1
        };
        shell + offset + 1
    }

    /// True if `self` comes strictly after `other` in fill order.
    #[must_use]
    pub fn advances(&self, other: &Coord) -> bool {
        self.ordinal() > other.ordinal()
    }
}

impl Ord for Coord {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ordinal()
            .cmp(&other.ordinal())
            .then(self.x.cmp(&other.x))
            .then(self.y.cmp(&other.y))
    }
}

impl PartialOrd for Coord {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl From<(u32, u32)> for Coord {
    fn from((x, y): (u32, u32)) -> Self {
        Self { x, y }
    }
}

impl From<Coord> for (u32, u32) {
    fn from(c: Coord) -> Self {
        (c.x, c.y)
    }
}

impl fmt::Display for Coord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x, self.y)
    }
}
