// Copyright 2022 TiKV Project Authors. Licensed under Apache-2.0.

use std::fmt::{self, Display, Formatter};

use serde::{Deserialize, Serialize};

/// A hybrid-logical timestamp. Total order is wall time first, logical tick
/// second. The zero value means "no timestamp".
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall: u64,
    pub logical: u32,
}

impl Timestamp {
    pub const EMPTY: Timestamp = Timestamp { wall: 0, logical: 0 };

    pub fn new(wall: u64, logical: u32) -> Timestamp {
        Timestamp { wall, logical }
    }

    pub fn is_empty(&self) -> bool {
        *self == Timestamp::EMPTY
    }

    /// Advances `self` to `other` if `other` is greater. Returns whether
    /// `self` moved.
    pub fn forward(&mut self, other: Timestamp) -> bool {
        if other > *self {
            *self = other;
            return true;
        }
        false
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.wall, self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_and_forward() {
        let mut ts = Timestamp::new(10, 0);
        assert!(Timestamp::new(9, 5) < ts);
        assert!(Timestamp::new(10, 1) > ts);

        assert!(!ts.forward(Timestamp::new(10, 0)));
        assert!(!ts.forward(Timestamp::new(3, 9)));
        assert!(ts.forward(Timestamp::new(10, 2)));
        assert_eq!(ts, Timestamp::new(10, 2));
    }

    #[test]
    fn test_empty() {
        assert!(Timestamp::EMPTY.is_empty());
        assert!(!Timestamp::new(0, 1).is_empty());
    }
}
