use core::fmt;

use crate::config::{DEFAULT_NICE, NICE_0_WEIGHT};
use crate::error::KernelError;

/// Scheduling weight per niceness level. Each step is roughly 1.25x.
pub const WEIGHTS: [u64; 40] = [
    88716, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, //
    9548, 7620, 6100, 4904, 3906, 3121, 2501, 1991, 1586, 1277, //
    1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, //
    110, 87, 70, 56, 45, 36, 29, 23, 18, 15,
];

/// Niceness level, always within `0..=39`. Lower is more important.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Nice(u8);

impl Nice {
    pub const MIN: Nice = Nice(0);
    pub const MAX: Nice = Nice(39);
    pub const DEFAULT: Nice = Nice(DEFAULT_NICE);

    pub const fn new(value: i64) -> Option<Nice> {
        if value >= 0 && value <= Nice::MAX.0 as i64 {
            Some(Nice(value as u8))
        } else {
            None
        }
    }

    pub const fn get(self) -> u8 {
        self.0
    }

    pub const fn weight(self) -> u64 {
        WEIGHTS[self.0 as usize]
    }
}

impl Default for Nice {
    fn default() -> Self {
        Nice::DEFAULT
    }
}

impl TryFrom<i64> for Nice {
    type Error = KernelError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        Nice::new(value).ok_or(KernelError::InvalidArgument)
    }
}

impl fmt::Display for Nice {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Virtual time for `delta` units of real run time at `weight`, rounded to
/// nearest.
pub fn scaled_runtime(delta: u64, weight: u64) -> u64 {
    (delta * NICE_0_WEIGHT + weight / 2) / weight
}
