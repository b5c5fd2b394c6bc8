use std::{
    fmt,
    iter::Sum,
    ops::{Add, AddAssign, Mul, Sub, SubAssign},
    time::Duration,
};

const PS_PER_NS: u64 = 1_000;
const PS_PER_US: u64 = 1_000_000;
const PS_PER_MS: u64 = 1_000_000_000;
const PS_PER_S: u64 = 1_000_000_000_000;

/// Simulated time with picosecond resolution.
///
/// Unsigned on purpose: a keeper can never be asked to move backwards, so a
/// negative `inc()` is unrepresentable.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimTime(u64);

impl SimTime {
    pub const ZERO: SimTime = SimTime(0);
    pub const MAX: SimTime = SimTime(u64::MAX);

    pub const fn from_ps(ps: u64) -> Self {
        SimTime(ps)
    }

    pub const fn from_ns(ns: u64) -> Self {
        SimTime(ns * PS_PER_NS)
    }

    pub const fn from_us(us: u64) -> Self {
        SimTime(us * PS_PER_US)
    }

    pub const fn from_ms(ms: u64) -> Self {
        SimTime(ms * PS_PER_MS)
    }

    pub const fn from_secs(s: u64) -> Self {
        SimTime(s * PS_PER_S)
    }

    #[inline(always)]
    pub const fn as_ps(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn to_seconds(self) -> f64 {
        self.0 as f64 / PS_PER_S as f64
    }

    pub const fn checked_sub(self, rhs: SimTime) -> Option<SimTime> {
        match self.0.checked_sub(rhs.0) {
            Some(ps) => Some(SimTime(ps)),
            None => None,
        }
    }

    /// Difference clamped at zero, the usual shape of a budget computation.
    pub const fn saturating_sub(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_sub(rhs.0))
    }

    pub const fn saturating_add(self, rhs: SimTime) -> SimTime {
        SimTime(self.0.saturating_add(rhs.0))
    }

    /// Scale by a non-negative factor, rounding down to the nearest picosecond.
    pub fn mul_f64(self, factor: f64) -> SimTime {
        if factor <= 0.0 {
            return SimTime::ZERO;
        }
        SimTime((self.0 as f64 * factor) as u64)
    }
}

impl Add for SimTime {
    type Output = SimTime;

    fn add(self, rhs: SimTime) -> SimTime {
        SimTime(
            self.0
                .checked_add(rhs.0)
                .expect("overflow when adding simulated times"),
        )
    }
}

impl AddAssign for SimTime {
    fn add_assign(&mut self, rhs: SimTime) {
        *self = *self + rhs;
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    fn sub(self, rhs: SimTime) -> SimTime {
        self.checked_sub(rhs)
            .expect("overflow when subtracting simulated times")
    }
}

impl SubAssign for SimTime {
    fn sub_assign(&mut self, rhs: SimTime) {
        *self = *self - rhs;
    }
}

impl Mul<u64> for SimTime {
    type Output = SimTime;

    fn mul(self, rhs: u64) -> SimTime {
        SimTime(
            self.0
                .checked_mul(rhs)
                .expect("overflow when multiplying simulated time"),
        )
    }
}

impl Sum for SimTime {
    fn sum<I: Iterator<Item = SimTime>>(iter: I) -> SimTime {
        iter.fold(SimTime::ZERO, |acc, t| acc + t)
    }
}

impl From<Duration> for SimTime {
    fn from(d: Duration) -> Self {
        SimTime(
            d.as_secs()
                .saturating_mul(PS_PER_S)
                .saturating_add(d.subsec_nanos() as u64 * PS_PER_NS),
        )
    }
}

impl fmt::Display for SimTime {
    /// Prints in the largest unit that represents the value exactly.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ps = self.0;
        let (value, unit) = if ps == 0 {
            (0, "s")
        } else if ps % PS_PER_S == 0 {
            (ps / PS_PER_S, "s")
        } else if ps % PS_PER_MS == 0 {
            (ps / PS_PER_MS, "ms")
        } else if ps % PS_PER_US == 0 {
            (ps / PS_PER_US, "us")
        } else if ps % PS_PER_NS == 0 {
            (ps / PS_PER_NS, "ns")
        } else {
            (ps, "ps")
        };
        write!(f, "{value} {unit}")
    }
}
