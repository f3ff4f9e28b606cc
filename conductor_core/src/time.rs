use std::{fmt::Display, time::Duration};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

pub const NANOS_PER_SECOND: i64 = 1_000_000_000;

/// Logical time, a fixed-point count of nanoseconds.
///
/// [`Time::MAX`] and [`Time::MIN`] act as positive and negative infinity for
/// the time protocol; all arithmetic saturates rather than wrapping.
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct Time(i64);

impl Time {
    pub const ZERO: Self = Self(0);
    pub const MAX: Self = Self(i64::MAX);
    pub const MIN: Self = Self(i64::MIN);
    /// The smallest representable step.
    pub const EPSILON: Self = Self(1);

    pub const fn from_nanos(nanos: i64) -> Self {
        Self(nanos)
    }

    pub const fn as_nanos(self) -> i64 {
        self.0
    }

    /// Convert from seconds, saturating outside the representable range.
    pub fn from_seconds(seconds: f64) -> Self {
        let nanos = seconds * NANOS_PER_SECOND as f64;
        if nanos >= i64::MAX as f64 {
            Self::MAX
        } else if nanos <= i64::MIN as f64 {
            Self::MIN
        } else {
            Self(nanos as i64)
        }
    }

    pub fn as_seconds(self) -> f64 {
        self.0 as f64 / NANOS_PER_SECOND as f64
    }

    pub const fn saturating_add(self, rhs: Self) -> Self {
        Self(self.0.saturating_add(rhs.0))
    }

    pub const fn saturating_sub(self, rhs: Self) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }

    /// Round up onto a period grid anchored at `offset`.
    ///
    /// Grid points are `offset + k * period` for non-negative `k`; the
    /// infinities and non-positive periods pass through unchanged.
    pub fn ceil_to_grid(self, period: Time, offset: Time) -> Self {
        if period.0 <= 0 || self == Self::MAX || self == Self::MIN {
            return self;
        }
        let rel = self.0 as i128 - offset.0 as i128;
        if rel <= 0 {
            return offset;
        }
        let period = period.0 as i128;
        let steps = (rel + period - 1) / period;
        let grid = offset.0 as i128 + steps * period;
        if grid >= i64::MAX as i128 {
            Self::MAX
        } else {
            Self(grid as i64)
        }
    }
}

impl std::ops::Add for Time {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self.saturating_add(rhs)
    }
}

impl std::ops::Sub for Time {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self::Output {
        self.saturating_sub(rhs)
    }
}

impl From<Duration> for Time {
    fn from(duration: Duration) -> Self {
        let nanos = duration.as_nanos();
        if nanos >= i64::MAX as u128 {
            Self::MAX
        } else {
            Self(nanos as i64)
        }
    }
}

impl TryFrom<Time> for Duration {
    type Error = &'static str;

    fn try_from(time: Time) -> Result<Self, Self::Error> {
        if time.0 < 0 {
            Err("negative time has no Duration representation")
        } else {
            Ok(Duration::from_nanos(time.0 as u64))
        }
    }
}

impl Display for Time {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::MAX => write!(f, "+inf"),
            Self::MIN => write!(f, "-inf"),
            _ => write!(f, "{}s", self.as_seconds()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saturating_arithmetic() {
        assert_eq!(Time::MAX + Time::EPSILON, Time::MAX);
        assert_eq!(Time::MIN - Time::EPSILON, Time::MIN);
        assert_eq!(
            Time::from_seconds(1.0) + Time::from_seconds(0.5),
            Time::from_seconds(1.5)
        );
    }

    #[test]
    fn grid_rounding() {
        let period = Time::from_seconds(1.0);
        assert_eq!(
            Time::from_seconds(0.25).ceil_to_grid(period, Time::ZERO),
            Time::from_seconds(1.0)
        );
        assert_eq!(
            Time::from_seconds(1.0).ceil_to_grid(period, Time::ZERO),
            Time::from_seconds(1.0)
        );
        // An offset anchors the grid away from zero.
        let offset = Time::from_seconds(0.5);
        assert_eq!(
            Time::from_seconds(1.6).ceil_to_grid(period, offset),
            Time::from_seconds(2.5)
        );
        // Times at or below the offset land on the offset itself.
        assert_eq!(Time::ZERO.ceil_to_grid(period, offset), offset);
        // Infinities and a zero period pass through.
        assert_eq!(Time::MAX.ceil_to_grid(period, Time::ZERO), Time::MAX);
        assert_eq!(
            Time::from_seconds(0.25).ceil_to_grid(Time::ZERO, Time::ZERO),
            Time::from_seconds(0.25)
        );
    }
}
