//! Storage tiers and time-bucket arithmetic.
//!
//! A bucket is the half-open interval `[k * width, (k + 1) * width)` in epoch
//! seconds. Assignment depends only on a row's `created_at` and the width.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Width of an hourly bucket in seconds.
pub const HOURLY_WIDTH_SECS: i64 = 3_600;

/// Width of a daily bucket in seconds.
pub const DAILY_WIDTH_SECS: i64 = 86_400;

/// One granularity level of storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Raw,
    Hourly,
    Daily,
}

impl Tier {
    pub const ALL: [Self; 3] = [Self::Raw, Self::Hourly, Self::Daily];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }

    /// Suffix appended to a category's base table name.
    #[must_use]
    pub const fn table_suffix(self) -> &'static str {
        match self {
            Self::Raw => "",
            Self::Hourly => "_hourly",
            Self::Daily => "_daily",
        }
    }

    /// Bucket width of rows stored in this tier, `None` for raw events.
    #[must_use]
    pub const fn bucket_width(self) -> Option<i64> {
        match self {
            Self::Raw => None,
            Self::Hourly => Some(HOURLY_WIDTH_SECS),
            Self::Daily => Some(DAILY_WIDTH_SECS),
        }
    }

    /// Rollup tiers carry a `count` column; raw rows each count as one.
    #[must_use]
    pub const fn has_count(self) -> bool {
        !matches!(self, Self::Raw)
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Ok(Self::Raw),
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            other => Err(format!("unknown tier '{other}'")),
        }
    }
}

/// Start of the bucket containing `created_at`.
///
/// Uses Euclidean division so pre-epoch timestamps still floor downwards.
/// `width` must be positive.
#[must_use]
pub const fn bucket_start(created_at: i64, width: i64) -> i64 {
    created_at.div_euclid(width) * width
}

/// Latest `created_at` eligible for a rollup run at `now`.
#[must_use]
pub const fn cutoff(now: i64, width: i64) -> i64 {
    now.saturating_sub(width)
}
