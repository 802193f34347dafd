//! Five-resolution time window ladder.
//!
//! Every hierarchy node keeps one ladder per metric. A ladder has one list of
//! slots per resolution (second, minute, hour, day, month), newest first.
//! Slot bounds are obtained by truncating a timestamp in UTC.

use crate::error::{Error, Result};
use crate::state::quantity::AccumulatedValue;
use chrono::{DateTime, Datelike, Duration, DurationRound, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const RESOLUTION_COUNT: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    Second,
    Minute,
    Hour,
    Day,
    Month,
}

impl Resolution {
    pub const ALL: [Resolution; RESOLUTION_COUNT] = [
        Resolution::Second,
        Resolution::Minute,
        Resolution::Hour,
        Resolution::Day,
        Resolution::Month,
    ];

    /// Position in the ladder (0 = second ... 4 = month).
    pub fn index(self) -> usize {
        match self {
            Resolution::Second => 0,
            Resolution::Minute => 1,
            Resolution::Hour => 2,
            Resolution::Day => 3,
            Resolution::Month => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Resolution::Second => "second",
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
            Resolution::Month => "month",
        }
    }

    /// Fixed span in milliseconds; `None` for calendar months.
    fn fixed_span(self) -> Option<Duration> {
        match self {
            Resolution::Second => Some(Duration::seconds(1)),
            Resolution::Minute => Some(Duration::minutes(1)),
            Resolution::Hour => Some(Duration::hours(1)),
            Resolution::Day => Some(Duration::days(1)),
            Resolution::Month => None,
        }
    }

    /// Bounds `[from, to)` of the slot of this resolution containing `t`.
    pub fn bounds(self, t: i64) -> Result<SlotBounds> {
        let time = DateTime::<Utc>::from_timestamp_millis(t)
            .ok_or_else(|| Error::MalformedInput(format!("Timestamp {} out of range", t)))?;

        match self.fixed_span() {
            Some(span) => {
                let start = time.duration_trunc(span).map_err(|e| {
                    Error::MalformedInput(format!("Cannot truncate {} to {}: {}", t, self, e))
                })?;
                let from = start.timestamp_millis();
                Ok(SlotBounds::new(from, from + span.num_milliseconds()))
            }
            None => {
                let (next_year, next_month) = if time.month() == 12 {
                    (time.year() + 1, 1)
                } else {
                    (time.year(), time.month() + 1)
                };
                let from = month_start(time.year(), time.month(), t)?;
                let to = month_start(next_year, next_month, t)?;
                Ok(SlotBounds::new(from, to))
            }
        }
    }
}

fn month_start(year: i32, month: u32, t: i64) -> Result<i64> {
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp_millis())
        .ok_or_else(|| Error::MalformedInput(format!("No month boundary for {}", t)))
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for Resolution {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "second" | "s" | "0" => Ok(Resolution::Second),
            "minute" | "m" | "1" => Ok(Resolution::Minute),
            "hour" | "h" | "2" => Ok(Resolution::Hour),
            "day" | "d" | "3" => Ok(Resolution::Day),
            "month" | "4" => Ok(Resolution::Month),
            other => Err(Error::MalformedInput(format!(
                "Unknown window resolution: {}",
                other
            ))),
        }
    }
}

/// Half-open slot span `[from, to)` in ms since epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SlotBounds {
    pub from: i64,
    pub to: i64,
}

impl SlotBounds {
    pub fn new(from: i64, to: i64) -> Self {
        SlotBounds { from, to }
    }

    pub fn contains(&self, t: i64) -> bool {
        self.from <= t && t < self.to
    }

    /// A slot is sealed once processing time has moved past its end by more
    /// than the slack: no accepted usage can land in it anymore.
    pub fn is_sealed(&self, now: i64, slack_ms: i64) -> bool {
        self.to.saturating_add(slack_ms) <= now
    }
}

/// One cell of a window ladder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSlot {
    pub bounds: SlotBounds,
    pub quantity: Option<AccumulatedValue>,
    pub charge: Decimal,
}

impl WindowSlot {
    pub fn new(bounds: SlotBounds, quantity: Option<AccumulatedValue>) -> Self {
        WindowSlot {
            bounds,
            quantity,
            charge: Decimal::ZERO,
        }
    }
}

/// Slot lists for all five resolutions, each ordered newest first.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Windows {
    slots: [Vec<WindowSlot>; RESOLUTION_COUNT],
}

impl Windows {
    pub fn new() -> Self {
        Windows::default()
    }

    pub fn get(&self, resolution: Resolution) -> &[WindowSlot] {
        &self.slots[resolution.index()]
    }

    pub fn get_mut(&mut self, resolution: Resolution) -> &mut Vec<WindowSlot> {
        &mut self.slots[resolution.index()]
    }

    /// Slot starting at `from`, if present.
    pub fn slot(&self, resolution: Resolution, from: i64) -> Option<&WindowSlot> {
        self.get(resolution).iter().find(|s| s.bounds.from == from)
    }

    /// Insert keeping newest-first order.
    pub fn insert(&mut self, resolution: Resolution, slot: WindowSlot) {
        let list = self.get_mut(resolution);
        let pos = list
            .iter()
            .position(|s| s.bounds.from < slot.bounds.from)
            .unwrap_or(list.len());
        list.insert(pos, slot);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Resolution, &[WindowSlot])> {
        Resolution::ALL.into_iter().map(move |r| (r, self.get(r)))
    }
}
