//! Exchange reference data: identity, trading schedule and tick-size bands.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Errors produced while parsing exchange reference strings.
#[derive(Debug, Error)]
pub enum ExchangeParseError {
    /// A tick-size band entry was not `lower,upper,value`.
    #[error("invalid tick size table, expect <lower_bound>,<upper_bound>,<value>[;...]")]
    InvalidTickSizeTable,
    /// Tick-size bands must be sorted and non-overlapping.
    #[error("tick size bands overlap at lower bound {0}")]
    OverlappingTickSizeBands(f64),
    /// A trading/break period was not `HHMM-HHMM` or `HHMMSS-HHMMSS`.
    #[error("invalid period '{0}', expect HHMM-HHMM or HHMMSS-HHMMSS")]
    InvalidPeriod(String),
    /// A half-day entry was not a `YYYYmmdd` date.
    #[error("invalid half day '{0}', expect YYYYmmdd")]
    InvalidHalfDay(String),
}

/// One band of the tick-size table: `value` applies to prices in
/// `[lower_bound, upper_bound)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TickSizeBand {
    /// Inclusive lower price bound of the band.
    pub lower_bound: f64,
    /// Exclusive upper price bound of the band (0 = unbounded).
    pub upper_bound: f64,
    /// Tick size within the band.
    pub value: f64,
}

/// An exchange (venue) entry in the reference catalog.
///
/// Published entries are immutable; administrative edits publish a fresh
/// `Arc<Exchange>` through the catalog so readers never observe torn values.
#[derive(Debug, Clone, Default)]
pub struct Exchange {
    pub id: u16,
    pub name: String,
    pub mic: String,
    pub country: String,
    /// Offset of the exchange time zone from UTC, in seconds.
    pub utc_time_offset: i32,
    pub odd_lot_allowed: bool,
    /// Trading period in seconds since local midnight; 0 = always open.
    pub trade_start: i32,
    pub trade_end: i32,
    /// Lunch-break period in seconds since local midnight; 0 = no break.
    pub break_start: i32,
    pub break_end: i32,
    /// Early close (seconds since midnight) applied on half days.
    pub half_day: i32,
    /// Dates (YYYYmmdd) on which the half-day close applies.
    pub half_days: HashSet<i32>,
    /// Sorted, non-overlapping tick-size bands.
    pub tick_size_table: Vec<TickSizeBand>,
}

impl Exchange {
    /// Seconds since midnight in the exchange time zone.
    pub fn seconds_of_day(&self) -> i32 {
        let local = crate::utils::now_secs() + i64::from(self.utc_time_offset);
        (local.rem_euclid(86_400)) as i32
    }

    /// Current date (YYYYmmdd) in the exchange time zone.
    pub fn date(&self) -> i32 {
        let local = crate::utils::now_secs() + i64::from(self.utc_time_offset);
        match chrono::DateTime::from_timestamp(local, 0) {
            Some(dt) => dt
                .date_naive()
                .format("%Y%m%d")
                .to_string()
                .parse()
                .unwrap_or(0),
            None => 0,
        }
    }

    pub fn is_half_day(&self) -> bool {
        !self.half_days.is_empty() && self.half_days.contains(&self.date())
    }

    /// Effective close for today, honoring the half-day schedule.
    pub fn trade_end(&self) -> i32 {
        if self.is_half_day() {
            self.half_day
        } else {
            self.trade_end
        }
    }

    /// Whether the exchange is currently inside its trading period and
    /// outside its break period. Unconfigured periods always pass.
    pub fn is_in_trade_period(&self) -> bool {
        let t = self.seconds_of_day();
        (self.break_start <= 0 || t < self.break_start || t > self.break_end)
            && (self.trade_start <= 0 || (t > self.trade_start && t < self.trade_end()))
    }

    /// Tick size applying at the given reference price, from the band table.
    /// Returns 0 when no band matches.
    pub fn tick_size(&self, reference_price: f64) -> f64 {
        for band in &self.tick_size_table {
            if reference_price >= band.lower_bound
                && (band.upper_bound <= 0.0 || reference_price < band.upper_bound)
            {
                return band.value;
            }
        }
        0.0
    }

    /// Parse a tick-size table from `lower,upper,value[;...]`, validating
    /// ordering and overlap.
    pub fn parse_tick_size_table(s: &str) -> Result<Vec<TickSizeBand>, ExchangeParseError> {
        let mut table = Vec::new();
        for entry in s.split(|c| c == ';' || c == '\n') {
            let entry = entry.trim();
            if entry.is_empty() {
                continue;
            }
            let parts: Vec<_> = entry.split(',').map(str::trim).collect();
            if parts.len() != 3 {
                return Err(ExchangeParseError::InvalidTickSizeTable);
            }
            let lower_bound = parts[0]
                .parse()
                .map_err(|_| ExchangeParseError::InvalidTickSizeTable)?;
            let upper_bound = parts[1]
                .parse()
                .map_err(|_| ExchangeParseError::InvalidTickSizeTable)?;
            let value = parts[2]
                .parse()
                .map_err(|_| ExchangeParseError::InvalidTickSizeTable)?;
            table.push(TickSizeBand {
                lower_bound,
                upper_bound,
                value,
            });
        }
        table.sort_by(|a, b| a.lower_bound.total_cmp(&b.lower_bound));
        for w in table.windows(2) {
            if w[0].upper_bound > w[1].lower_bound {
                return Err(ExchangeParseError::OverlappingTickSizeBands(
                    w[1].lower_bound,
                ));
            }
        }
        Ok(table)
    }

    /// Parse an `HHMM-HHMM` or `HHMMSS-HHMMSS` period into seconds since
    /// midnight.
    pub fn parse_period(s: &str) -> Result<(i32, i32), ExchangeParseError> {
        let bad = || ExchangeParseError::InvalidPeriod(s.to_string());
        let (a, b) = s.trim().split_once('-').ok_or_else(bad)?;
        let to_secs = |t: &str| -> Result<i32, ExchangeParseError> {
            if t.len() != 4 && t.len() != 6 {
                return Err(bad());
            }
            let h: i32 = t[..2].parse().map_err(|_| bad())?;
            let m: i32 = t[2..4].parse().map_err(|_| bad())?;
            let sec: i32 = if t.len() == 6 {
                t[4..6].parse().map_err(|_| bad())?
            } else {
                0
            };
            if h >= 24 || m >= 60 || sec >= 60 {
                return Err(bad());
            }
            Ok(h * 3600 + m * 60 + sec)
        };
        let start = to_secs(a)?;
        let end = to_secs(b)?;
        if end <= start {
            return Err(bad());
        }
        Ok((start, end))
    }

    /// Parse a `;`/`,`-separated list of YYYYmmdd half days.
    pub fn parse_half_days(s: &str) -> Result<HashSet<i32>, ExchangeParseError> {
        let mut out = HashSet::new();
        for tok in s.split(|c| c == ';' || c == ',' || c == '\n') {
            let tok = tok.trim();
            if tok.is_empty() {
                continue;
            }
            if tok.len() != 8 {
                return Err(ExchangeParseError::InvalidHalfDay(tok.to_string()));
            }
            let d: i32 = tok
                .parse()
                .map_err(|_| ExchangeParseError::InvalidHalfDay(tok.to_string()))?;
            out.insert(d);
        }
        Ok(out)
    }
}
