use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;
use thiserror::Error;

use crate::model::{Ms, Span};

/// Source of "now". Injected so every time-dependent rule is testable with fixed instants.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> Ms;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Ms {
        Utc::now().timestamp_millis()
    }
}

/// Clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now: Ms) -> Self {
        Self {
            now: AtomicI64::new(now),
        }
    }

    pub fn set(&self, now: Ms) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Ms) {
        self.now.fetch_add(by, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Ms {
        self.now.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ZoneError {
    #[error("unknown time zone: {0}")]
    UnknownZone(String),
}

/// The organisation's wall clock. All minute-of-day fields are interpreted here
/// and nowhere else; the engine only ever sees absolute instants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrgZone {
    tz: Tz,
}

impl Default for OrgZone {
    fn default() -> Self {
        Self::utc()
    }
}

impl OrgZone {
    pub fn new(tz: Tz) -> Self {
        Self { tz }
    }

    pub fn utc() -> Self {
        Self { tz: Tz::UTC }
    }

    pub fn parse(name: &str) -> Result<Self, ZoneError> {
        name.trim()
            .parse::<Tz>()
            .map(Self::new)
            .map_err(|_| ZoneError::UnknownZone(name.to_string()))
    }

    pub fn name(&self) -> &'static str {
        self.tz.name()
    }

    /// Instant of `minutes` after local midnight on `date`. `1440` is the next midnight.
    ///
    /// A wall time inside a spring-forward gap resolves to the first valid
    /// minute after it; an ambiguous one resolves to the earlier instant.
    ///
    /// Saturates at the end of chrono's calendar instead of overflowing. Callers
    /// that take dates from outside check them with [`OrgZone::day_in_range`].
    pub fn wall_to_ms(&self, date: NaiveDate, minutes: u32) -> Ms {
        let local = date
            .and_time(chrono::NaiveTime::MIN)
            .checked_add_signed(Duration::minutes(i64::from(minutes)))
            .unwrap_or(NaiveDateTime::MAX);
        self.resolve_local(local)
    }

    fn resolve_local(&self, local: NaiveDateTime) -> Ms {
        // Nowhere near a bookable instant; keep the zone's offset math away from the calendar edges.
        if !(1900..=2300).contains(&local.year()) {
            return local.and_utc().timestamp_millis();
        }
        // Gaps are at most a few hours wide in practice.
        for shift in 0..=(24 * 60) {
            let Some(candidate) = local.checked_add_signed(Duration::minutes(shift)) else {
                break;
            };
            if let Some(dt) = self.tz.from_local_datetime(&candidate).earliest() {
                return dt.timestamp_millis();
            }
        }
        local.and_utc().timestamp_millis()
    }

    /// Whether the whole local day of `date` lies within `[min, max]`.
    pub fn day_in_range(&self, date: NaiveDate, min: Ms, max: Ms) -> bool {
        let span = self.day_span(date);
        span.start >= min && span.end <= max
    }

    /// `[local midnight, next local midnight)` for `date`.
    pub fn day_span(&self, date: NaiveDate) -> Span {
        let start = self.wall_to_ms(date, 0);
        let end = match date.succ_opt() {
            Some(next) => self.wall_to_ms(next, 0),
            None => start.saturating_add(24 * 60 * 60_000),
        };
        Span::new(start, end)
    }

    /// Local calendar date containing instant `t`.
    pub fn date_of(&self, t: Ms) -> NaiveDate {
        DateTime::from_timestamp_millis(t)
            .unwrap_or_default()
            .with_timezone(&self.tz)
            .date_naive()
    }

    /// 0 = Sunday … 6 = Saturday.
    pub fn weekday(date: NaiveDate) -> u8 {
        date.weekday().num_days_from_sunday() as u8
    }
}
