use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveTime, Weekday};
use std::collections::BTreeSet;

/// Venue trading calendar in the venue's local (fixed-offset) time.
#[derive(Debug, Clone)]
pub struct TradingSession {
    offset: FixedOffset,
    open: NaiveTime,
    close: NaiveTime,
    trading_days: Vec<Weekday>,
    holidays: BTreeSet<NaiveDate>,
}

impl TradingSession {
    pub fn new(
        offset: FixedOffset,
        open: NaiveTime,
        close: NaiveTime,
        trading_days: Vec<Weekday>,
        holidays: BTreeSet<NaiveDate>,
    ) -> Result<Self, String> {
        if open >= close {
            return Err(format!(
                "session open ({open}) must be before session close ({close})"
            ));
        }
        if trading_days.is_empty() {
            return Err("session needs at least one trading day".to_string());
        }
        Ok(Self {
            offset,
            open,
            close,
            trading_days,
            holidays,
        })
    }

    /// NSE cash session: 09:15-15:30 IST, Monday to Friday.
    pub fn nse() -> Result<Self, String> {
        Self::new(
            parse_utc_offset("+05:30")?,
            parse_session_time("09:15")?,
            parse_session_time("15:30")?,
            vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            BTreeSet::new(),
        )
    }

    pub fn offset_seconds(&self) -> i64 {
        i64::from(self.offset.local_minus_utc())
    }

    pub fn to_local(&self, epoch_seconds: i64) -> Option<DateTime<FixedOffset>> {
        DateTime::from_timestamp(epoch_seconds, 0).map(|utc| utc.with_timezone(&self.offset))
    }

    pub fn is_trading_day(&self, date: NaiveDate) -> bool {
        self.trading_days.contains(&date.weekday()) && !self.holidays.contains(&date)
    }

    /// True when a bar closing at `period_end` covers trading time:
    /// a trading day with `open < period_end <= close` in local time.
    pub fn contains_period_end(&self, period_end: i64) -> bool {
        let Some(local) = self.to_local(period_end) else {
            return false;
        };
        let time = local.time();
        self.is_trading_day(local.date_naive()) && time > self.open && time <= self.close
    }

    /// True while the market is open (`open <= now <= close` on a trading day).
    pub fn is_open_at(&self, epoch_seconds: i64) -> bool {
        let Some(local) = self.to_local(epoch_seconds) else {
            return false;
        };
        let time = local.time();
        self.is_trading_day(local.date_naive()) && time >= self.open && time <= self.close
    }
}

pub fn parse_utc_offset(value: &str) -> Result<FixedOffset, String> {
    let trimmed = value.trim();
    let (sign, rest) = match trimmed.chars().next() {
        Some('+') => (1, &trimmed[1..]),
        Some('-') => (-1, &trimmed[1..]),
        _ => return Err(format!("utc offset must start with + or -: {value}")),
    };
    let (hours, minutes) = rest
        .split_once(':')
        .ok_or_else(|| format!("utc offset must look like +HH:MM: {value}"))?;
    let hours: i32 = hours
        .parse()
        .map_err(|_| format!("invalid utc offset hours: {value}"))?;
    let minutes: i32 = minutes
        .parse()
        .map_err(|_| format!("invalid utc offset minutes: {value}"))?;
    if !(0..60).contains(&minutes) {
        return Err(format!("invalid utc offset minutes: {value}"));
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
        .ok_or_else(|| format!("utc offset out of range: {value}"))
}

pub fn parse_weekday(value: &str) -> Result<Weekday, String> {
    value
        .trim()
        .parse::<Weekday>()
        .map_err(|_| format!("invalid weekday: {value}"))
}

pub fn parse_session_time(value: &str) -> Result<NaiveTime, String> {
    NaiveTime::parse_from_str(value.trim(), "%H:%M")
        .map_err(|err| format!("invalid session time '{value}' (expected HH:MM): {err}"))
}

/// Floors `epoch_seconds` to a multiple of `step_seconds` in local time.
pub fn floor_to_period(epoch_seconds: i64, step_seconds: i64, offset_seconds: i64) -> i64 {
    let local = epoch_seconds + offset_seconds;
    local - local.rem_euclid(step_seconds) - offset_seconds
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BoundaryAction {
    /// Outside the grace window after the latest boundary.
    Idle,
    AlreadyHandled { period_end: i64 },
    Persist { period_end: i64 },
    /// Boundary outside trading hours: reset without writing.
    Skip { period_end: i64 },
}

pub fn decide_boundary(
    now: i64,
    step_seconds: i64,
    grace_seconds: i64,
    last_handled: Option<i64>,
    session: &TradingSession,
) -> BoundaryAction {
    let period_end = floor_to_period(now, step_seconds, session.offset_seconds());
    if now - period_end >= grace_seconds {
        return BoundaryAction::Idle;
    }
    if last_handled.is_some_and(|last| last >= period_end) {
        return BoundaryAction::AlreadyHandled { period_end };
    }
    if session.contains_period_end(period_end) {
        BoundaryAction::Persist { period_end }
    } else {
        BoundaryAction::Skip { period_end }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    // 2026-10-15 is a Thursday; IST = UTC+05:30.
    fn ist(h: u32, m: u32, s: u32) -> i64 {
        let utc_minutes = (h * 60 + m) as i64 - 330;
        Utc.with_ymd_and_hms(2026, 10, 15, 0, 0, s).unwrap().timestamp() + utc_minutes * 60
    }

    #[test]
    fn floors_in_local_time() {
        let session = TradingSession::nse().expect("nse session");
        let now = ist(9, 44, 59);
        assert_eq!(floor_to_period(now, 900, session.offset_seconds()), ist(9, 30, 0));
        // Hourly bars align to the local hour, not the UTC hour.
        assert_eq!(floor_to_period(ist(10, 20, 0), 3600, session.offset_seconds()), ist(10, 0, 0));
    }

    #[test]
    fn persists_inside_session_within_grace() {
        let session = TradingSession::nse().expect("nse session");
        let action = decide_boundary(ist(9, 45, 3), 900, 10, None, &session);
        assert_eq!(action, BoundaryAction::Persist { period_end: ist(9, 45, 0) });
    }

    #[test]
    fn second_wake_in_same_window_is_already_handled() {
        let session = TradingSession::nse().expect("nse session");
        let end = ist(9, 45, 0);
        let action = decide_boundary(ist(9, 45, 8), 900, 10, Some(end), &session);
        assert_eq!(action, BoundaryAction::AlreadyHandled { period_end: end });
    }

    #[test]
    fn idle_after_grace_window() {
        let session = TradingSession::nse().expect("nse session");
        assert_eq!(
            decide_boundary(ist(9, 45, 10), 900, 10, None, &session),
            BoundaryAction::Idle
        );
    }

    #[test]
    fn boundaries_outside_session_are_skipped() {
        let session = TradingSession::nse().expect("nse session");
        // Session open itself closes a pre-market window.
        assert_eq!(
            decide_boundary(ist(9, 15, 1), 900, 10, None, &session),
            BoundaryAction::Skip { period_end: ist(9, 15, 0) }
        );
        assert_eq!(
            decide_boundary(ist(15, 30, 2), 900, 10, None, &session),
            BoundaryAction::Persist { period_end: ist(15, 30, 0) }
        );
        assert_eq!(
            decide_boundary(ist(15, 45, 2), 900, 10, None, &session),
            BoundaryAction::Skip { period_end: ist(15, 45, 0) }
        );
    }

    #[test]
    fn weekends_and_holidays_are_not_trading_days() {
        let mut holidays = BTreeSet::new();
        holidays.insert(NaiveDate::from_ymd_opt(2026, 10, 15).unwrap());
        let session = TradingSession::new(
            parse_utc_offset("+05:30").unwrap(),
            parse_session_time("09:15").unwrap(),
            parse_session_time("15:30").unwrap(),
            vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
            holidays,
        )
        .unwrap();
        assert!(!session.contains_period_end(ist(10, 0, 0)));

        let saturday = ist(10, 0, 0) + 2 * 86_400;
        assert!(!TradingSession::nse().expect("nse session").contains_period_end(saturday));
        assert!(!TradingSession::nse().expect("nse session").is_open_at(saturday));
    }

    #[test]
    fn parses_offsets_and_weekdays() {
        assert_eq!(parse_utc_offset("+05:30").unwrap().local_minus_utc(), 19_800);
        assert_eq!(parse_utc_offset("-04:00").unwrap().local_minus_utc(), -14_400);
        assert!(parse_utc_offset("05:30").is_err());
        assert!(parse_utc_offset("+05:75").is_err());
        assert_eq!(parse_weekday("mon").unwrap(), Weekday::Mon);
        assert!(parse_weekday("someday").is_err());
    }
}
