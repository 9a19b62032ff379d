//! Recurring rules and the pure next-run engine.
//!
//! Everything here is deterministic arithmetic over
//! `(rule, base time, completed runs, reference time)` - no IO, no clocks.
//! The worker and the dispatcher own the side effects.
//!
//! # Rhythm preservation
//!
//! Subsequent occurrences are always computed **from the prior scheduled
//! time, never from wall-clock now**. A handler that takes 100 ms does not
//! push the next occurrence 100 ms later; a host that was down for an hour
//! skips the missed occurrences (reporting them) and resumes on the original
//! grid. That is the single invariant the rest of this module serves.

use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Datelike, Days, Duration, Months, NaiveDate, NaiveTime, Utc, Weekday};
use cron::Schedule;
use serde::{Deserialize, Serialize};

/// Iteration cap for catch-up scans; a rule that cannot reach the future in
/// this many steps yields no next run.
pub const DEFAULT_MAX_ITERATIONS: usize = 1000;

// =============================================================================
// Rule types
// =============================================================================

/// Fixed-unit interval of whole seconds/minutes/hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitInterval {
    pub every: u32,
}

/// Every `every` days, optionally at fixed times of day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DayInterval {
    pub every: u32,
    #[serde(default)]
    pub at_times: Vec<NaiveTime>,
}

/// Every `every` weeks, optionally restricted to weekdays and times of day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeekInterval {
    pub every: u32,
    #[serde(default)]
    pub on_days: Vec<Weekday>,
    #[serde(default)]
    pub at_times: Vec<NaiveTime>,
}

/// Every `every` months, optionally restricted to days of month and times.
/// Days that do not exist in a given month (the 31st of February) are
/// skipped, not clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthInterval {
    pub every: u32,
    #[serde(default)]
    pub on_days_of_month: Vec<u32>,
    #[serde(default)]
    pub at_times: Vec<NaiveTime>,
}

/// A recurring rule: exactly one frequency (cron or a fixed-unit interval)
/// plus first-run and termination constraints.
///
/// The JSON form round-trips without loss; this is the payload persisted in
/// `QueuedTask::recurring_task`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecurringSpec {
    /// Fire the first occurrence immediately on dispatch.
    #[serde(default)]
    pub run_now: bool,
    /// Delay applied only before the very first occurrence.
    #[serde(default)]
    pub initial_delay: Option<StdDuration>,
    /// Anchor time for the rhythm; a past anchor preserves its grid and
    /// reports the intervening occurrences as skipped.
    #[serde(default)]
    pub specific_run_time: Option<DateTime<Utc>>,
    /// 5- or 6-field cron expression (`?` is not supported; use `*`).
    #[serde(default)]
    pub cron_interval: Option<String>,
    #[serde(default)]
    pub second_interval: Option<UnitInterval>,
    #[serde(default)]
    pub minute_interval: Option<UnitInterval>,
    #[serde(default)]
    pub hour_interval: Option<UnitInterval>,
    #[serde(default)]
    pub day_interval: Option<DayInterval>,
    #[serde(default)]
    pub week_interval: Option<WeekInterval>,
    #[serde(default)]
    pub month_interval: Option<MonthInterval>,
    /// Hard cap on the number of executions.
    #[serde(default)]
    pub max_runs: Option<i32>,
    /// Hard wall-clock cap; no occurrence fires past this instant.
    #[serde(default)]
    pub run_until: Option<DateTime<Utc>>,
}

/// Outcome of a catch-up scan: the next future occurrence (if the rule still
/// has one) and every occurrence that was skipped to get there.
#[derive(Debug, Clone, PartialEq)]
pub struct NextRunPlan {
    pub next_run: Option<DateTime<Utc>>,
    pub skipped: Vec<DateTime<Utc>>,
}

impl NextRunPlan {
    pub fn exhausted() -> Self {
        Self { next_run: None, skipped: Vec::new() }
    }

    pub fn at(t: DateTime<Utc>) -> Self {
        Self { next_run: Some(t), skipped: Vec::new() }
    }
}

/// Internal view over whichever frequency the rule carries.
enum Frequency<'a> {
    Seconds(u32),
    Minutes(u32),
    Hours(u32),
    Day(&'a DayInterval),
    Week(&'a WeekInterval),
    Month(&'a MonthInterval),
    Cron(&'a str),
}

// =============================================================================
// Construction
// =============================================================================

impl RecurringSpec {
    pub fn every_seconds(every: u32) -> Self {
        Self { second_interval: Some(UnitInterval { every }), ..Self::default() }
    }

    pub fn every_minutes(every: u32) -> Self {
        Self { minute_interval: Some(UnitInterval { every }), ..Self::default() }
    }

    pub fn every_hours(every: u32) -> Self {
        Self { hour_interval: Some(UnitInterval { every }), ..Self::default() }
    }

    pub fn every_days(every: u32) -> Self {
        Self {
            day_interval: Some(DayInterval { every, at_times: Vec::new() }),
            ..Self::default()
        }
    }

    pub fn every_weeks(every: u32) -> Self {
        Self {
            week_interval: Some(WeekInterval {
                every,
                on_days: Vec::new(),
                at_times: Vec::new(),
            }),
            ..Self::default()
        }
    }

    pub fn every_months(every: u32) -> Self {
        Self {
            month_interval: Some(MonthInterval {
                every,
                on_days_of_month: Vec::new(),
                at_times: Vec::new(),
            }),
            ..Self::default()
        }
    }

    pub fn cron(expression: impl Into<String>) -> Self {
        Self { cron_interval: Some(expression.into()), ..Self::default() }
    }

    /// Restrict day/week/month intervals to fixed times of day.
    pub fn at_times(mut self, times: Vec<NaiveTime>) -> Self {
        if let Some(day) = self.day_interval.as_mut() {
            day.at_times = times;
        } else if let Some(week) = self.week_interval.as_mut() {
            week.at_times = times;
        } else if let Some(month) = self.month_interval.as_mut() {
            month.at_times = times;
        }
        self
    }

    /// Restrict a week interval to the given weekdays.
    pub fn on_days(mut self, days: Vec<Weekday>) -> Self {
        if let Some(week) = self.week_interval.as_mut() {
            week.on_days = days;
        }
        self
    }

    /// Restrict a month interval to the given days of month (1..=31).
    pub fn on_days_of_month(mut self, days: Vec<u32>) -> Self {
        if let Some(month) = self.month_interval.as_mut() {
            month.on_days_of_month = days;
        }
        self
    }

    pub fn run_now(mut self) -> Self {
        self.run_now = true;
        self
    }

    pub fn after_delay(mut self, delay: StdDuration) -> Self {
        self.initial_delay = Some(delay);
        self
    }

    pub fn starting_at(mut self, anchor: DateTime<Utc>) -> Self {
        self.specific_run_time = Some(anchor);
        self
    }

    pub fn with_max_runs(mut self, max: i32) -> Self {
        self.max_runs = Some(max);
        self
    }

    pub fn until(mut self, limit: DateTime<Utc>) -> Self {
        self.run_until = Some(limit);
        self
    }
}

// =============================================================================
// Validation
// =============================================================================

impl RecurringSpec {
    /// Check the rule is executable. Invalid rules are rejected at dispatch;
    /// the run-time paths may assume a validated rule.
    pub fn validate(&self) -> Result<(), String> {
        let configured = [
            self.cron_interval.is_some(),
            self.second_interval.is_some(),
            self.minute_interval.is_some(),
            self.hour_interval.is_some(),
            self.day_interval.is_some(),
            self.week_interval.is_some(),
            self.month_interval.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();

        match configured {
            0 => return Err("no interval configured".into()),
            1 => {}
            n => return Err(format!("{n} intervals configured; exactly one is allowed")),
        }

        if let Some(expr) = &self.cron_interval {
            if expr.contains('?') {
                return Err("'?' is not supported in cron expressions; use '*'".into());
            }
            let normalized = normalize_cron(expr)?;
            Schedule::from_str(&normalized).map_err(|e| format!("cron parse failure: {e}"))?;
        }

        for every in [
            self.second_interval.map(|i| i.every),
            self.minute_interval.map(|i| i.every),
            self.hour_interval.map(|i| i.every),
            self.day_interval.as_ref().map(|i| i.every),
            self.week_interval.as_ref().map(|i| i.every),
            self.month_interval.as_ref().map(|i| i.every),
        ]
        .into_iter()
        .flatten()
        {
            if every == 0 {
                return Err("interval must be at least 1".into());
            }
        }

        if let Some(month) = &self.month_interval {
            if month.on_days_of_month.iter().any(|d| !(1..=31).contains(d)) {
                return Err("days of month must be within 1..=31".into());
            }
        }

        if let Some(max) = self.max_runs {
            if max < 1 {
                return Err("max runs must be at least 1".into());
            }
        }

        Ok(())
    }

    fn frequency(&self) -> Option<Frequency<'_>> {
        if let Some(expr) = &self.cron_interval {
            return Some(Frequency::Cron(expr));
        }
        if let Some(i) = self.second_interval {
            return Some(Frequency::Seconds(i.every));
        }
        if let Some(i) = self.minute_interval {
            return Some(Frequency::Minutes(i.every));
        }
        if let Some(i) = self.hour_interval {
            return Some(Frequency::Hours(i.every));
        }
        if let Some(i) = &self.day_interval {
            return Some(Frequency::Day(i));
        }
        if let Some(i) = &self.week_interval {
            return Some(Frequency::Week(i));
        }
        if let Some(i) = &self.month_interval {
            return Some(Frequency::Month(i));
        }
        None
    }
}

// =============================================================================
// Next-run arithmetic
// =============================================================================

impl RecurringSpec {
    /// One step forward from `base`. `None` when the rule is exhausted
    /// (`max_runs` reached, past `run_until`, or no interval configured).
    pub fn next_run(&self, base: DateTime<Utc>, current_run: i32) -> Option<DateTime<Utc>> {
        if let Some(max) = self.max_runs {
            if current_run >= max {
                return None;
            }
        }
        let next = self.step(base)?;
        if let Some(until) = self.run_until {
            if next > until {
                return None;
            }
        }
        Some(next)
    }

    /// Advance step-by-step from `base` until the first occurrence after
    /// `now`, recording every skipped (past) occurrence along the way.
    pub fn next_valid_run(
        &self,
        base: DateTime<Utc>,
        current_run: i32,
        now: DateTime<Utc>,
        max_iterations: usize,
    ) -> NextRunPlan {
        let mut skipped = Vec::new();
        if self.frequency().is_none() {
            return NextRunPlan::exhausted();
        }

        let mut candidate = match self.next_run(base, current_run) {
            Some(c) => c,
            None => return NextRunPlan::exhausted(),
        };
        let mut iterations = 1usize;

        while candidate <= now {
            skipped.push(candidate);
            if iterations >= max_iterations {
                return NextRunPlan { next_run: None, skipped };
            }
            // Skipped occurrences never count toward max_runs, so the run
            // counter stays fixed across the scan.
            candidate = match self.next_run(candidate, current_run) {
                Some(c) => c,
                None => return NextRunPlan { next_run: None, skipped },
            };
            iterations += 1;
        }

        NextRunPlan { next_run: Some(candidate), skipped }
    }

    /// The plan for the very first occurrence, applied at dispatch time.
    ///
    /// Precedence: `run_now`, then a `specific_run_time` anchor (a past
    /// anchor triggers a catch-up scan that preserves its rhythm), then
    /// `initial_delay`, then one plain step from now.
    pub fn initial_plan(&self, now: DateTime<Utc>) -> NextRunPlan {
        if self.run_now {
            return NextRunPlan::at(now);
        }
        if let Some(anchor) = self.specific_run_time {
            if anchor > now {
                return NextRunPlan::at(anchor);
            }
            return self.next_valid_run(anchor, 0, now, DEFAULT_MAX_ITERATIONS);
        }
        if let Some(delay) = self.initial_delay {
            let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
            return NextRunPlan::at(now + delay);
        }
        self.next_valid_run(now, 0, now, DEFAULT_MAX_ITERATIONS)
    }

    /// A coarse estimate of the spacing between occurrences, used by the
    /// adaptive lazy-resolution rule. For cron rules the estimate is the gap
    /// between the next two occurrences after `from`.
    pub fn approx_interval(&self, from: DateTime<Utc>) -> Option<Duration> {
        match self.frequency()? {
            Frequency::Seconds(n) => Some(Duration::seconds(n as i64)),
            Frequency::Minutes(n) => Some(Duration::minutes(n as i64)),
            Frequency::Hours(n) => Some(Duration::hours(n as i64)),
            Frequency::Day(i) => Some(Duration::days(i.every as i64)),
            Frequency::Week(i) => Some(Duration::weeks(i.every as i64)),
            Frequency::Month(i) => Some(Duration::days(30 * i.every as i64)),
            Frequency::Cron(expr) => {
                let schedule = Schedule::from_str(&normalize_cron(expr).ok()?).ok()?;
                let mut upcoming = schedule.after(&from);
                let first = upcoming.next()?;
                let second = upcoming.next()?;
                Some(second - first)
            }
        }
    }

    fn step(&self, base: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.frequency()? {
            Frequency::Seconds(n) => Some(base + Duration::seconds(n as i64)),
            Frequency::Minutes(n) => Some(base + Duration::minutes(n as i64)),
            Frequency::Hours(n) => Some(base + Duration::hours(n as i64)),
            Frequency::Day(interval) => next_day_slot(base, interval),
            Frequency::Week(interval) => next_week_slot(base, interval),
            Frequency::Month(interval) => next_month_slot(base, interval),
            Frequency::Cron(expr) => {
                let schedule = Schedule::from_str(&normalize_cron(expr).ok()?).ok()?;
                schedule.after(&base).next()
            }
        }
    }

    /// Human-readable summary for operators.
    pub fn describe(&self) -> String {
        let mut out = match self.frequency() {
            None => "no interval".to_string(),
            Some(Frequency::Seconds(n)) => format!("every {n} second(s)"),
            Some(Frequency::Minutes(n)) => format!("every {n} minute(s)"),
            Some(Frequency::Hours(n)) => format!("every {n} hour(s)"),
            Some(Frequency::Day(i)) => {
                let mut s = format!("every {} day(s)", i.every);
                append_times(&mut s, &i.at_times);
                s
            }
            Some(Frequency::Week(i)) => {
                let mut s = format!("every {} week(s)", i.every);
                if !i.on_days.is_empty() {
                    let days: Vec<String> = i.on_days.iter().map(|d| d.to_string()).collect();
                    s.push_str(&format!(" on {}", days.join(", ")));
                }
                append_times(&mut s, &i.at_times);
                s
            }
            Some(Frequency::Month(i)) => {
                let mut s = format!("every {} month(s)", i.every);
                if !i.on_days_of_month.is_empty() {
                    let days: Vec<String> =
                        i.on_days_of_month.iter().map(|d| d.to_string()).collect();
                    s.push_str(&format!(" on day(s) {}", days.join(", ")));
                }
                append_times(&mut s, &i.at_times);
                s
            }
            Some(Frequency::Cron(expr)) => format!("cron: {expr}"),
        };
        if self.run_now {
            out = format!("immediately, then {out}");
        }
        if let Some(max) = self.max_runs {
            out.push_str(&format!(", up to {max} run(s)"));
        }
        if let Some(until) = self.run_until {
            out.push_str(&format!(", until {}", until.to_rfc3339()));
        }
        out
    }
}

fn append_times(out: &mut String, times: &[NaiveTime]) {
    if !times.is_empty() {
        let rendered: Vec<String> = times.iter().map(|t| t.format("%H:%M").to_string()).collect();
        out.push_str(&format!(" at {}", rendered.join(", ")));
    }
}

/// Accept 5-field (minute-granular) or 6-field (second-granular) cron
/// expressions; normalize to the 6-field form the parser expects.
pub(crate) fn normalize_cron(expr: &str) -> Result<String, String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    match fields.len() {
        5 => Ok(format!("0 {}", fields.join(" "))),
        6 => Ok(fields.join(" ")),
        n => Err(format!("expected 5 or 6 cron fields, found {n}")),
    }
}

fn slot_on(date: NaiveDate, time: NaiveTime) -> DateTime<Utc> {
    date.and_time(time).and_utc()
}

fn sorted_times(times: &[NaiveTime]) -> Vec<NaiveTime> {
    let mut sorted = times.to_vec();
    sorted.sort();
    sorted
}

fn next_day_slot(base: DateTime<Utc>, interval: &DayInterval) -> Option<DateTime<Utc>> {
    if interval.at_times.is_empty() {
        return base.checked_add_days(Days::new(interval.every as u64));
    }
    let times = sorted_times(&interval.at_times);
    if let Some(&t) = times.iter().find(|&&t| t > base.time()) {
        return Some(slot_on(base.date_naive(), t));
    }
    let next_day = base.date_naive().checked_add_days(Days::new(interval.every as u64))?;
    Some(slot_on(next_day, times[0]))
}

fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}

fn next_week_slot(base: DateTime<Utc>, interval: &WeekInterval) -> Option<DateTime<Utc>> {
    let times = if interval.at_times.is_empty() {
        vec![base.time()]
    } else {
        sorted_times(&interval.at_times)
    };
    let days: HashSet<Weekday> = if interval.on_days.is_empty() {
        HashSet::from([base.weekday()])
    } else {
        interval.on_days.iter().copied().collect()
    };

    // A later slot on the same day stays on the grid.
    if days.contains(&base.weekday()) {
        if let Some(&t) = times.iter().find(|&&t| t > base.time()) {
            return Some(slot_on(base.date_naive(), t));
        }
    }

    let base_week = week_start(base.date_naive());
    let mut date = base.date_naive().succ_opt()?;
    // Cadence weeks are counted from the base's week; the scan is bounded to
    // a little over one full cadence cycle.
    for _ in 0..(7 * interval.every as usize + 7) {
        let week_offset = (week_start(date) - base_week).num_days() / 7;
        if week_offset % interval.every as i64 == 0 && days.contains(&date.weekday()) {
            return Some(slot_on(date, times[0]));
        }
        date = date.succ_opt()?;
    }
    None
}

fn next_month_slot(base: DateTime<Utc>, interval: &MonthInterval) -> Option<DateTime<Utc>> {
    let times = if interval.at_times.is_empty() {
        vec![base.time()]
    } else {
        sorted_times(&interval.at_times)
    };
    let days: Vec<u32> = if interval.on_days_of_month.is_empty() {
        vec![base.day()]
    } else {
        let mut sorted = interval.on_days_of_month.clone();
        sorted.sort_unstable();
        sorted
    };

    // Bounded scan over cadence months; 48 cycles is far beyond any gap a
    // day-of-month restriction can create.
    for cycle in 0..48u32 {
        let months = cycle * interval.every;
        let month_anchor = base.date_naive().checked_add_months(Months::new(months))?;
        for &day in &days {
            let Some(date) = NaiveDate::from_ymd_opt(month_anchor.year(), month_anchor.month(), day)
            else {
                continue;
            };
            for &t in &times {
                let candidate = slot_on(date, t);
                if candidate > base {
                    return Some(candidate);
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn t(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    // -- validation -----------------------------------------------------------

    #[test]
    fn test_validate_requires_exactly_one_interval() {
        assert!(RecurringSpec::default().validate().is_err());
        assert!(RecurringSpec::every_seconds(5).validate().is_ok());

        let mut two = RecurringSpec::every_seconds(5);
        two.minute_interval = Some(UnitInterval { every: 1 });
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_question_mark_in_cron() {
        let err = RecurringSpec::cron("* * * * ?").validate().unwrap_err();
        assert!(err.contains("'?'"));
    }

    #[test]
    fn test_validate_rejects_bad_cron_field_count() {
        assert!(RecurringSpec::cron("* * *").validate().is_err());
        assert!(RecurringSpec::cron("* * * * * * *").validate().is_err());
        assert!(RecurringSpec::cron("*/5 * * * *").validate().is_ok());
        assert!(RecurringSpec::cron("*/2 * * * * *").validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        assert!(RecurringSpec::every_seconds(0).validate().is_err());
    }

    #[test]
    fn test_validate_rejects_out_of_range_month_days() {
        let spec = RecurringSpec::every_months(1).on_days_of_month(vec![0]);
        assert!(spec.validate().is_err());
        let spec = RecurringSpec::every_months(1).on_days_of_month(vec![32]);
        assert!(spec.validate().is_err());
    }

    // -- fixed-unit stepping --------------------------------------------------

    #[test]
    fn test_second_minute_hour_steps() {
        let base = at(2024, 5, 1, 12, 0, 0);
        assert_eq!(
            RecurringSpec::every_seconds(30).next_run(base, 0),
            Some(base + Duration::seconds(30))
        );
        assert_eq!(
            RecurringSpec::every_minutes(5).next_run(base, 0),
            Some(base + Duration::minutes(5))
        );
        assert_eq!(
            RecurringSpec::every_hours(2).next_run(base, 0),
            Some(base + Duration::hours(2))
        );
    }

    #[test]
    fn test_day_interval_without_times() {
        let base = at(2024, 5, 1, 9, 30, 0);
        assert_eq!(
            RecurringSpec::every_days(3).next_run(base, 0),
            Some(at(2024, 5, 4, 9, 30, 0))
        );
    }

    #[test]
    fn test_day_interval_advances_to_next_slot_same_day() {
        let spec = RecurringSpec::every_days(1).at_times(vec![t(8, 0), t(17, 30)]);
        let base = at(2024, 5, 1, 8, 0, 0);
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 1, 17, 30, 0)));
    }

    #[test]
    fn test_day_interval_rolls_past_last_slot() {
        let spec = RecurringSpec::every_days(2).at_times(vec![t(8, 0), t(17, 30)]);
        let base = at(2024, 5, 1, 17, 30, 0);
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 3, 8, 0, 0)));
    }

    #[test]
    fn test_week_interval_respects_on_days() {
        // 2024-05-01 is a Wednesday.
        let spec = RecurringSpec::every_weeks(1)
            .on_days(vec![Weekday::Mon, Weekday::Fri])
            .at_times(vec![t(9, 0)]);
        let base = at(2024, 5, 1, 9, 0, 0);
        // Next matching day in the same week is Friday the 3rd.
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 3, 9, 0, 0)));
        // And from Friday, the following Monday.
        assert_eq!(
            spec.next_run(at(2024, 5, 3, 9, 0, 0), 0),
            Some(at(2024, 5, 6, 9, 0, 0))
        );
    }

    #[test]
    fn test_week_interval_two_week_cadence() {
        // 2024-05-06 is a Monday.
        let spec = RecurringSpec::every_weeks(2)
            .on_days(vec![Weekday::Mon])
            .at_times(vec![t(9, 0)]);
        let base = at(2024, 5, 6, 9, 0, 0);
        // Skips the Monday of the off-week.
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 20, 9, 0, 0)));
    }

    #[test]
    fn test_week_interval_without_on_days_keeps_weekday() {
        let base = at(2024, 5, 1, 10, 0, 0); // Wednesday
        let spec = RecurringSpec::every_weeks(1);
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 8, 10, 0, 0)));
    }

    #[test]
    fn test_month_interval_on_days_of_month() {
        let spec = RecurringSpec::every_months(1)
            .on_days_of_month(vec![1, 15])
            .at_times(vec![t(0, 0)]);
        let base = at(2024, 5, 1, 0, 0, 0);
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 15, 0, 0, 0)));
        assert_eq!(
            spec.next_run(at(2024, 5, 15, 0, 0, 0), 0),
            Some(at(2024, 6, 1, 0, 0, 0))
        );
    }

    #[test]
    fn test_month_interval_skips_nonexistent_days() {
        let spec = RecurringSpec::every_months(1)
            .on_days_of_month(vec![31])
            .at_times(vec![t(12, 0)]);
        // From Jan 31, February has no 31st: lands on Mar 31.
        let base = at(2024, 1, 31, 12, 0, 0);
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 3, 31, 12, 0, 0)));
    }

    // -- cron -----------------------------------------------------------------

    #[test]
    fn test_cron_five_field_is_minute_granular() {
        let spec = RecurringSpec::cron("*/5 * * * *");
        let base = at(2024, 5, 1, 12, 1, 0);
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 1, 12, 5, 0)));
    }

    #[test]
    fn test_cron_six_field_has_seconds() {
        let spec = RecurringSpec::cron("*/2 * * * * *");
        let base = at(2024, 5, 1, 12, 0, 1);
        assert_eq!(spec.next_run(base, 0), Some(at(2024, 5, 1, 12, 0, 2)));
    }

    // -- constraints ----------------------------------------------------------

    #[test]
    fn test_max_runs_stops_the_rule() {
        let spec = RecurringSpec::every_seconds(1).with_max_runs(3);
        let base = at(2024, 5, 1, 12, 0, 0);
        assert!(spec.next_run(base, 2).is_some());
        assert_eq!(spec.next_run(base, 3), None);
    }

    #[test]
    fn test_run_until_stops_the_rule() {
        let base = at(2024, 5, 1, 12, 0, 0);
        let spec = RecurringSpec::every_hours(1).until(base + Duration::minutes(30));
        assert_eq!(spec.next_run(base, 0), None);

        let spec = RecurringSpec::every_hours(1).until(base + Duration::hours(1));
        assert_eq!(spec.next_run(base, 0), Some(base + Duration::hours(1)));
    }

    // -- catch-up scans -------------------------------------------------------

    #[test]
    fn test_next_valid_run_skips_missed_occurrences() {
        let spec = RecurringSpec::every_seconds(10);
        let base = at(2024, 5, 1, 12, 0, 0);
        let now = at(2024, 5, 1, 12, 0, 35);
        let plan = spec.next_valid_run(base, 0, now, DEFAULT_MAX_ITERATIONS);
        assert_eq!(plan.next_run, Some(at(2024, 5, 1, 12, 0, 40)));
        assert_eq!(
            plan.skipped,
            vec![
                at(2024, 5, 1, 12, 0, 10),
                at(2024, 5, 1, 12, 0, 20),
                at(2024, 5, 1, 12, 0, 30),
            ]
        );
    }

    #[test]
    fn test_next_valid_run_preserves_rhythm_through_downtime() {
        // The grid stays anchored to base regardless of how much time passed.
        let spec = RecurringSpec::every_minutes(7);
        let base = at(2024, 5, 1, 0, 0, 0);
        let now = at(2024, 5, 1, 3, 0, 0);
        let plan = spec.next_valid_run(base, 0, now, DEFAULT_MAX_ITERATIONS);
        let next = plan.next_run.unwrap();
        let offset = (next - base).num_seconds();
        assert_eq!(offset % (7 * 60), 0);
        assert!(next > now);
        assert!(next - now <= Duration::minutes(7));
    }

    #[test]
    fn test_next_valid_run_gives_up_after_max_iterations() {
        let spec = RecurringSpec::every_seconds(1);
        let base = at(2024, 5, 1, 12, 0, 0);
        let now = base + Duration::seconds(10_000);
        let plan = spec.next_valid_run(base, 0, now, 100);
        assert_eq!(plan.next_run, None);
        assert_eq!(plan.skipped.len(), 100);
    }

    #[test]
    fn test_next_valid_run_respects_run_until_mid_scan() {
        let base = at(2024, 5, 1, 12, 0, 0);
        let spec = RecurringSpec::every_seconds(10).until(base + Duration::seconds(25));
        let now = base + Duration::seconds(60);
        let plan = spec.next_valid_run(base, 0, now, DEFAULT_MAX_ITERATIONS);
        assert_eq!(plan.next_run, None);
        assert_eq!(plan.skipped.len(), 2); // :10 and :20; :30 exceeds the cap
    }

    #[test]
    fn test_next_valid_run_without_interval() {
        let plan = RecurringSpec::default().next_valid_run(
            at(2024, 5, 1, 12, 0, 0),
            0,
            at(2024, 5, 1, 13, 0, 0),
            DEFAULT_MAX_ITERATIONS,
        );
        assert_eq!(plan, NextRunPlan::exhausted());
    }

    // -- initial plan ---------------------------------------------------------

    #[test]
    fn test_initial_plan_run_now_fires_immediately() {
        let now = at(2024, 5, 1, 12, 0, 0);
        let plan = RecurringSpec::every_minutes(5).run_now().initial_plan(now);
        assert_eq!(plan, NextRunPlan::at(now));
    }

    #[test]
    fn test_initial_plan_future_anchor_is_used_verbatim() {
        let now = at(2024, 5, 1, 12, 0, 0);
        let anchor = at(2024, 5, 2, 8, 0, 0);
        let plan = RecurringSpec::every_days(1).starting_at(anchor).initial_plan(now);
        assert_eq!(plan, NextRunPlan::at(anchor));
    }

    #[test]
    fn test_initial_plan_past_anchor_catches_up_and_reports_skips() {
        let now = at(2024, 5, 1, 12, 0, 0);
        let anchor = at(2024, 5, 1, 11, 0, 0);
        let plan = RecurringSpec::every_minutes(25).starting_at(anchor).initial_plan(now);
        assert_eq!(plan.next_run, Some(at(2024, 5, 1, 12, 15, 0)));
        assert_eq!(
            plan.skipped,
            vec![at(2024, 5, 1, 11, 25, 0), at(2024, 5, 1, 11, 50, 0)]
        );
    }

    #[test]
    fn test_initial_plan_applies_initial_delay_once() {
        let now = at(2024, 5, 1, 12, 0, 0);
        let plan = RecurringSpec::every_minutes(5)
            .after_delay(StdDuration::from_secs(90))
            .initial_plan(now);
        assert_eq!(plan, NextRunPlan::at(now + Duration::seconds(90)));
    }

    #[test]
    fn test_initial_plan_defaults_to_one_step_from_now() {
        let now = at(2024, 5, 1, 12, 0, 0);
        let plan = RecurringSpec::every_minutes(5).initial_plan(now);
        assert_eq!(plan, NextRunPlan::at(now + Duration::minutes(5)));
    }

    #[test]
    fn test_at_times_wins_over_anchor_time_of_day() {
        // The anchor pins the day grid; at_times supplies the times.
        let anchor = at(2024, 5, 1, 13, 45, 0);
        let spec = RecurringSpec::every_days(1).at_times(vec![t(8, 0)]).starting_at(anchor);
        let next = spec.next_run(anchor, 0).unwrap();
        assert_eq!(next, at(2024, 5, 2, 8, 0, 0));
    }

    // -- serialization --------------------------------------------------------

    #[test]
    fn test_spec_json_round_trip_is_lossless() {
        let spec = RecurringSpec::every_weeks(2)
            .on_days(vec![Weekday::Mon, Weekday::Fri])
            .at_times(vec![t(8, 0), t(17, 30)])
            .with_max_runs(12)
            .until(at(2025, 1, 1, 0, 0, 0))
            .after_delay(StdDuration::from_secs(300));
        let json = serde_json::to_string(&spec).unwrap();
        let back: RecurringSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, spec);
    }

    #[test]
    fn test_spec_deserializes_with_missing_optional_fields() {
        let back: RecurringSpec =
            serde_json::from_str(r#"{"second_interval":{"every":2}}"#).unwrap();
        assert_eq!(back, RecurringSpec::every_seconds(2));
    }

    // -- description ----------------------------------------------------------

    #[test]
    fn test_describe_mentions_rule_and_caps() {
        let spec = RecurringSpec::every_minutes(2).run_now().with_max_runs(3);
        let info = spec.describe();
        assert!(info.contains("every 2 minute(s)"));
        assert!(info.contains("immediately"));
        assert!(info.contains("up to 3 run(s)"));

        let cron = RecurringSpec::cron("*/5 * * * *").describe();
        assert!(cron.contains("cron: */5 * * * *"));
    }

    // -- lazy threshold estimate ---------------------------------------------

    #[test]
    fn test_approx_interval() {
        let now = at(2024, 5, 1, 12, 0, 0);
        assert_eq!(
            RecurringSpec::every_minutes(5).approx_interval(now),
            Some(Duration::minutes(5))
        );
        assert_eq!(
            RecurringSpec::cron("0 * * * *").approx_interval(now),
            Some(Duration::hours(1))
        );
    }
}
