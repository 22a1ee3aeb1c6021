//! In-process cron: a parsed 5-field expression and a pure next-fire
//! computation, so schedules are testable without wall-clock waits.
//!
//! Supported syntax per field: `*`, single values, ranges `a-b`, steps
//! `*/n` and `a-b/n`, comma lists. Day-of-week accepts 0-7 with 7 folding
//! to Sunday. When both day fields are restricted the vixie OR rule applies.

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("expected 5 fields (minute hour day-of-month month day-of-week), got {0}")]
    FieldCount(usize),

    #[error("invalid {field} field {spec:?}: {reason}")]
    Field {
        field: &'static str,
        spec: String,
        reason: String,
    },
}

#[derive(Clone, Debug)]
pub struct CronExpr {
    source: String,
    minutes: Vec<bool>,
    hours: Vec<bool>,
    dom: Vec<bool>,
    months: Vec<bool>,
    dow: Vec<bool>,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn parse_num(field: &'static str, spec: &str, s: &str) -> Result<u32, CronError> {
    s.parse::<u32>().map_err(|_| CronError::Field {
        field,
        spec: spec.to_string(),
        reason: format!("{s:?} is not a number"),
    })
}

/// Parse one field into a bit set over `min..=max`. For day-of-week,
/// `fold_seven` maps 7 onto Sunday (index 0).
fn parse_field(
    field: &'static str,
    spec: &str,
    min: u32,
    max: u32,
    fold_seven: bool,
) -> Result<(Vec<bool>, bool), CronError> {
    let size = if fold_seven {
        7
    } else {
        (max - min + 1) as usize
    };
    let mut bits = vec![false; size];
    let mut restricted = false;
    let err = |reason: String| CronError::Field {
        field,
        spec: spec.to_string(),
        reason,
    };

    for term in spec.split(',') {
        let (range, step) = match term.split_once('/') {
            Some((r, s)) => (r, parse_num(field, spec, s)?),
            None => (term, 1),
        };
        if step == 0 {
            return Err(err("step must be positive".into()));
        }
        let (lo, hi, is_star) = if range == "*" {
            (min, max, true)
        } else if let Some((a, b)) = range.split_once('-') {
            (
                parse_num(field, spec, a)?,
                parse_num(field, spec, b)?,
                false,
            )
        } else {
            let v = parse_num(field, spec, range)?;
            // "v/step" runs from v to the field maximum.
            if term.contains('/') {
                (v, max, false)
            } else {
                (v, v, false)
            }
        };
        if lo < min || hi > max {
            return Err(err(format!("value out of range {min}-{max}")));
        }
        if lo > hi {
            return Err(err(format!("inverted range {lo}-{hi}")));
        }
        if !is_star {
            restricted = true;
        }
        let mut v = lo;
        while v <= hi {
            let idx = if fold_seven {
                (v % 7) as usize
            } else {
                (v - min) as usize
            };
            bits[idx] = true;
            v += step;
        }
    }
    Ok((bits, restricted))
}

impl CronExpr {
    pub fn parse(s: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = s.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }
        let (minutes, _) = parse_field("minute", fields[0], 0, 59, false)?;
        let (hours, _) = parse_field("hour", fields[1], 0, 23, false)?;
        let (dom, dom_restricted) = parse_field("day-of-month", fields[2], 1, 31, false)?;
        let (months, _) = parse_field("month", fields[3], 1, 12, false)?;
        let (dow, dow_restricted) = parse_field("day-of-week", fields[4], 0, 7, true)?;
        Ok(Self {
            source: s.to_string(),
            minutes,
            hours,
            dom,
            months,
            dow,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches(&self, t: &DateTime<Utc>) -> bool {
        let dom_ok = self.dom[(t.day() - 1) as usize];
        let dow_ok = self.dow[t.weekday().num_days_from_sunday() as usize];
        match (self.dom_restricted, self.dow_restricted) {
            (false, false) => true,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            // Vixie rule: either restricted day field may match.
            (true, true) => dom_ok || dow_ok,
        }
    }

    fn first_slot_at_or_after(&self, t: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start_h = t.hour();
        let start_m = t.minute();
        for h in start_h..24 {
            if !self.hours[h as usize] {
                continue;
            }
            let m0 = if h == start_h { start_m } else { 0 };
            for m in m0..60 {
                if self.minutes[m as usize] {
                    let slot = t.date_naive().and_hms_opt(h, m, 0)?;
                    return Some(Utc.from_utc_datetime(&slot));
                }
            }
        }
        None
    }

    /// First fire time strictly after `after`. `None` only for expressions
    /// that never match a real date (e.g. Feb 30).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut t = (after + Duration::minutes(1))
            .with_second(0)?
            .with_nanosecond(0)?;
        // Five years of days bounds any satisfiable expression.
        for _ in 0..(366 * 5) {
            if self.months[(t.month() - 1) as usize]
                && self.day_matches(&t)
                && let Some(found) = self.first_slot_at_or_after(&t)
            {
                return Some(found);
            }
            let next_day = t.date_naive().succ_opt()?.and_hms_opt(0, 0, 0)?;
            t = Utc.from_utc_datetime(&next_day);
        }
        None
    }
}

impl std::str::FromStr for CronExpr {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}
