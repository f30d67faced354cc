//! Cron expression parsing and evaluation.
//!
//! Standard 5-field Vixie expressions: minute, hour, day-of-month,
//! month, day-of-week. Matching is minute-quantized. Day-of-month and
//! day-of-week combine with OR when both are restricted, AND
//! otherwise.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};
use tracing::warn;

use crate::error::{SchedulerError, SchedulerResult};

/// Upper bound on the next-run search: one year of minutes.
const MAX_SEARCH_MINUTES: i64 = 366 * 24 * 60;

/// Month name tokens accepted in the month field.
const MONTH_NAMES: [(&str, u32); 12] = [
    ("jan", 1),
    ("feb", 2),
    ("mar", 3),
    ("apr", 4),
    ("may", 5),
    ("jun", 6),
    ("jul", 7),
    ("aug", 8),
    ("sep", 9),
    ("oct", 10),
    ("nov", 11),
    ("dec", 12),
];

/// Weekday name tokens accepted in the day-of-week field (0 = Sunday).
const WEEKDAY_NAMES: [(&str, u32); 7] = [
    ("sun", 0),
    ("mon", 1),
    ("tue", 2),
    ("wed", 3),
    ("thu", 4),
    ("fri", 5),
    ("sat", 6),
];

/// One parsed cron field.
#[derive(Debug, Clone, PartialEq, Eq)]
struct CronField {
    values: BTreeSet<u32>,
    wildcard: bool,
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        self.wildcard || self.values.contains(&value)
    }
}

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

impl CronExpr {
    /// Parse a 5-field cron expression.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidCron`] on any malformed field.
    pub fn parse(expr: &str) -> SchedulerResult<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(SchedulerError::InvalidCron {
                expr: expr.to_string(),
                reason: format!("expected 5 fields, got {}", fields.len()),
            });
        }

        let invalid = |reason: String| SchedulerError::InvalidCron {
            expr: expr.to_string(),
            reason,
        };

        Ok(Self {
            minute: parse_field(fields[0], 0, 59, &[]).map_err(invalid)?,
            hour: parse_field(fields[1], 0, 23, &[]).map_err(invalid)?,
            day: parse_field(fields[2], 1, 31, &[]).map_err(invalid)?,
            month: parse_field(fields[3], 1, 12, &MONTH_NAMES).map_err(invalid)?,
            weekday: parse_field(fields[4], 0, 6, &WEEKDAY_NAMES).map_err(invalid)?,
        })
    }

    /// Whether the expression matches the given instant (minute
    /// precision; seconds are ignored).
    #[must_use]
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        if !self.minute.matches(at.minute())
            || !self.hour.matches(at.hour())
            || !self.month.matches(at.month())
        {
            return false;
        }

        let day_matches = self.day.matches(at.day());
        let weekday_matches = self.weekday.matches(at.weekday().num_days_from_sunday());

        // Vixie rule: when both day fields are restricted, either one
        // matching is enough.
        if !self.day.wildcard && !self.weekday.wildcard {
            day_matches || weekday_matches
        } else {
            day_matches && weekday_matches
        }
    }

    /// The next matching instant strictly after `after`, if any exists
    /// within one year.
    #[must_use]
    pub fn next_run_time(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut current = after
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or(after)
            + Duration::minutes(1);

        for _ in 0..MAX_SEARCH_MINUTES {
            if self.matches(current) {
                return Some(current);
            }
            current += Duration::minutes(1);
        }
        None
    }
}

fn parse_value(token: &str, names: &[(&str, u32)]) -> Result<u32, String> {
    let token = token.trim().to_ascii_lowercase();

    if let Some((_, value)) = names.iter().find(|(name, _)| *name == token) {
        return Ok(*value);
    }

    token
        .parse::<u32>()
        .map_err(|_| format!("invalid value: {token}"))
}

fn parse_field(
    field: &str,
    min: u32,
    max: u32,
    names: &[(&str, u32)],
) -> Result<CronField, String> {
    if field == "*" {
        return Ok(CronField {
            values: (min..=max).collect(),
            wildcard: true,
        });
    }

    let mut values = BTreeSet::new();

    for part in field.split(',') {
        let part = part.trim();

        if let Some((range_part, step_str)) = part.split_once('/') {
            let step = step_str
                .parse::<u32>()
                .map_err(|_| format!("invalid step: {step_str}"))?;
            if step == 0 {
                return Err("step must be positive".to_string());
            }

            let (start, end) = if range_part == "*" {
                (min, max)
            } else if let Some((start_str, end_str)) = range_part.split_once('-') {
                (parse_value(start_str, names)?, parse_value(end_str, names)?)
            } else {
                let start = parse_value(range_part, names)?;
                (start, start)
            };

            let mut value = start;
            while value <= end {
                if (min..=max).contains(&value) {
                    values.insert(value);
                }
                match value.checked_add(step) {
                    Some(next) => value = next,
                    None => break,
                }
            }
        } else if let Some((start_str, end_str)) = part.split_once('-') {
            let start = parse_value(start_str, names)?;
            let end = parse_value(end_str, names)?;
            for value in start..=end {
                if (min..=max).contains(&value) {
                    values.insert(value);
                }
            }
        } else {
            let value = parse_value(part, names)?;
            if (min..=max).contains(&value) {
                values.insert(value);
            }
        }
    }

    if values.is_empty() {
        return Err(format!("no valid values in field: {field}"));
    }

    Ok(CronField {
        values,
        wildcard: false,
    })
}

/// Cron parser with a FIFO-bounded expression cache.
///
/// Parsing is cheap but the scheduler evaluates every enabled task's
/// expression on every tick, so parsed expressions are cached up to a
/// fixed size with oldest-first eviction.
#[derive(Debug)]
pub struct CronParser {
    cache: Mutex<ParserCache>,
    cache_size: usize,
}

#[derive(Debug, Default)]
struct ParserCache {
    entries: HashMap<String, Arc<CronExpr>>,
    order: VecDeque<String>,
}

impl CronParser {
    /// Create a parser with the default cache size.
    #[must_use]
    pub fn new() -> Self {
        Self::with_cache_size(1000)
    }

    /// Create a parser with an explicit cache size.
    #[must_use]
    pub fn with_cache_size(cache_size: usize) -> Self {
        Self {
            cache: Mutex::new(ParserCache::default()),
            cache_size: cache_size.max(1),
        }
    }

    /// Parse an expression, consulting the cache first.
    ///
    /// # Errors
    ///
    /// Returns [`SchedulerError::InvalidCron`] on malformed input.
    pub fn parse(&self, expr: &str) -> SchedulerResult<Arc<CronExpr>> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(parsed) = cache.entries.get(expr) {
                return Ok(Arc::clone(parsed));
            }
        }

        let parsed = Arc::new(CronExpr::parse(expr)?);

        if let Ok(mut cache) = self.cache.lock() {
            if cache.entries.len() >= self.cache_size {
                if let Some(oldest) = cache.order.pop_front() {
                    cache.entries.remove(&oldest);
                }
            }
            cache.entries.insert(expr.to_string(), Arc::clone(&parsed));
            cache.order.push_back(expr.to_string());
        }

        Ok(parsed)
    }

    /// Whether the instant matches the expression. Malformed
    /// expressions never match (logged).
    #[must_use]
    pub fn matches(&self, expr: &str, at: DateTime<Utc>) -> bool {
        match self.parse(expr) {
            Ok(parsed) => parsed.matches(at),
            Err(error) => {
                warn!(%error, "Cron match against invalid expression");
                false
            }
        }
    }

    /// Next matching instant after `after`, or `None` for malformed
    /// expressions and expressions with no match within a year.
    #[must_use]
    pub fn next_run_time(&self, expr: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self.parse(expr) {
            Ok(parsed) => parsed.next_run_time(after),
            Err(error) => {
                warn!(%error, "Cannot compute next run for invalid expression");
                None
            }
        }
    }

    /// Whether the expression parses.
    #[must_use]
    pub fn validate(&self, expr: &str) -> bool {
        self.parse(expr).is_ok()
    }
}

impl Default for CronParser {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
    }

    #[test]
    fn test_parse_rejects_wrong_field_count() {
        assert!(CronExpr::parse("* * * *").is_err());
        assert!(CronExpr::parse("* * * * * *").is_err());
        assert!(CronExpr::parse("").is_err());
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(CronExpr::parse("x * * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("70 * * * *").is_err());
    }

    #[test]
    fn test_wildcard_matches_everything() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert!(expr.matches(at(2024, 1, 1, 0, 0)));
        assert!(expr.matches(at(2024, 12, 31, 23, 59)));
    }

    #[test]
    fn test_step_expression() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        assert!(expr.matches(at(2024, 1, 1, 0, 0)));
        assert!(expr.matches(at(2024, 1, 1, 0, 55)));
        assert!(!expr.matches(at(2024, 1, 1, 0, 3)));
    }

    #[test]
    fn test_range_with_step() {
        let expr = CronExpr::parse("0-30/10 * * * *").unwrap();
        for minute in [0u32, 10, 20, 30] {
            assert!(expr.matches(at(2024, 1, 1, 12, minute)));
        }
        assert!(!expr.matches(at(2024, 1, 1, 12, 40)));
    }

    #[test]
    fn test_names_accepted() {
        let expr = CronExpr::parse("0 0 1 jan *").unwrap();
        assert!(expr.matches(at(2024, 1, 1, 0, 0)));
        assert!(!expr.matches(at(2024, 2, 1, 0, 0)));

        let expr = CronExpr::parse("0 9 * * mon-fri").unwrap();
        // 2024-01-01 is a Monday.
        assert!(expr.matches(at(2024, 1, 1, 9, 0)));
        // 2024-01-06 is a Saturday.
        assert!(!expr.matches(at(2024, 1, 6, 9, 0)));
    }

    #[test]
    fn test_day_weekday_or_rule() {
        // Both restricted: day 15 OR Sunday.
        let expr = CronExpr::parse("0 0 15 * 0").unwrap();
        // 2024-01-15 is a Monday: matches via day-of-month.
        assert!(expr.matches(at(2024, 1, 15, 0, 0)));
        // 2024-01-07 is a Sunday: matches via weekday.
        assert!(expr.matches(at(2024, 1, 7, 0, 0)));
        // 2024-01-08 is a Monday, day 8: neither.
        assert!(!expr.matches(at(2024, 1, 8, 0, 0)));

        // Only weekday restricted: AND semantics.
        let expr = CronExpr::parse("0 0 * * 0").unwrap();
        assert!(expr.matches(at(2024, 1, 7, 0, 0)));
        assert!(!expr.matches(at(2024, 1, 8, 0, 0)));
    }

    #[test]
    fn test_next_run_every_five_minutes() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        let next = expr.next_run_time(at(2024, 1, 1, 0, 2)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 0, 5));
    }

    #[test]
    fn test_next_run_weekly() {
        // Sunday 03:00; 2024-01-01 is a Monday.
        let expr = CronExpr::parse("0 3 * * 0").unwrap();
        let next = expr.next_run_time(at(2024, 1, 1, 0, 0)).unwrap();
        assert_eq!(next, at(2024, 1, 7, 3, 0));
    }

    #[test]
    fn test_next_run_is_strictly_after() {
        let expr = CronExpr::parse("*/5 * * * *").unwrap();
        // Exactly on a match: next run is the following slot.
        let next = expr.next_run_time(at(2024, 1, 1, 0, 5)).unwrap();
        assert_eq!(next, at(2024, 1, 1, 0, 10));
    }

    #[test]
    fn test_next_run_deterministic() {
        let parser = CronParser::new();
        let after = at(2024, 3, 15, 10, 30);
        let first = parser.next_run_time("17 4 * * 2", after);
        let second = parser.next_run_time("17 4 * * 2", after);
        assert_eq!(first, second);
        assert!(first.is_some());
    }

    #[test]
    fn test_unsatisfiable_expression_returns_none() {
        // February 30th never exists.
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert!(expr.next_run_time(at(2024, 1, 1, 0, 0)).is_none());
    }

    #[test]
    fn test_parser_cache_fifo_eviction() {
        let parser = CronParser::with_cache_size(2);
        parser.parse("1 * * * *").unwrap();
        parser.parse("2 * * * *").unwrap();
        parser.parse("3 * * * *").unwrap();

        let cache = parser.cache.lock().unwrap();
        assert_eq!(cache.entries.len(), 2);
        assert!(!cache.entries.contains_key("1 * * * *"));
        assert!(cache.entries.contains_key("3 * * * *"));
    }

    #[test]
    fn test_validate() {
        let parser = CronParser::new();
        assert!(parser.validate("0 3 * * 0"));
        assert!(!parser.validate("not a cron"));
    }
}
