//! Scheduled cleanup of old records
//!
//! Accepts standard 5-field cron expressions, 6/7-field expressions with a
//! seconds column, the `@daily`-style shorthands, and `@every <duration>`
//! with Go-style durations (`1h30m`, `0h0m1s`, `250ms`).

use chrono::{DateTime, Local, TimeZone};
use std::str::FromStr;
use std::time::Duration;

use crate::{Result, StorageError};

const EVERY_PREFIX: &str = "@every";
const WEEKDAYS: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

#[derive(Debug, Clone)]
pub enum Schedule {
    Every(Duration),
    Cron(Box<cron::Schedule>),
}

impl FromStr for Schedule {
    type Err = StorageError;

    fn from_str(expr: &str) -> Result<Self> {
        let expr = expr.trim();

        if let Some(rest) = expr.strip_prefix(EVERY_PREFIX) {
            let every = parse_duration(rest.trim())?;
            return Ok(Self::Every(every));
        }

        let invalid = |e: String| {
            StorageError::Configuration(format!("invalid autoclean '{}': {}", expr, e))
        };

        // The cron crate wants a leading seconds column and numbers weekdays
        // from 1, so 5-field expressions are rewritten with weekday names.
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let normalized = if !expr.starts_with('@') && fields.len() == 5 {
            let weekdays = weekday_names(fields[4]).map_err(invalid)?;
            format!("0 {} {}", fields[..4].join(" "), weekdays)
        } else {
            expr.to_string()
        };

        cron::Schedule::from_str(&normalized)
            .map(|s| Self::Cron(Box::new(s)))
            .map_err(|e| invalid(e.to_string()))
    }
}

/// Rewrite a standard day-of-week field (0-7, 0 and 7 are Sunday) as names
fn weekday_names(field: &str) -> std::result::Result<String, String> {
    if field == "*" || field == "?" {
        return Ok(field.to_string());
    }

    let day = |s: &str| -> std::result::Result<usize, String> {
        s.parse::<usize>()
            .ok()
            .filter(|&d| d <= 7)
            .ok_or_else(|| format!("invalid day-of-week '{}'", s))
    };

    let mut names: Vec<String> = Vec::new();
    for item in field.split(',') {
        if item.chars().any(|c| c.is_ascii_alphabetic()) {
            names.push(item.to_string());
            continue;
        }

        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step = step
                    .parse::<usize>()
                    .ok()
                    .filter(|&s| s > 0)
                    .ok_or_else(|| format!("invalid step in '{}'", item))?;
                (range, Some(step))
            }
            None => (item, None),
        };

        let (lo, hi) = match (range, range.split_once('-')) {
            ("*", _) => (0, 6),
            (_, Some((lo, hi))) => (day(lo)?, day(hi)?),
            (_, None) if step.is_some() => (day(range)?, 6),
            (_, None) => (day(range)?, day(range)?),
        };
        if lo > hi {
            return Err(format!("invalid day-of-week range '{}'", range));
        }

        for d in (lo..=hi).step_by(step.unwrap_or(1)) {
            let name = WEEKDAYS[d % 7].to_string();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }

    Ok(names.join(","))
}

fn parse_duration(input: &str) -> Result<Duration> {
    let invalid = || StorageError::Configuration(format!("invalid duration '{}'", input));

    if input.is_empty() {
        return Err(invalid());
    }

    let mut total = Duration::ZERO;
    let mut rest = input;

    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(invalid)?;
        if digits == 0 {
            return Err(invalid());
        }
        let value: u64 = rest[..digits].parse().map_err(|_| invalid())?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = match &rest[..unit_len] {
            "ms" => Some(Duration::from_millis(value)),
            "s" => Some(Duration::from_secs(value)),
            "m" => value.checked_mul(60).map(Duration::from_secs),
            "h" => value.checked_mul(3600).map(Duration::from_secs),
            _ => return Err(invalid()),
        };
        total = unit
            .and_then(|unit| total.checked_add(unit))
            .ok_or_else(invalid)?;
        rest = &rest[unit_len..];
    }

    if total.is_zero() {
        return Err(invalid());
    }

    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_every() {
        match "@every 0h0m1s".parse::<Schedule>().unwrap() {
            Schedule::Every(d) => assert_eq!(d, Duration::from_secs(1)),
            other => panic!("unexpected schedule {:?}", other),
        }
        match "@every 1h30m".parse::<Schedule>().unwrap() {
            Schedule::Every(d) => assert_eq!(d, Duration::from_secs(5400)),
            other => panic!("unexpected schedule {:?}", other),
        }
        match "@every 250ms".parse::<Schedule>().unwrap() {
            Schedule::Every(d) => assert_eq!(d, Duration::from_millis(250)),
            other => panic!("unexpected schedule {:?}", other),
        }
    }

    #[test]
    fn test_every_rejects_garbage() {
        assert!("@every".parse::<Schedule>().is_err());
        assert!("@every 10".parse::<Schedule>().is_err());
        assert!("@every 10d".parse::<Schedule>().is_err());
        assert!("@every 0s".parse::<Schedule>().is_err());
        assert!("@every h".parse::<Schedule>().is_err());
    }

    #[test]
    fn test_five_field_cron() {
        let schedule: Schedule = "0 0 * * *".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        let delay = schedule.next_delay(&now).unwrap();
        assert_eq!(delay, Duration::from_secs(14 * 3600));
    }

    #[test]
    fn test_weekday_counts_from_sunday() {
        // 2023-01-01 is a Sunday.
        let sunday = Utc.with_ymd_and_hms(2023, 1, 1, 10, 0, 0).unwrap();
        let monday = Utc.with_ymd_and_hms(2023, 1, 2, 10, 0, 0).unwrap();

        let schedule: Schedule = "0 0 * * 1".parse().unwrap();
        assert_eq!(schedule.next_delay(&sunday), Some(Duration::from_secs(14 * 3600)));

        let schedule: Schedule = "* * * * 0".parse().unwrap();
        assert_eq!(schedule.next_delay(&sunday), Some(Duration::from_secs(60)));
        assert_eq!(
            schedule.next_delay(&monday),
            Some(Duration::from_secs(5 * 86400 + 14 * 3600))
        );

        let schedule: Schedule = "0 0 * * 7".parse().unwrap();
        assert_eq!(
            schedule.next_delay(&monday),
            Some(Duration::from_secs(5 * 86400 + 14 * 3600))
        );
    }

    #[test]
    fn test_weekday_ranges_and_steps() {
        assert_eq!(weekday_names("1-5").unwrap(), "MON,TUE,WED,THU,FRI");
        assert_eq!(weekday_names("5-7").unwrap(), "FRI,SAT,SUN");
        assert_eq!(weekday_names("*/2").unwrap(), "SUN,TUE,THU,SAT");
        assert_eq!(weekday_names("0,7,3").unwrap(), "SUN,WED");
        assert_eq!(weekday_names("MON-FRI").unwrap(), "MON-FRI");
        assert_eq!(weekday_names("*").unwrap(), "*");
        assert!(weekday_names("8").is_err());
        assert!(weekday_names("5-1").is_err());
        assert!(weekday_names("*/0").is_err());

        // Saturday 2023-01-07: next weekday run is Monday midnight.
        let saturday = Utc.with_ymd_and_hms(2023, 1, 7, 0, 0, 0).unwrap();
        let schedule: Schedule = "0 0 * * 1-5".parse().unwrap();
        assert_eq!(schedule.next_delay(&saturday), Some(Duration::from_secs(2 * 86400)));
    }

    #[test]
    fn test_every_overflow_is_config_error() {
        assert!(matches!(
            "@every 9999999999999999h".parse::<Schedule>(),
            Err(StorageError::Configuration(_))
        ));
        assert!(matches!(
            "@every 18446744073709551615s1s".parse::<Schedule>(),
            Err(StorageError::Configuration(_))
        ));
    }

    #[test]
    fn test_six_field_and_shorthand() {
        assert!("*/5 * * * * *".parse::<Schedule>().is_ok());
        let hourly: Schedule = "@hourly".parse().unwrap();
        let now = Utc.with_ymd_and_hms(2023, 1, 1, 10, 30, 0).unwrap();
        assert_eq!(hourly.next_delay(&now), Some(Duration::from_secs(1800)));
    }

    #[test]
    fn test_invalid_cron() {
        assert!(matches!(
            "not a schedule".parse::<Schedule>(),
            Err(StorageError::Configuration(_))
        ));
    }
}
