//! `WORKING_HOURS` schedules for plugin instances.
//!
//! Two accepted shapes:
//! - uniform: `[["08:00", "12:00"], ["13:00", "17:30"]]`, applied every day
//! - day-keyed: `{"MON": [["08:00", "17:00"]], "SAT": []}`

use crate::error::ValidationError;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;
use time::macros::format_description;
use time::Time;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Weekday {
    Mon,
    Tue,
    Wed,
    Thu,
    Fri,
    Sat,
    Sun,
}

impl Weekday {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "MON" => Some(Self::Mon),
            "TUE" => Some(Self::Tue),
            "WED" => Some(Self::Wed),
            "THU" => Some(Self::Thu),
            "FRI" => Some(Self::Fri),
            "SAT" => Some(Self::Sat),
            "SUN" => Some(Self::Sun),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mon => "MON",
            Self::Tue => "TUE",
            Self::Wed => "WED",
            Self::Thu => "THU",
            Self::Fri => "FRI",
            Self::Sat => "SAT",
            Self::Sun => "SUN",
        }
    }
}

/// `[start, end]` in 24h `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: Time,
    pub end: Time,
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}:{:02}-{:02}:{:02}",
            self.start.hour(),
            self.start.minute(),
            self.end.hour(),
            self.end.minute()
        )
    }
}

impl Interval {
    fn parse(raw: &Value) -> Result<Self, String> {
        let pair = raw
            .as_array()
            .filter(|p| p.len() == 2)
            .ok_or_else(|| format!("expected [start, end] pair, received {raw}"))?;
        let start = parse_hour(&pair[0])?;
        let end = parse_hour(&pair[1])?;
        Ok(Self { start, end })
    }

    fn to_value(self) -> Value {
        let fmt = |t: Time| format!("{:02}:{:02}", t.hour(), t.minute());
        Value::Array(vec![Value::String(fmt(self.start)), Value::String(fmt(self.end))])
    }

    /// Whether `t` falls in the interval. An interval with `end < start` wraps past midnight.
    pub fn contains(&self, t: Time) -> bool {
        if self.start <= self.end {
            self.start <= t && t < self.end
        } else {
            t >= self.start || t < self.end
        }
    }
}

fn parse_hour(raw: &Value) -> Result<Time, String> {
    let s = raw
        .as_str()
        .ok_or_else(|| format!("expected HH:MM string, received {raw}"))?;
    Time::parse(s.trim(), format_description!("[hour]:[minute]"))
        .map_err(|_| format!("invalid hour {s:?}, expected 24h HH:MM"))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Schedule {
    Uniform(Vec<Interval>),
    Weekly(BTreeMap<Weekday, Vec<Interval>>),
}

impl Schedule {
    /// Parses and validates a raw `WORKING_HOURS` value, reporting every malformed entry.
    pub fn from_value(raw: &Value) -> Result<Self, ValidationError> {
        let mut errors = Vec::new();
        let schedule = match raw {
            Value::Array(items) => Schedule::Uniform(parse_intervals(items, None, &mut errors)),
            Value::Object(days) => {
                let mut weekly = BTreeMap::new();
                for (day, items) in days {
                    let Some(weekday) = Weekday::parse(day) else {
                        errors.push(format!("Invalid schedule day {day}"));
                        continue;
                    };
                    match items.as_array() {
                        Some(items) => {
                            weekly.insert(weekday, parse_intervals(items, Some(weekday), &mut errors));
                        }
                        None => errors.push(format!("Invalid schedule for {day}: expected a list of intervals")),
                    }
                }
                Schedule::Weekly(weekly)
            }
            other => {
                return Err(ValidationError::single(format!(
                    "Invalid schedule: expected a list of intervals or a day map, received {other}"
                )))
            }
        };
        if errors.is_empty() {
            Ok(schedule)
        } else {
            Err(ValidationError::new(errors))
        }
    }

    pub fn to_value(&self) -> Value {
        let intervals = |list: &[Interval]| Value::Array(list.iter().map(|i| i.to_value()).collect());
        match self {
            Schedule::Uniform(list) => intervals(list),
            Schedule::Weekly(days) => Value::Object(
                days.iter()
                    .map(|(day, list)| (day.as_str().to_string(), intervals(list)))
                    .collect::<Map<_, _>>(),
            ),
        }
    }

    /// Intervals active on `day`. Days missing from a weekly schedule have none.
    pub fn intervals_for(&self, day: Weekday) -> &[Interval] {
        match self {
            Schedule::Uniform(list) => list,
            Schedule::Weekly(days) => days.get(&day).map(Vec::as_slice).unwrap_or_default(),
        }
    }

    pub fn is_active(&self, day: Weekday, at: Time) -> bool {
        self.intervals_for(day).iter().any(|i| i.contains(at))
    }
}

fn parse_intervals(items: &[Value], day: Option<Weekday>, errors: &mut Vec<String>) -> Vec<Interval> {
    let mut intervals = Vec::with_capacity(items.len());
    for item in items {
        match Interval::parse(item) {
            Ok(interval) => intervals.push(interval),
            Err(e) => match day {
                Some(day) => errors.push(format!("Invalid schedule for {}: {e}", day.as_str())),
                None => errors.push(format!("Invalid schedule: {e}")),
            },
        }
    }
    intervals
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use time::macros::time;

    #[test]
    fn test_uniform_schedule() {
        let schedule = Schedule::from_value(&json!([["08:00", "12:00"], ["13:00", "17:30"]])).unwrap();
        assert!(schedule.is_active(Weekday::Sun, time!(9:15)));
        assert!(!schedule.is_active(Weekday::Mon, time!(12:30)));
        assert!(!schedule.is_active(Weekday::Mon, time!(17:30)));
        assert_eq!(schedule.to_value(), json!([["08:00", "12:00"], ["13:00", "17:30"]]));
    }

    #[test]
    fn test_weekly_schedule() {
        let schedule = Schedule::from_value(&json!({
            "mon": [["08:00", "17:00"]],
            "SAT": [["22:00", "02:00"]]
        }))
        .unwrap();
        assert!(schedule.is_active(Weekday::Mon, time!(8:00)));
        assert!(!schedule.is_active(Weekday::Tue, time!(10:00)));
        assert!(schedule.is_active(Weekday::Sat, time!(1:00)));
        assert_eq!(
            schedule.to_value(),
            json!({"MON": [["08:00", "17:00"]], "SAT": [["22:00", "02:00"]]})
        );
    }

    #[test]
    fn test_invalid_entries_are_all_reported() {
        let err = Schedule::from_value(&json!({
            "MON": [["25:00", "12:00"]],
            "FUNDAY": [],
            "TUE": [["08:00"]]
        }))
        .unwrap_err();
        assert_eq!(err.messages.len(), 3);
        assert!(err.messages.iter().any(|m| m.contains("FUNDAY")));

        assert!(Schedule::from_value(&json!([["8h", "12:00"]])).is_err());
        assert!(Schedule::from_value(&json!("always")).is_err());
    }
}
