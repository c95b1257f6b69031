// 📅 Calendar Months & Reporting Periods
// Month keys ("YYYY-MM") drive overhead redistribution and monthly series.
// Periods are half-open: [start, end)

use chrono::{Datelike, Duration, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

use crate::error::MonthParseError;

// ============================================================================
// MONTH
// ============================================================================

/// A calendar month. Ordered chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Month {
    year: i32,
    month: u32,
}

impl Month {
    pub fn new(year: i32, month: u32) -> Option<Self> {
        if (1..=12).contains(&month) && NaiveDate::from_ymd_opt(year, month, 1).is_some() {
            Some(Month { year, month })
        } else {
            None
        }
    }

    /// Month containing the given date
    pub fn of(date: NaiveDate) -> Self {
        Month {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }

    pub fn first_day(&self) -> NaiveDate {
        // Constructor guarantees the first of the month exists
        NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
    }

    /// The final representable month ends on `NaiveDate::MAX`
    pub fn last_day(&self) -> NaiveDate {
        let next = self.next();
        NaiveDate::from_ymd_opt(next.year, next.month, 1)
            .and_then(|first| first.pred_opt())
            .unwrap_or(NaiveDate::MAX)
    }

    pub fn next(&self) -> Month {
        if self.month == 12 {
            Month {
                year: self.year + 1,
                month: 1,
            }
        } else {
            Month {
                year: self.year,
                month: self.month + 1,
            }
        }
    }

    pub fn previous(&self) -> Month {
        if self.month == 1 {
            Month {
                year: self.year - 1,
                month: 12,
            }
        } else {
            Month {
                year: self.year,
                month: self.month - 1,
            }
        }
    }

    /// The `count` months ending with (and including) `self`, oldest first
    pub fn trailing(&self, count: usize) -> Vec<Month> {
        let mut months = Vec::with_capacity(count);
        let mut current = *self;
        for _ in 0..count {
            months.push(current);
            current = current.previous();
        }
        months.reverse();
        months
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        Month::of(date) == *self
    }
}

impl fmt::Display for Month {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl FromStr for Month {
    type Err = MonthParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || MonthParseError(s.to_string());
        let (year, month) = s.trim().split_once('-').ok_or_else(invalid)?;
        if year.len() != 4 || month.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year.parse().map_err(|_| invalid())?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        Month::new(year, month).ok_or_else(invalid)
    }
}

impl Serialize for Month {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Month {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// PERIOD
// ============================================================================

/// Half-open date range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl Period {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Period { start, end }
    }

    /// Period covering whole months `first..=last`
    pub fn months(first: Month, last: Month) -> Self {
        Period {
            start: first.first_day(),
            end: last.next().first_day(),
        }
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date < self.end
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Month holding the last day of the period; anchors trailing series.
    /// An empty period anchors on the month of `start`.
    pub fn last_month(&self) -> Month {
        if self.is_empty() {
            Month::of(self.start)
        } else {
            Month::of(self.end - Duration::days(1))
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let month: Month = "2025-02".parse().unwrap();
        assert_eq!(month.year(), 2025);
        assert_eq!(month.month(), 2);
        assert_eq!(month.to_string(), "2025-02");

        assert!("2025-13".parse::<Month>().is_err());
        assert!("2025-2".parse::<Month>().is_err());
        assert!("202502".parse::<Month>().is_err());
        assert!("abcd-01".parse::<Month>().is_err());
    }

    #[test]
    fn test_month_boundaries() {
        let feb = Month::new(2024, 2).unwrap();
        assert_eq!(feb.first_day(), date(2024, 2, 1));
        assert_eq!(feb.last_day(), date(2024, 2, 29));

        let dec = Month::new(2025, 12).unwrap();
        assert_eq!(dec.last_day(), date(2025, 12, 31));
        assert_eq!(dec.next(), Month::new(2026, 1).unwrap());
        assert_eq!(Month::new(2026, 1).unwrap().previous(), dec);
    }

    #[test]
    fn test_trailing_months_cross_year() {
        let anchor = Month::new(2025, 2).unwrap();
        let months: Vec<String> = anchor.trailing(4).iter().map(|m| m.to_string()).collect();
        assert_eq!(months, vec!["2024-11", "2024-12", "2025-01", "2025-02"]);
        assert!(anchor.trailing(0).is_empty());
    }

    #[test]
    fn test_period_is_half_open() {
        let period = Period::new(date(2025, 1, 1), date(2025, 2, 1));
        assert!(period.contains(date(2025, 1, 1)));
        assert!(period.contains(date(2025, 1, 31)));
        assert!(!period.contains(date(2025, 2, 1)));
        assert_eq!(period.last_month(), Month::new(2025, 1).unwrap());
    }

    #[test]
    fn test_period_from_months() {
        let period = Period::months(Month::new(2025, 1).unwrap(), Month::new(2025, 3).unwrap());
        assert_eq!(period.start, date(2025, 1, 1));
        assert_eq!(period.end, date(2025, 4, 1));
    }

    #[test]
    fn test_last_day_at_calendar_edge() {
        assert_eq!(Month::new(2024, 2).unwrap().last_day(), date(2024, 2, 29));
        assert_eq!(Month::new(2024, 12).unwrap().last_day(), date(2024, 12, 31));

        let final_month = Month::of(NaiveDate::MAX);
        assert_eq!(final_month.last_day(), NaiveDate::MAX);
        assert!(final_month.contains(NaiveDate::MAX));
    }

    #[test]
    fn test_month_serde_as_string() {
        let month = Month::new(2025, 7).unwrap();
        let json = serde_json::to_string(&month).unwrap();
        assert_eq!(json, "\"2025-07\"");
        let back: Month = serde_json::from_str(&json).unwrap();
        assert_eq!(back, month);
    }
}
