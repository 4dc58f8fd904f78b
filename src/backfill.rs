use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate};

use crate::domain::{DateRange, MonthKey};

/// Days a daily job reprocesses: `lookback_days` days ending yesterday, oldest first.
/// Today is never included.
pub fn compute_lookback_dates(today: NaiveDate, lookback_days: u32) -> Vec<NaiveDate> {
  let lookback_days = i64::from(lookback_days.clamp(1, 365));
  let yesterday = today - Duration::days(1);
  let first = yesterday - Duration::days(lookback_days - 1);

  let mut out = Vec::with_capacity(lookback_days as usize);
  for i in 0..lookback_days {
    out.push(first + Duration::days(i));
  }

  out
}

/// Whole calendar months a monthly job reprocesses: the `lookback_months` months before the
/// current one, oldest first.
pub fn compute_lookback_months(today: NaiveDate, lookback_months: u32) -> Vec<DateRange> {
  let lookback_months = lookback_months.clamp(1, 24);

  let mut month = MonthKey::from_date(today);
  let mut out = Vec::with_capacity(lookback_months as usize);
  for _ in 0..lookback_months {
    month = month.previous();
    out.push(month.range());
  }

  out.reverse();
  out
}

/// Reference window for the monthly leaderboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RankingWindow {
  pub yesterday: NaiveDate,
  pub first_of_month: NaiveDate,
  pub month: MonthKey,
}

impl RankingWindow {
  pub fn for_reference(reference: NaiveDate) -> Self {
    let yesterday = reference - Duration::days(1);
    let month = MonthKey::from_date(yesterday);
    RankingWindow {
      yesterday,
      first_of_month: month.first_day(),
      month,
    }
  }

  pub fn range(&self) -> DateRange {
    DateRange {
      start: self.first_of_month,
      end: self.yesterday,
    }
  }
}

/// Requested days with no cached record, in calendar order.
pub fn missing_dates(range: &DateRange, covered: &BTreeSet<NaiveDate>) -> Vec<NaiveDate> {
  range
    .days()
    .into_iter()
    .filter(|d| !covered.contains(d))
    .collect()
}
