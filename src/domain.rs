use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};

pub const SOCIAL_NETWORK: &str = "SocialNetwork";
pub const STORE: &str = "Store";

/// Customer origin tags that count as paid social referral. Matched against an order's first origin.
pub const SOCIAL_NETWORK_ORIGINS: &[&str] = &[
  "Redes Sociais",
  "Tráfego Pago",
  "Rede Social",
  "Redes Sociais / Trafego Pago",
  "Trafego Pago",
  "Redes Sociais / Trafego",
  "Redes Socias",
  "Rede Social - Eclel",
  "Rede Social - Bruna",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AccountStatus {
  Active,
  Inactive,
}

impl AccountStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      AccountStatus::Active => "ACTIVE",
      AccountStatus::Inactive => "INACTIVE",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value.trim() {
      "ACTIVE" | "active" | "Active" => Some(AccountStatus::Active),
      "INACTIVE" | "inactive" | "Inactive" => Some(AccountStatus::Inactive),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountRef {
  pub id: i64,
  pub external_id: String,
  pub name: String,
  pub nickname: Option<String>,
  /// CNPJ used by the sales API.
  pub tax_id: Option<String>,
  /// Name of the sales API credential.
  pub secret_ref: Option<String>,
  pub status: AccountStatus,
}

impl AccountRef {
  /// Tax id and secret name, when both are configured.
  pub fn sales_credentials(&self) -> Option<(&str, &str)> {
    let tax_id = self.tax_id.as_deref().map(str::trim).filter(|v| !v.is_empty())?;
    let secret = self.secret_ref.as_deref().map(str::trim).filter(|v| !v.is_empty())?;
    Some((tax_id, secret))
  }

  pub fn display_name(&self) -> &str {
    self
      .nickname
      .as_deref()
      .filter(|v| !v.trim().is_empty())
      .unwrap_or(&self.name)
  }
}

/// Inclusive calendar-day range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

impl DateRange {
  pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self> {
    if start > end {
      return Err(SyncError::Validation(format!(
        "start date ({start}) is after end date ({end})"
      )));
    }
    Ok(DateRange { start, end })
  }

  pub fn single(date: NaiveDate) -> Self {
    DateRange { start: date, end: date }
  }

  #[cfg(test)]
  pub fn contains(&self, date: NaiveDate) -> bool {
    self.start <= date && date <= self.end
  }

  pub fn days(&self) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    let mut current = self.start;
    while current <= self.end {
      out.push(current);
      current += Duration::days(1);
    }
    out
  }
}

/// Calendar month keyed as `MM-YYYY`. Orders chronologically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MonthKey {
  year: i32,
  month: u32,
}

impl MonthKey {
  pub fn new(year: i32, month: u32) -> Result<Self> {
    if !(1..=12).contains(&month) {
      return Err(SyncError::Validation(format!("invalid month {month}")));
    }
    Ok(MonthKey { year, month })
  }

  pub fn from_date(date: NaiveDate) -> Self {
    MonthKey {
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
    NaiveDate::from_ymd_opt(self.year, self.month, 1).unwrap_or(NaiveDate::MIN)
  }

  pub fn last_day(&self) -> NaiveDate {
    let (y, m) = if self.month == 12 {
      (self.year + 1, 1)
    } else {
      (self.year, self.month + 1)
    };
    NaiveDate::from_ymd_opt(y, m, 1)
      .map(|d| d - Duration::days(1))
      .unwrap_or(NaiveDate::MAX)
  }

  pub fn range(&self) -> DateRange {
    DateRange {
      start: self.first_day(),
      end: self.last_day(),
    }
  }

  pub fn previous(&self) -> Self {
    if self.month == 1 {
      MonthKey { year: self.year - 1, month: 12 }
    } else {
      MonthKey { year: self.year, month: self.month - 1 }
    }
  }
}

impl fmt::Display for MonthKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:02}-{:04}", self.month, self.year)
  }
}

impl FromStr for MonthKey {
  type Err = SyncError;

  fn from_str(s: &str) -> Result<Self> {
    let invalid = || SyncError::Validation(format!("invalid period {s:?}, expected MM-YYYY"));
    let (month, year) = s.trim().split_once('-').ok_or_else(invalid)?;
    if month.len() != 2 || year.len() != 4 {
      return Err(invalid());
    }
    let month = month.parse::<u32>().map_err(|_| invalid())?;
    let year = year.parse::<i32>().map_err(|_| invalid())?;
    MonthKey::new(year, month)
  }
}

impl TryFrom<String> for MonthKey {
  type Error = SyncError;

  fn try_from(value: String) -> Result<Self> {
    value.parse()
  }
}

impl From<MonthKey> for String {
  fn from(value: MonthKey) -> Self {
    value.to_string()
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CampaignInsight {
  pub campaign_id: String,
  pub campaign_name: String,
  pub objective: String,
  /// Integer counters kept as decimal strings, the way the ads API reports them.
  pub impressions: String,
  pub reach: String,
  pub clicks: String,
  pub frequency: String,
  pub spend: f64,
  pub result: i64,
  pub cost_per_result: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AdMetrics {
  pub account_id: String,
  pub name: String,
  pub objective: String,
  pub impressions: i64,
  pub reach: i64,
  pub frequency: f64,
  pub spend: f64,
  pub result: i64,
  pub cost_per_result: f64,
  #[serde(default)]
  pub campaigns: Vec<CampaignInsight>,
  /// Keyed by `YYYY-MM-DD`; only populated on aggregates.
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub cost_per_result_by_date: BTreeMap<String, f64>,
  #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
  pub result_by_date: BTreeMap<String, i64>,
}

/// One order as returned by the sales API.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaleTransaction {
  #[serde(rename = "data", default)]
  pub date: String,
  #[serde(rename = "valor_liquido", default)]
  pub net_amount: f64,
  #[serde(rename = "origensCliente", default)]
  pub customer_origins: Vec<String>,
}

impl SaleTransaction {
  pub fn is_social_network(&self) -> bool {
    self
      .customer_origins
      .first()
      .map(|origin| SOCIAL_NETWORK_ORIGINS.contains(&origin.as_str()))
      .unwrap_or(false)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sale {
  pub date: NaiveDate,
  pub net_amount: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SalesMetrics {
  pub total_revenue: f64,
  pub sales_quantity: i64,
  pub average_ticket: f64,
  #[serde(default)]
  pub sales: Vec<Sale>,
}

/// Sales metrics keyed by origin tag (`SocialNetwork`, `Store`).
pub type SalesByOrigin = BTreeMap<String, SalesMetrics>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyRecord<M> {
  pub account_id: i64,
  pub external_id: String,
  pub date: NaiveDate,
  pub metrics: M,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyRecord<M> {
  pub account_id: i64,
  pub external_id: String,
  pub period: MonthKey,
  pub metrics: M,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRecord {
  pub account_id: i64,
  pub month: MonthKey,
  pub store_name: String,
  pub social_network_revenue: f64,
  pub position: i32,
  /// Positive when the store moved up.
  pub position_change: i32,
  pub previous_position: i32,
  #[serde(default)]
  pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultMetrics {
  pub conversion: f64,
  pub roi: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccountInsights {
  pub range: DateRange,
  pub ad_metrics: Option<AdMetrics>,
  pub sales_metrics: Option<SalesByOrigin>,
  pub result_metrics: Option<ResultMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthlyReport {
  pub account_id: i64,
  pub account_name: String,
  pub period: MonthKey,
  pub ad_metrics: Option<AdMetrics>,
  pub sales_metrics: Option<SalesByOrigin>,
  pub result_metrics: Option<ResultMetrics>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AvailablePeriods {
  pub periods: Vec<String>,
  pub years: Vec<String>,
  pub months: Vec<String>,
}
