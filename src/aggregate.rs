use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::warn;

use crate::domain::{
  AdMetrics, CampaignInsight, DailyRecord, ResultMetrics, Sale, SaleTransaction, SalesByOrigin,
  SalesMetrics, SOCIAL_NETWORK, STORE,
};
use crate::error::{Result, SyncError};

pub fn round_two_decimals(value: f64) -> f64 {
  if value == 0.0 {
    return 0.0;
  }
  (value * 100.0).round() / 100.0
}

fn parse_counter(field: &str, value: &str) -> i64 {
  let trimmed = value.trim();
  if trimmed.is_empty() {
    return 0;
  }
  match trimmed.parse::<i64>() {
    Ok(v) => v,
    Err(_) => {
      warn!(field, value = trimmed, "non-numeric counter treated as 0");
      0
    }
  }
}

fn format_ratio(value: f64) -> String {
  format!("{}", round_two_decimals(value))
}

fn merge_campaign(existing: &mut CampaignInsight, adding: &CampaignInsight) {
  existing.impressions = (parse_counter("impressions", &existing.impressions)
    + parse_counter("impressions", &adding.impressions))
  .to_string();
  existing.reach =
    (parse_counter("reach", &existing.reach) + parse_counter("reach", &adding.reach)).to_string();
  existing.clicks =
    (parse_counter("clicks", &existing.clicks) + parse_counter("clicks", &adding.clicks)).to_string();
  existing.result += adding.result;
  existing.spend += adding.spend;
}

fn finalize_campaign(campaign: &mut CampaignInsight) {
  let impressions = parse_counter("impressions", &campaign.impressions);
  let reach = parse_counter("reach", &campaign.reach);

  campaign.cost_per_result = if campaign.result > 0 {
    round_two_decimals(campaign.spend / campaign.result as f64)
  } else {
    0.0
  };
  campaign.frequency = if reach > 0 {
    format_ratio(impressions as f64 / reach as f64)
  } else {
    "0".to_string()
  };
  campaign.spend = round_two_decimals(campaign.spend);
}

/// Folds per-day ad records into one period aggregate.
///
/// Name, objective and account id come from the first record. Counters and spend are summed,
/// campaigns are merged by id (sorted by id in the output), and cost-per-result and frequency are
/// recomputed from the totals. Returns `None` for an empty input.
pub fn combine_ad_metrics(records: &[DailyRecord<AdMetrics>]) -> Option<AdMetrics> {
  let first = records.first()?;

  let mut combined = AdMetrics {
    account_id: first.external_id.clone(),
    name: first.metrics.name.clone(),
    objective: first.metrics.objective.clone(),
    ..AdMetrics::default()
  };

  let mut total_spend = 0.0;
  let mut campaigns: BTreeMap<String, CampaignInsight> = BTreeMap::new();

  for record in records {
    let m = &record.metrics;
    combined.impressions += m.impressions;
    combined.reach += m.reach;
    combined.result += m.result;
    total_spend += m.spend;

    let day = record.date.format("%Y-%m-%d").to_string();
    *combined.cost_per_result_by_date.entry(day.clone()).or_insert(0.0) += m.cost_per_result;
    *combined.result_by_date.entry(day).or_insert(0) += m.result;

    for campaign in &m.campaigns {
      match campaigns.get_mut(&campaign.campaign_id) {
        Some(existing) => merge_campaign(existing, campaign),
        None => {
          campaigns.insert(campaign.campaign_id.clone(), campaign.clone());
        }
      }
    }
  }

  combined.campaigns = campaigns
    .into_values()
    .map(|mut c| {
      finalize_campaign(&mut c);
      c
    })
    .collect();

  combined.spend = round_two_decimals(total_spend);
  if combined.result > 0 {
    combined.cost_per_result = round_two_decimals(total_spend / combined.result as f64);
  }
  if combined.reach > 0 {
    combined.frequency = round_two_decimals(combined.impressions as f64 / combined.reach as f64);
  }

  Some(combined)
}

fn finalize_sales(total_revenue: f64, sales_quantity: i64, mut sales: Vec<Sale>) -> SalesMetrics {
  let average_ticket = if sales_quantity > 0 {
    round_two_decimals(total_revenue / sales_quantity as f64)
  } else {
    0.0
  };
  sales.sort_by_key(|s| s.date);

  SalesMetrics {
    total_revenue: round_two_decimals(total_revenue),
    sales_quantity,
    average_ticket,
    sales,
  }
}

/// Folds per-day sales records into one aggregate per origin tag.
pub fn combine_sales_metrics(records: &[DailyRecord<SalesByOrigin>]) -> Option<SalesByOrigin> {
  if records.is_empty() {
    return None;
  }

  let mut acc: BTreeMap<String, (f64, i64, Vec<Sale>)> = BTreeMap::new();
  for record in records {
    for (origin, metrics) in &record.metrics {
      let entry = acc.entry(origin.clone()).or_insert_with(|| (0.0, 0, Vec::new()));
      entry.0 += metrics.total_revenue;
      entry.1 += metrics.sales_quantity;
      entry.2.extend(metrics.sales.iter().cloned());
    }
  }

  Some(
    acc
      .into_iter()
      .map(|(origin, (revenue, quantity, sales))| (origin, finalize_sales(revenue, quantity, sales)))
      .collect(),
  )
}

fn parse_sale_date(raw: &str) -> Result<NaiveDate> {
  let day = raw.trim().get(..10).unwrap_or(raw.trim());
  NaiveDate::parse_from_str(day, "%Y-%m-%d")
    .map_err(|e| SyncError::Transient(format!("invalid sale date {raw:?}: {e}")))
}

/// Splits raw transactions into the `SocialNetwork` and `Store` buckets. Both keys are always
/// present.
pub fn sales_metrics_by_origin(transactions: &[SaleTransaction]) -> Result<SalesByOrigin> {
  let mut social = (0.0, Vec::new());
  let mut store = (0.0, Vec::new());

  for tx in transactions {
    let sale = Sale {
      date: parse_sale_date(&tx.date)?,
      net_amount: tx.net_amount,
    };
    let bucket = if tx.is_social_network() { &mut social } else { &mut store };
    bucket.0 += tx.net_amount;
    bucket.1.push(sale);
  }

  let mut out = SalesByOrigin::new();
  let social_qty = social.1.len() as i64;
  let store_qty = store.1.len() as i64;
  out.insert(SOCIAL_NETWORK.to_string(), finalize_sales(social.0, social_qty, social.1));
  out.insert(STORE.to_string(), finalize_sales(store.0, store_qty, store.1));
  Ok(out)
}

/// Sum of net amounts over social-network orders, unrounded.
pub fn social_network_revenue(transactions: &[SaleTransaction]) -> f64 {
  transactions
    .iter()
    .filter(|tx| tx.is_social_network())
    .map(|tx| tx.net_amount)
    .sum()
}

/// Conversion% and ROI for a period. `None` unless the sales side has a social-network bucket.
/// Each ratio is 0 when its denominator is 0; ROI is truncated to an integer multiplier.
pub fn result_metrics(ad: &AdMetrics, sales: &SalesByOrigin) -> Option<ResultMetrics> {
  let social = sales.get(SOCIAL_NETWORK)?;

  let conversion = if ad.result > 0 {
    social.sales_quantity as f64 / ad.result as f64 * 100.0
  } else {
    0.0
  };
  let roi = if ad.spend > 0.0 {
    social.total_revenue / ad.spend
  } else {
    0.0
  };

  Some(ResultMetrics {
    conversion: round_two_decimals(conversion),
    roi: format!("{}x", roi.trunc() as i64),
  })
}
