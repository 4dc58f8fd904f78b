use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::aggregate::round_two_decimals;
use crate::domain::{AdMetrics, CampaignInsight, DateRange};
use crate::error::{Result, SyncError};
use crate::http_client::{build_url, HttpClient};
use crate::source::AdMetricSource;
use crate::token::{classify_error_response, TokenLifecycleManager};

const ACCOUNT_INSIGHT_FIELDS: &str =
  "account_id,account_name,spend,actions,cost_per_action_type,objective,impressions,reach,frequency";
const CAMPAIGN_FIELDS: &str = "id,name,status";
const CAMPAIGN_INSIGHT_FIELDS: &str = "account_id,account_name,campaign_name,campaign_id,spend,impressions,frequency,reach,objective,clicks,actions,cost_per_action_type";
const ACTIVE_ONLY: &str = "['ACTIVE']";
const ENGAGEMENT_FILTER: &str =
  r#"[{"field":"objective","operator":"IN","value":["OUTCOME_ENGAGEMENT"]}]"#;

/// Campaign objective to the action type counted as its "result".
pub const OBJECTIVE_ACTION_TYPES: &[(&str, &str)] = &[
  ("LINK_CLICKS", "link_click"),
  ("POST_ENGAGEMENT", "post_engagement"),
  ("PAGE_LIKES", "like"),
  ("VIDEO_VIEWS", "video_view"),
  ("LEAD_GENERATION", "lead"),
  ("CONVERSIONS", "offsite_conversion"),
  ("APP_INSTALLS", "app_install"),
  ("PRODUCT_CATALOG_SALES", "offsite_conversion.fb_pixel_purchase"),
  ("MESSAGES", "onsite_conversion.messaging_first_reply"),
  ("BRAND_AWARENESS", "brand_awareness"),
  ("REACH", "reach"),
  ("STORE_TRAFFIC", "store_visit"),
  ("EVENT_RESPONSES", "rsvp"),
  ("ADD_TO_CART", "offsite_conversion.fb_pixel_add_to_cart"),
  ("PURCHASE", "offsite_conversion.fb_pixel_purchase"),
  (
    "OUTCOME_ENGAGEMENT",
    "onsite_conversion.messaging_conversation_started_7d",
  ),
];

pub fn action_type_for(objective: &str) -> Option<&'static str> {
  OBJECTIVE_ACTION_TYPES
    .iter()
    .find(|(o, _)| *o == objective)
    .map(|(_, action)| *action)
}

#[derive(Debug, Deserialize)]
struct GraphList<T> {
  #[serde(default = "Vec::new")]
  data: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct GraphAction {
  #[serde(default)]
  action_type: String,
  #[serde(default)]
  value: String,
}

#[derive(Debug, Default, Deserialize)]
struct AccountInsightRow {
  #[serde(default)]
  account_id: String,
  #[serde(default)]
  account_name: String,
  #[serde(default)]
  objective: String,
  #[serde(default)]
  spend: String,
  #[serde(default)]
  impressions: String,
  #[serde(default)]
  reach: String,
  #[serde(default)]
  frequency: String,
}

#[derive(Debug, Deserialize)]
struct CampaignRef {
  id: String,
  #[serde(default)]
  name: String,
}

#[derive(Debug, Default, Deserialize)]
struct CampaignInsightRow {
  #[serde(default)]
  campaign_id: String,
  #[serde(default)]
  campaign_name: String,
  #[serde(default)]
  objective: String,
  #[serde(default)]
  spend: String,
  #[serde(default)]
  impressions: String,
  #[serde(default)]
  reach: String,
  #[serde(default)]
  clicks: String,
  #[serde(default)]
  frequency: String,
  #[serde(default)]
  actions: Vec<GraphAction>,
  #[serde(default)]
  cost_per_action_type: Vec<GraphAction>,
}

impl CampaignInsightRow {
  fn counted_action<'a>(&self, actions: &'a [GraphAction]) -> Option<&'a GraphAction> {
    let wanted = action_type_for(&self.objective)?;
    actions.iter().find(|a| a.action_type == wanted)
  }

  fn result(&self) -> i64 {
    self
      .counted_action(&self.actions)
      .map(|a| parse_or_zero("result", &a.value))
      .unwrap_or(0)
  }

  fn cost_per_result(&self) -> f64 {
    self
      .counted_action(&self.cost_per_action_type)
      .map(|a| round_two_decimals(parse_or_zero("cost_per_result", &a.value)))
      .unwrap_or(0.0)
  }

  fn into_insight(self) -> CampaignInsight {
    let result = self.result();
    let cost_per_result = self.cost_per_result();
    CampaignInsight {
      spend: parse_or_zero("spend", &self.spend),
      campaign_id: self.campaign_id,
      campaign_name: self.campaign_name,
      objective: self.objective,
      impressions: self.impressions,
      reach: self.reach,
      clicks: self.clicks,
      frequency: self.frequency,
      result,
      cost_per_result,
    }
  }
}

/// The ads API reports numbers as strings; anything unparseable counts as zero.
fn parse_or_zero<T: FromStr + Default>(field: &str, raw: &str) -> T {
  match raw.trim().parse::<T>() {
    Ok(v) => v,
    Err(_) => {
      if !raw.is_empty() {
        warn!(field, value = raw, "unparseable numeric field; using 0");
      }
      T::default()
    }
  }
}

fn time_range_param(range: DateRange) -> String {
  serde_json::json!({
    "since": range.start.format("%Y-%m-%d").to_string(),
    "until": range.end.format("%Y-%m-%d").to_string(),
  })
  .to_string()
}

/// Graph API client for ad-account and campaign insights. Every call carries the managed
/// access token and is retried once after a refresh when the token is rejected.
pub struct MetaGraphClient {
  http: HttpClient,
  api_url: String,
  tokens: Arc<TokenLifecycleManager>,
}

impl MetaGraphClient {
  pub fn new(
    http: HttpClient,
    api_url: impl Into<String>,
    tokens: Arc<TokenLifecycleManager>,
  ) -> Self {
    MetaGraphClient {
      http,
      api_url: api_url.into(),
      tokens,
    }
  }

  async fn get_json<T: DeserializeOwned>(&self, path: &str, params: &[(&str, &str)]) -> Result<T> {
    self
      .tokens
      .call_with_refresh(|token| async move {
        let mut query = params.to_vec();
        query.push(("access_token", token.as_str()));
        let url = build_url(&self.api_url, path, &query);

        let resp = self.http.get(&url, None).await?;
        if !resp.is_ok() {
          return Err(classify_error_response(resp.status, &resp.text()));
        }
        resp.json::<T>()
      })
      .await
  }

  async fn active_campaigns(&self, account_path: &str) -> Result<Vec<CampaignRef>> {
    let list: GraphList<CampaignRef> = self
      .get_json(
        &format!("{account_path}/campaigns"),
        &[("fields", CAMPAIGN_FIELDS), ("effective_status", ACTIVE_ONLY)],
      )
      .await?;
    Ok(list.data)
  }

  async fn campaign_insight(&self, campaign_id: &str, time_range: &str) -> Result<CampaignInsight> {
    let list: GraphList<CampaignInsightRow> = self
      .get_json(
        &format!("{campaign_id}/insights"),
        &[
          ("fields", CAMPAIGN_INSIGHT_FIELDS),
          ("filtering", ENGAGEMENT_FILTER),
          ("time_range", time_range),
        ],
      )
      .await?;
    list
      .data
      .into_iter()
      .next()
      .map(CampaignInsightRow::into_insight)
      .ok_or_else(|| SyncError::NotFound(format!("no insights for campaign {campaign_id}")))
  }
}

#[async_trait]
impl AdMetricSource for MetaGraphClient {
  async fn fetch_ad_metrics(&self, external_id: &str, range: DateRange) -> Result<AdMetrics> {
    if let Err(e) = self.tokens.ensure_valid().await {
      if e.is_permanent_auth() {
        return Err(e);
      }
      warn!(error = %e, "token validation failed; trying the current token anyway");
    }

    let account_path = format!("act_{}", external_id.trim_start_matches("act_"));
    let time_range = time_range_param(range);

    let account: GraphList<AccountInsightRow> = self
      .get_json(
        &format!("{account_path}/insights"),
        &[("fields", ACCOUNT_INSIGHT_FIELDS), ("time_range", &time_range)],
      )
      .await?;
    let account = account.data.into_iter().next().ok_or_else(|| {
      SyncError::NotFound(format!(
        "no insights for {account_path} between {} and {}",
        range.start, range.end
      ))
    })?;

    let campaigns = match self.active_campaigns(&account_path).await {
      Ok(campaigns) => campaigns,
      Err(e) if e.is_permanent_auth() => return Err(e),
      Err(e) => {
        warn!(account = %account_path, error = %e, "failed to list campaigns; continuing without them");
        Vec::new()
      }
    };

    let mut insights = Vec::with_capacity(campaigns.len());
    for campaign in &campaigns {
      match self.campaign_insight(&campaign.id, &time_range).await {
        Ok(insight) => insights.push(insight),
        Err(e) if e.is_permanent_auth() => return Err(e),
        Err(e) => {
          debug!(campaign_id = %campaign.id, name = %campaign.name, error = %e, "skipping campaign");
        }
      }
    }

    let (result, campaign_spend) = insights
      .iter()
      .filter(|c| c.result > 0 && c.spend > 0.0)
      .fold((0i64, 0.0f64), |(r, s), c| (r + c.result, s + c.spend));
    let cost_per_result = if result > 0 {
      round_two_decimals(campaign_spend / result as f64)
    } else {
      0.0
    };

    Ok(AdMetrics {
      account_id: account.account_id,
      name: account.account_name,
      objective: account.objective,
      impressions: parse_or_zero("impressions", &account.impressions),
      reach: parse_or_zero("reach", &account.reach),
      frequency: parse_or_zero("frequency", &account.frequency),
      spend: parse_or_zero("spend", &account.spend),
      result,
      cost_per_result,
      campaigns: insights,
      ..AdMetrics::default()
    })
  }
}
