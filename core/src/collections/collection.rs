use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Collection {
  pub id: Uuid,
  pub oid: Uuid,
  pub name: String,
  pub slug: String,
  pub description: Option<String>,
  pub crawl_ids: Vec<String>,
  pub crawl_count: u64,
  pub page_count: u64,
  pub total_size: u64,
  pub modified: Option<DateTime<Utc>>,
}
