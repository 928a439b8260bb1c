use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Per-QA-run comparison scores attached to a page when a qa-type crawl
/// replays it.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct PageQaComparison {
  pub text_match: f64,
  pub screenshot_match: f64,
  pub resource_counts: BTreeMap<String, u64>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Page {
  pub id: String,
  pub oid: Uuid,
  pub crawl_id: String,
  pub url: String,
  pub ts: Option<DateTime<Utc>>,
  pub title: Option<String>,
  pub load_state: Option<u32>,
  pub status: Option<u16>,
  pub mime: Option<String>,
  pub depth: Option<u32>,
  pub is_seed: bool,
  pub is_error: bool,
  pub is_file: bool,
  pub qa: BTreeMap<String, PageQaComparison>,
}

/// Wire shape of one `pages:<id>` entry as published by the crawler worker.
/// Only `url` is required; everything else is best-effort.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PageEntry {
  #[serde(default)]
  pub id: Option<String>,
  pub url: String,
  #[serde(default)]
  pub ts: Option<DateTime<Utc>>,
  #[serde(default)]
  pub title: Option<String>,
  #[serde(default)]
  pub load_state: Option<u32>,
  #[serde(default)]
  pub status: Option<u16>,
  #[serde(default)]
  pub mime: Option<String>,
  #[serde(default)]
  pub depth: Option<u32>,
  #[serde(default)]
  pub seed: bool,
  #[serde(default)]
  pub error: bool,
  #[serde(default)]
  pub is_file: bool,
  #[serde(default)]
  pub qa_run_id: Option<String>,
  #[serde(default)]
  pub qa: Option<PageQaComparison>,
}

impl PageEntry {
  pub fn into_page(self, oid: Uuid, crawl_id: &str) -> Page {
    let mut qa = BTreeMap::new();
    if let (Some(qa_run_id), Some(comparison)) = (self.qa_run_id, self.qa) {
      qa.insert(qa_run_id, comparison);
    }
    Page {
      id: self.id.unwrap_or_else(|| Uuid::new_v4().to_string()),
      oid,
      crawl_id: crawl_id.to_string(),
      url: self.url,
      ts: self.ts,
      title: self.title,
      load_state: self.load_state,
      status: self.status,
      mime: self.mime,
      depth: self.depth,
      is_seed: self.seed,
      is_error: self.error,
      is_file: self.is_file,
      qa,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_page_entry_minimal() {
    let entry: PageEntry = serde_json::from_str(r#"{"url": "https://webrecorder.net/"}"#).unwrap();
    let page = entry.into_page(Uuid::new_v4(), "crawl-1");
    assert_eq!(page.url, "https://webrecorder.net/");
    assert!(!page.is_seed);
    assert!(!page.id.is_empty());
  }

  #[test]
  fn test_page_entry_full() {
    let entry: PageEntry = serde_json::from_str(
      r#"{
        "id": "p-1",
        "url": "https://webrecorder.net/about",
        "title": "About",
        "loadState": 4,
        "status": 200,
        "mime": "text/html",
        "depth": 1,
        "seed": true
      }"#,
    )
    .unwrap();
    let page = entry.into_page(Uuid::new_v4(), "crawl-1");
    assert_eq!(page.id, "p-1");
    assert!(page.is_seed);
    assert_eq!(page.status, Some(200));
  }

  #[test]
  fn test_qa_entry_lands_in_qa_map() {
    let entry: PageEntry = serde_json::from_str(
      r#"{
        "url": "https://webrecorder.net/",
        "qaRunId": "qa-1",
        "qa": {"textMatch": 0.98, "screenshotMatch": 0.91}
      }"#,
    )
    .unwrap();
    let page = entry.into_page(Uuid::new_v4(), "crawl-1");
    assert_eq!(page.qa.get("qa-1").unwrap().text_match, 0.98);
  }
}
