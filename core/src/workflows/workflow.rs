use crate::crawls::crawl::CrawlState;
use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct Seed {
  pub url: String,
  pub scope_type: Option<String>,
  pub depth: Option<u32>,
}

impl Seed {
  pub fn new(url: impl Into<String>) -> Self {
    Self {
      url: url.into(),
      scope_type: None,
      depth: None,
    }
  }
}

/// Reusable crawl template. CrawlJobs are materialized from this, manually or
/// on schedule. The `lastCrawl*` / count / size fields are derived state,
/// recomputed whenever a crawl of this workflow reaches a terminal state.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct Workflow {
  pub id: Uuid,
  pub oid: Uuid,
  pub name: String,
  pub scope_type: String,
  pub seeds: Vec<Seed>,
  pub seed_file_id: Option<Uuid>,
  pub job_type: Option<String>,
  pub schedule: Option<String>,
  pub crawl_timeout: u64,
  pub max_crawl_size: u64,
  pub browser_windows: u32,
  pub page_limit: u64,
  pub profileid: Option<Uuid>,
  pub profile_filename: Option<String>,
  pub auto_add_collections: Vec<Uuid>,
  pub exclude: Vec<String>,
  pub link_selectors: Vec<String>,
  pub custom_behaviors: Vec<String>,
  pub lang: Option<String>,
  pub proxy_id: Option<String>,
  pub last_crawl_id: Option<String>,
  pub last_crawl_state: Option<CrawlState>,
  pub last_crawl_time: Option<DateTime<Utc>>,
  pub crawl_count: u64,
  pub crawl_successful_count: u64,
  pub total_size: u64,
  pub inactive: bool,
  pub created: Option<DateTime<Utc>>,
  pub modified: Option<DateTime<Utc>>,
}

impl Workflow {
  /// A workflow carries exactly one seed source: inline seeds or a seed file.
  pub fn validate_seed_source(&self) -> Result<()> {
    match (self.seeds.is_empty(), self.seed_file_id.is_none()) {
      (false, true) | (true, false) => Ok(()),
      (true, true) => bail!("Workflow has neither seeds nor a seed file"),
      (false, false) => bail!("Workflow has both seeds and a seed file"),
    }
  }

  pub fn is_scheduled(&self) -> bool {
    !self.inactive && self.schedule.as_deref().is_some_and(|s| !s.is_empty())
  }

  /// Exclusion patterns are handed to workers as regexes; reject ones that
  /// will not compile before they reach a crawl.
  pub fn validate_exclusions(&self) -> Result<()> {
    for pattern in &self.exclude {
      if regex::Regex::new(pattern).is_err() {
        bail!("Invalid exclusion regex: {}", pattern);
      }
    }
    Ok(())
  }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SeedFile {
  pub id: Uuid,
  pub oid: Uuid,
  pub filename: String,
  pub size: u64,
  pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_seed_source_exclusivity() {
    let mut workflow = Workflow {
      seeds: vec![Seed::new("https://webrecorder.net/")],
      ..Default::default()
    };
    assert!(workflow.validate_seed_source().is_ok());

    workflow.seed_file_id = Some(Uuid::new_v4());
    assert!(workflow.validate_seed_source().is_err());

    workflow.seeds.clear();
    assert!(workflow.validate_seed_source().is_ok());

    workflow.seed_file_id = None;
    assert!(workflow.validate_seed_source().is_err());
  }

  #[test]
  fn test_exclusion_validation() {
    let mut workflow = Workflow {
      exclude: vec![r"^https://example\.com/private/.*".to_string()],
      ..Default::default()
    };
    assert!(workflow.validate_exclusions().is_ok());
    workflow.exclude.push("(unclosed".to_string());
    assert!(workflow.validate_exclusions().is_err());
  }

  #[test]
  fn test_is_scheduled() {
    let mut workflow = Workflow::default();
    assert!(!workflow.is_scheduled());
    workflow.schedule = Some("*/5 * * * *".to_string());
    assert!(workflow.is_scheduled());
    workflow.inactive = true;
    assert!(!workflow.is_scheduled());
  }
}
