use anyhow::Result;
use chrono::{DateTime, Utc};
use rustis::{
  client::Client,
  commands::{GenericCommands, ListCommands, SetCommands, StringCommands},
};
use serde::Deserialize;
use tracing::{instrument, warn};

/// Last heartbeat a worker pod wrote to `status:<id>:<podIndex>`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WorkerHeartbeat {
  pub pages_done: u64,
  pub size: u64,
  pub last_page_time: Option<DateTime<Utc>>,
  pub state: String,
}

impl WorkerHeartbeat {
  pub fn is_finished(&self) -> bool {
    matches!(self.state.as_str(), "done" | "interrupted")
  }

  pub fn is_done(&self) -> bool {
    self.state == "done"
  }
}

/// One finalized WACZ announced by a worker on `files:<id>`.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FinalizedFile {
  pub filename: String,
  pub hash: String,
  pub size: u64,
}

/// Builds connections to per-crawl redis services. Each running crawl gets
/// its own redis pod; the operator dials it by service DNS name.
pub struct CrawlChannelFactory {
  namespace: String,
  url_override: Option<String>,
}

impl CrawlChannelFactory {
  pub fn new(namespace: String) -> Self {
    Self {
      namespace,
      url_override: None,
    }
  }

  /// Points every channel at a fixed redis URL instead of per-crawl service
  /// DNS. Used outside the cluster.
  pub fn with_url_override(namespace: String, url: String) -> Self {
    Self {
      namespace,
      url_override: Some(url),
    }
  }

  pub fn redis_url(&self, crawl_id: &str) -> String {
    match &self.url_override {
      Some(url) => url.clone(),
      None => format!("redis://redis-{}.{}:6379/0", crawl_id, self.namespace),
    }
  }

  pub async fn connect(&self, crawl_id: &str) -> Result<CrawlChannel> {
    let client = Client::connect(self.redis_url(crawl_id)).await?;
    Ok(CrawlChannel {
      client,
      id: crawl_id.to_string(),
    })
  }
}

/// The volatile, in-flight state of one crawl. All writes are atomic
/// single-key operations; reads are single-pass per reconcile.
pub struct CrawlChannel {
  client: Client,
  id: String,
}

impl CrawlChannel {
  fn queue_key(&self) -> String {
    format!("q:{}", self.id)
  }

  fn seen_key(&self) -> String {
    format!("seen:{}", self.id)
  }

  fn exclusions_key(&self) -> String {
    format!("excl:{}", self.id)
  }

  fn pages_key(&self) -> String {
    format!("pages:{}", self.id)
  }

  fn status_key(&self, pod_index: u32) -> String {
    format!("status:{}:{}", self.id, pod_index)
  }

  fn stop_key(&self) -> String {
    format!("stop:{}", self.id)
  }

  fn pod_stop_key(&self, pod_index: u32) -> String {
    format!("stop:{}:{}", self.id, pod_index)
  }

  fn pause_key(&self) -> String {
    format!("pause:{}", self.id)
  }

  fn size_key(&self) -> String {
    format!("size:{}", self.id)
  }

  fn errors_key(&self) -> String {
    format!("errors:{}", self.id)
  }

  fn behavior_logs_key(&self) -> String {
    format!("behavior_logs:{}", self.id)
  }

  fn files_key(&self) -> String {
    format!("files:{}", self.id)
  }

  #[instrument(skip(self))]
  pub async fn heartbeat(&self, pod_index: u32) -> Result<Option<WorkerHeartbeat>> {
    let raw: Option<String> = self.client.get(self.status_key(pod_index)).await?;
    match raw {
      Some(raw) => match serde_json::from_str::<WorkerHeartbeat>(&raw) {
        Ok(heartbeat) => Ok(Some(heartbeat)),
        Err(e) => {
          warn!(
            crawl_id = self.id.as_str(),
            pod_index,
            err = e.to_string(),
            "Discarding malformed heartbeat"
          );
          Ok(None)
        }
      },
      None => Ok(None),
    }
  }

  pub async fn total_size(&self) -> Result<u64> {
    let raw: Option<String> = self.client.get(self.size_key()).await?;
    Ok(raw.and_then(|value| value.parse::<u64>().ok()).unwrap_or(0))
  }

  pub async fn pages_found(&self) -> Result<u64> {
    let count = self.client.scard(self.seen_key()).await?;
    Ok(count as u64)
  }

  pub async fn request_stop(&self) -> Result<()> {
    self.client.set(self.stop_key(), "1").await?;
    Ok(())
  }

  /// Graceful stop addressed to a single worker (soft OOM path).
  pub async fn request_pod_stop(&self, pod_index: u32) -> Result<()> {
    self.client.set(self.pod_stop_key(pod_index), "1").await?;
    Ok(())
  }

  pub async fn set_pause(&self, paused: bool) -> Result<()> {
    if paused {
      self.client.set(self.pause_key(), "1").await?;
    } else {
      self.client.del(self.pause_key()).await?;
    }
    Ok(())
  }

  /// Replaces the exclusion regex list; workers re-read it on change.
  #[instrument(skip(self, exclusions))]
  pub async fn set_exclusions(&self, exclusions: &[String]) -> Result<()> {
    self.client.del(self.exclusions_key()).await?;
    if !exclusions.is_empty() {
      let _count: usize = self
        .client
        .rpush(self.exclusions_key(), exclusions.to_vec())
        .await?;
    }
    Ok(())
  }

  async fn drain_json_list<T: serde::de::DeserializeOwned>(
    &self,
    key: String,
    max: usize,
  ) -> Result<Vec<T>> {
    let raw: Vec<String> = self.client.lpop(key, max).await?;
    Ok(
      raw
        .into_iter()
        .filter_map(|entry| {
          serde_json::from_str::<T>(&entry)
            .inspect_err(|e| {
              warn!(
                crawl_id = self.id.as_str(),
                err = e.to_string(),
                "Discarding malformed channel entry"
              )
            })
            .ok()
        })
        .collect(),
    )
  }

  pub async fn drain_pages(&self, max: usize) -> Result<Vec<crate::crawls::page::PageEntry>> {
    self.drain_json_list(self.pages_key(), max).await
  }

  pub async fn drain_errors(&self, max: usize) -> Result<Vec<serde_json::Value>> {
    self.drain_json_list(self.errors_key(), max).await
  }

  pub async fn drain_behavior_logs(&self, max: usize) -> Result<Vec<serde_json::Value>> {
    self.drain_json_list(self.behavior_logs_key(), max).await
  }

  /// Finalized WACZ list; left in place so finalization can be retried.
  pub async fn finalized_files(&self) -> Result<Vec<FinalizedFile>> {
    let raw: Vec<String> = self.client.lrange(self.files_key(), 0, -1).await?;
    Ok(
      raw
        .into_iter()
        .filter_map(|entry| serde_json::from_str::<FinalizedFile>(&entry).ok())
        .collect(),
    )
  }

  /// Drops the whole keyspace for this crawl.
  #[instrument(skip(self))]
  pub async fn clear(&self, pod_count: u32) -> Result<()> {
    let mut keys = vec![
      self.queue_key(),
      self.seen_key(),
      self.exclusions_key(),
      self.pages_key(),
      self.stop_key(),
      self.pause_key(),
      self.size_key(),
      self.errors_key(),
      self.behavior_logs_key(),
      self.files_key(),
    ];
    for pod_index in 0..pod_count {
      keys.push(self.status_key(pod_index));
      keys.push(self.pod_stop_key(pod_index));
    }
    self.client.del(keys).await?;
    Ok(())
  }
}
