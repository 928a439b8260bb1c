use crate::{
  operator::models::{CrawlJobSpec, BTRIX_API, LABEL_CRAWLCONFIG},
  settings::{KubeApiSettings, Settings},
};
use anyhow::{anyhow, Result};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_tracing::TracingMiddleware;
use std::path::Path;
use tracing::instrument;

/// Minimal apiserver client for CrawlJob custom resources. This is the only
/// path that writes CRs (the schedule materializer and org-deletion cascade);
/// reconciliation itself arrives through the meta-controller webhook.
pub struct CrawlJobClient {
  client: ClientWithMiddleware,
  api_url: String,
  namespace: String,
  token: Option<String>,
}

impl CrawlJobClient {
  pub fn new(settings: &Settings) -> Result<Self> {
    Self::with_kube_settings(&settings.kube, &settings.crawler.namespace)
  }

  pub fn with_kube_settings(kube: &KubeApiSettings, namespace: &str) -> Result<Self> {
    let base_client = reqwest::ClientBuilder::new()
      .danger_accept_invalid_certs(true)
      .build()
      .map_err(|error| anyhow::Error::msg(error.to_string()))?;
    let client = ClientBuilder::new(base_client)
      .with(TracingMiddleware::default())
      .build();

    let token = match Path::new(&kube.token_path).exists() {
      true => Some(std::fs::read_to_string(&kube.token_path)?.trim().to_string()),
      false => None,
    };

    Ok(Self {
      client,
      api_url: kube.api_url.trim_end_matches('/').to_string(),
      namespace: namespace.to_string(),
      token,
    })
  }

  fn collection_url(&self) -> String {
    format!(
      "{}/apis/{}/namespaces/{}/crawljobs",
      self.api_url, BTRIX_API, self.namespace
    )
  }

  fn object_url(&self, crawl_id: &str) -> String {
    format!("{}/crawljob-{}", self.collection_url(), crawl_id)
  }

  fn authorize(
    &self,
    request: reqwest_middleware::RequestBuilder,
  ) -> reqwest_middleware::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  #[instrument(skip(self, spec))]
  pub async fn create_crawl_job(&self, spec: &CrawlJobSpec) -> Result<()> {
    let body = serde_json::json!({
      "apiVersion": BTRIX_API,
      "kind": "CrawlJob",
      "metadata": {
        "name": format!("crawljob-{}", spec.id),
        "labels": {
          LABEL_CRAWLCONFIG: spec.cid.to_string(),
        },
      },
      "spec": spec,
    });
    let response = self
      .authorize(self.client.post(self.collection_url()))
      .json(&body)
      .send()
      .await?;
    if !response.status().is_success() {
      return Err(anyhow!(
        "Failed to create CrawlJob {}: {}",
        spec.id,
        response.status()
      ));
    }
    Ok(())
  }

  #[instrument(skip(self, patch))]
  pub async fn patch_crawl_job_spec(
    &self,
    crawl_id: &str,
    patch: serde_json::Value,
  ) -> Result<()> {
    let body = serde_json::json!({ "spec": patch });
    let response = self
      .authorize(self.client.patch(self.object_url(crawl_id)))
      .header("Content-Type", "application/merge-patch+json")
      .json(&body)
      .send()
      .await?;
    if !response.status().is_success() {
      return Err(anyhow!(
        "Failed to patch CrawlJob {}: {}",
        crawl_id,
        response.status()
      ));
    }
    Ok(())
  }

  pub async fn set_stopping(&self, crawl_id: &str) -> Result<()> {
    self
      .patch_crawl_job_spec(crawl_id, serde_json::json!({ "stopping": true }))
      .await
  }

  #[instrument(skip(self))]
  pub async fn delete_crawl_job(&self, crawl_id: &str) -> Result<()> {
    let response = self
      .authorize(self.client.delete(self.object_url(crawl_id)))
      .send()
      .await?;
    if !response.status().is_success() && response.status().as_u16() != 404 {
      return Err(anyhow!(
        "Failed to delete CrawlJob {}: {}",
        crawl_id,
        response.status()
      ));
    }
    Ok(())
  }
}
