use super::models::{SyncRequest, SyncResponse, LABEL_ORG, POD};
use crate::{
  collections::collection_repository::CollectionRepository,
  crawls::crawl_repository::CrawlRepository, settings::Settings,
};
use anyhow::Result;
use k8s_openapi::{
  api::core::v1::{ConfigMap, Container, Pod, PodSpec},
  apimachinery::pkg::apis::meta::v1::ObjectMeta,
  Resource,
};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};
use tracing::instrument;
use uuid::Uuid;

#[derive(Deserialize, Debug)]
#[serde(rename_all = "camelCase")]
struct CollIndexSpec {
  id: String,
  #[serde(alias = "orgId")]
  oid: Uuid,
  collection_id: Uuid,
}

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct CollIndexStatus {
  ready: bool,
  file_count: usize,
}

/// Renders a replay-index worker for one collection: a ConfigMap listing the
/// collection's WACZ object keys and a single indexer pod consuming it.
pub struct CollIndexOperator {
  settings: Arc<Settings>,
  collection_repository: Arc<CollectionRepository>,
  crawl_repository: Arc<CrawlRepository>,
}

impl CollIndexOperator {
  pub fn new(
    settings: Arc<Settings>,
    collection_repository: Arc<CollectionRepository>,
    crawl_repository: Arc<CrawlRepository>,
  ) -> Self {
    Self {
      settings,
      collection_repository,
      crawl_repository,
    }
  }

  fn to_child<T: Resource + Serialize>(object: &T) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(object)?;
    value["apiVersion"] = serde_json::json!(T::API_VERSION);
    value["kind"] = serde_json::json!(T::KIND);
    Ok(value)
  }

  #[instrument(skip(self, request))]
  pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
    let spec: CollIndexSpec =
      serde_json::from_value(request.parent.get("spec").cloned().unwrap_or_default())?;

    if request.finalizing {
      return Ok(SyncResponse {
        status: serde_json::to_value(CollIndexStatus::default())?,
        children: Vec::new(),
        resync_after_seconds: None,
        finalized: Some(true),
      });
    }

    let mut file_keys = Vec::new();
    if let Some(collection) = self.collection_repository.find(&spec.collection_id).await? {
      for crawl_id in &collection.crawl_ids {
        if let Some(crawl) = self.crawl_repository.find(crawl_id).await? {
          file_keys.extend(crawl.files.iter().map(|file| file.filename.clone()));
        }
      }
    }

    let name = format!("collindex-{}", spec.id);
    let labels = BTreeMap::from([
      ("btrix.collindex".to_string(), spec.id.clone()),
      (LABEL_ORG.to_string(), spec.oid.to_string()),
    ]);

    let configmap = ConfigMap {
      metadata: ObjectMeta {
        name: Some(name.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
      },
      data: Some(BTreeMap::from([(
        "FILE_KEYS".to_string(),
        serde_json::to_string(&file_keys)?,
      )])),
      ..Default::default()
    };

    let pod = Pod {
      metadata: ObjectMeta {
        name: Some(name.clone()),
        labels: Some(labels),
        ..Default::default()
      },
      spec: Some(PodSpec {
        restart_policy: Some("OnFailure".to_string()),
        containers: vec![Container {
          name: "indexer".to_string(),
          image: Some(self.settings.crawler.image.clone()),
          env: Some(serde_json::from_value(serde_json::json!([
            {"name": "COLLECTION_ID", "value": spec.collection_id.to_string()},
            {"name": "FILE_KEYS_CONFIGMAP", "value": name},
          ]))?),
          ..Default::default()
        }],
        ..Default::default()
      }),
      ..Default::default()
    };

    let ready = request
      .children_of_kind(POD)
      .any(|(_, pod)| pod["status"]["phase"] == "Running" || pod["status"]["phase"] == "Succeeded");

    Ok(SyncResponse {
      status: serde_json::to_value(CollIndexStatus {
        ready,
        file_count: file_keys.len(),
      })?,
      children: vec![Self::to_child(&configmap)?, Self::to_child(&pod)?],
      resync_after_seconds: Some(60.0),
      finalized: None,
    })
  }
}
