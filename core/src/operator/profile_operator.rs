use super::models::{ProfileJobSpec, SyncRequest, SyncResponse, LABEL_ORG};
use crate::settings::Settings;
use anyhow::Result;
use chrono::Utc;
use k8s_openapi::{
  api::core::v1::{Container, ContainerPort, Pod, PodSpec, Service, ServicePort, ServiceSpec},
  apimachinery::pkg::apis::meta::v1::ObjectMeta,
  Resource,
};
use serde::Serialize;
use std::{collections::BTreeMap, sync::Arc};
use tracing::{info, instrument};

#[derive(Serialize, Default)]
#[serde(rename_all = "camelCase")]
struct ProfileStatus {
  ready: bool,
  expired: bool,
}

/// Trivial operator variant: one interactive browser pod plus its service,
/// torn down once the expiry time passes.
pub struct ProfileOperator {
  settings: Arc<Settings>,
}

impl ProfileOperator {
  pub fn new(settings: Arc<Settings>) -> Self {
    Self { settings }
  }

  fn to_child<T: Resource + Serialize>(object: &T) -> Result<serde_json::Value> {
    let mut value = serde_json::to_value(object)?;
    value["apiVersion"] = serde_json::json!(T::API_VERSION);
    value["kind"] = serde_json::json!(T::KIND);
    Ok(value)
  }

  #[instrument(skip(self, request))]
  pub async fn sync(&self, request: SyncRequest) -> Result<SyncResponse> {
    let spec: ProfileJobSpec =
      serde_json::from_value(request.parent.get("spec").cloned().unwrap_or_default())?;

    if request.finalizing || Utc::now() >= spec.expiry_time {
      if !request.finalizing {
        info!(profile_id = spec.id.as_str(), "Profile browser expired");
      }
      return Ok(SyncResponse {
        status: serde_json::to_value(ProfileStatus {
          ready: false,
          expired: true,
        })?,
        children: Vec::new(),
        resync_after_seconds: None,
        finalized: request.finalizing.then_some(true),
      });
    }

    let name = format!("profile-{}", spec.id);
    let labels = BTreeMap::from([
      ("btrix.profile".to_string(), spec.id.clone()),
      (LABEL_ORG.to_string(), spec.oid.to_string()),
    ]);

    let mut env = vec![
      serde_json::json!({"name": "START_URL", "value": spec.start_url}),
      serde_json::json!({"name": "ORG_ID", "value": spec.oid.to_string()}),
    ];
    if let Some(profile_filename) = &spec.profile_filename {
      env.push(serde_json::json!({"name": "PROFILE_FILENAME", "value": profile_filename}));
    }
    if let Some(base) = &spec.base_profile_filename {
      env.push(serde_json::json!({"name": "BASE_PROFILE_FILENAME", "value": base}));
    }

    let pod = Pod {
      metadata: ObjectMeta {
        name: Some(name.clone()),
        labels: Some(labels.clone()),
        ..Default::default()
      },
      spec: Some(PodSpec {
        restart_policy: Some("Never".to_string()),
        containers: vec![Container {
          name: "browser".to_string(),
          image: Some(self.settings.crawler.image.clone()),
          image_pull_policy: Some(self.settings.crawler.image_pull_policy.clone()),
          env: Some(serde_json::from_value(serde_json::Value::Array(env))?),
          ports: Some(vec![ContainerPort {
            container_port: 9223,
            ..Default::default()
          }]),
          ..Default::default()
        }],
        ..Default::default()
      }),
      ..Default::default()
    };

    let service = Service {
      metadata: ObjectMeta {
        name: Some(name),
        labels: Some(labels.clone()),
        ..Default::default()
      },
      spec: Some(ServiceSpec {
        selector: Some(labels),
        ports: Some(vec![ServicePort {
          port: 9223,
          ..Default::default()
        }]),
        ..Default::default()
      }),
      ..Default::default()
    };

    let ready = request
      .children_of_kind(super::models::POD)
      .any(|(_, pod)| pod["status"]["phase"] == "Running");

    Ok(SyncResponse {
      status: serde_json::to_value(ProfileStatus {
        ready,
        expired: false,
      })?,
      children: vec![Self::to_child(&pod)?, Self::to_child(&service)?],
      resync_after_seconds: Some(30.0),
      finalized: None,
    })
  }
}
