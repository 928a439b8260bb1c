use super::models::{CrawlJobSpec, CrawlStatus, LABEL_CONFIG, LABEL_CRAWL, LABEL_ORG, MEM_LIMIT_PADDING};
use crate::{
  orgs::org::Organization, settings::CrawlerSettings, workflows::workflow::Workflow,
};
use anyhow::Result;
use k8s_openapi::{
  api::core::v1::{
    ConfigMap, ConfigMapEnvSource, Container, ContainerPort, EnvFromSource, EnvVar,
    PersistentVolumeClaim, PersistentVolumeClaimSpec, PersistentVolumeClaimVolumeSource, Pod,
    PodSpec, ResourceRequirements, Service, ServicePort, ServiceSpec, Volume, VolumeMount,
    VolumeResourceRequirements,
  },
  apimachinery::pkg::{api::resource::Quantity, apis::meta::v1::ObjectMeta},
  Resource,
};
use serde::Serialize;
use std::collections::BTreeMap;

const MIB: u64 = 1024 * 1024;

/// Everything the pure renderer needs to map a crawl spec onto children.
pub struct RenderParams<'a> {
  pub spec: &'a CrawlJobSpec,
  pub workflow: &'a Workflow,
  pub org: &'a Organization,
  pub status: &'a CrawlStatus,
  pub settings: &'a CrawlerSettings,
  pub redis_url: String,
  pub store_endpoint: String,
  pub include_redis: bool,
}

pub fn pod_count(browser_windows: u32, browsers_per_pod: u32) -> u32 {
  browser_windows.div_ceil(browsers_per_pod.max(1))
}

/// Browsers assigned to pod `index`; the last pod takes the remainder.
pub fn browsers_in_pod(browser_windows: u32, browsers_per_pod: u32, index: u32) -> u32 {
  let browsers_per_pod = browsers_per_pod.max(1);
  let full_pods = browser_windows / browsers_per_pod;
  if index < full_pods {
    return browsers_per_pod;
  }
  browser_windows % browsers_per_pod
}

/// Page limit handed to the crawler: the stricter of the workflow's limit and
/// the org's pages-per-crawl quota (zero means unlimited).
pub fn effective_page_limit(workflow_limit: u64, org_limit: u32) -> u64 {
  match (workflow_limit, org_limit as u64) {
    (0, 0) => 0,
    (limit, 0) => limit,
    (0, quota) => quota,
    (limit, quota) => limit.min(quota),
  }
}

pub fn crawl_labels(spec: &CrawlJobSpec) -> BTreeMap<String, String> {
  BTreeMap::from([
    (LABEL_CRAWL.to_string(), spec.id.clone()),
    (LABEL_ORG.to_string(), spec.oid.to_string()),
    (LABEL_CONFIG.to_string(), spec.cid.to_string()),
  ])
}

pub fn configmap_name(crawl_id: &str) -> String {
  format!("crawl-config-{}", crawl_id)
}

pub fn pod_name(crawl_id: &str, index: u32) -> String {
  format!("crawl-{}-{}", crawl_id, index)
}

pub fn pvc_name(crawl_id: &str, index: u32) -> String {
  format!("crawl-data-{}-{}", crawl_id, index)
}

pub fn redis_name(crawl_id: &str) -> String {
  format!("redis-{}", crawl_id)
}

fn to_child<T: Resource + Serialize>(object: &T) -> Result<serde_json::Value> {
  let mut value = serde_json::to_value(object)?;
  value["apiVersion"] = serde_json::json!(T::API_VERSION);
  value["kind"] = serde_json::json!(T::KIND);
  Ok(value)
}

fn render_configmap(params: &RenderParams) -> Result<serde_json::Value> {
  let spec = params.spec;
  let workflow = params.workflow;
  let mut data = BTreeMap::from([
    ("CRAWL_ID".to_string(), spec.id.clone()),
    ("ORG_ID".to_string(), spec.oid.to_string()),
    ("STORAGE_NAME".to_string(), spec.storage_name.clone()),
    ("SCOPE_TYPE".to_string(), workflow.scope_type.clone()),
    (
      "SEEDS".to_string(),
      serde_json::to_string(&workflow.seeds)?,
    ),
    (
      "EXCLUDE".to_string(),
      serde_json::to_string(&workflow.exclude)?,
    ),
    (
      "PAGE_LIMIT".to_string(),
      effective_page_limit(workflow.page_limit, params.org.quotas.max_pages_per_crawl).to_string(),
    ),
    ("SIZE_LIMIT".to_string(), spec.max_crawl_size.to_string()),
    ("TIME_LIMIT".to_string(), spec.timeout.to_string()),
    ("REDIS_URL".to_string(), params.redis_url.clone()),
    (
      "STORE_ENDPOINT_URL".to_string(),
      params.store_endpoint.clone(),
    ),
  ]);
  if let Some(seed_file_id) = &workflow.seed_file_id {
    data.insert("SEED_FILE_ID".to_string(), seed_file_id.to_string());
  }
  if !workflow.link_selectors.is_empty() {
    data.insert(
      "LINK_SELECTORS".to_string(),
      workflow.link_selectors.join(","),
    );
  }
  if !workflow.custom_behaviors.is_empty() {
    data.insert(
      "CUSTOM_BEHAVIORS".to_string(),
      serde_json::to_string(&workflow.custom_behaviors)?,
    );
  }
  if let Some(lang) = &workflow.lang {
    data.insert("LANG".to_string(), lang.clone());
  }
  if let Some(proxy_id) = &workflow.proxy_id {
    data.insert("PROXY_ID".to_string(), proxy_id.clone());
  }
  if let Some(profile_filename) = &spec.profile_filename {
    data.insert("PROFILE_FILENAME".to_string(), profile_filename.clone());
  }

  to_child(&ConfigMap {
    metadata: ObjectMeta {
      name: Some(configmap_name(&spec.id)),
      labels: Some(crawl_labels(spec)),
      ..Default::default()
    },
    data: Some(data),
    ..Default::default()
  })
}

fn render_pvc(params: &RenderParams, index: u32) -> Result<serde_json::Value> {
  to_child(&PersistentVolumeClaim {
    metadata: ObjectMeta {
      name: Some(pvc_name(&params.spec.id, index)),
      labels: Some(crawl_labels(params.spec)),
      ..Default::default()
    },
    spec: Some(PersistentVolumeClaimSpec {
      access_modes: Some(vec!["ReadWriteOnce".to_string()]),
      resources: Some(VolumeResourceRequirements {
        requests: Some(BTreeMap::from([(
          "storage".to_string(),
          Quantity(params.settings.pvc_size.clone()),
        )])),
        ..Default::default()
      }),
      ..Default::default()
    }),
    ..Default::default()
  })
}

fn render_crawler_pod(params: &RenderParams, index: u32) -> Result<serde_json::Value> {
  let spec = params.spec;
  let settings = params.settings;
  let name = pod_name(&spec.id, index);
  let browsers = browsers_in_pod(spec.browser_windows, settings.browsers_per_pod, index);

  let base_memory = settings.memory_base_mb * MIB * browsers.max(1) as u64;
  let memory = params
    .status
    .pod_status
    .get(&name)
    .and_then(|pod| pod.new_memory)
    .unwrap_or(base_memory);
  let memory_limit = (memory as f64 * MEM_LIMIT_PADDING) as u64;
  let cpu = settings.cpu_base_millis * browsers.max(1) as u64;

  let container = Container {
    name: "crawler".to_string(),
    image: Some(settings.image.clone()),
    image_pull_policy: Some(settings.image_pull_policy.clone()),
    env_from: Some(vec![EnvFromSource {
      config_map_ref: Some(ConfigMapEnvSource {
        name: configmap_name(&spec.id),
        ..Default::default()
      }),
      ..Default::default()
    }]),
    env: Some(vec![
      EnvVar {
        name: "POD_INDEX".to_string(),
        value: Some(index.to_string()),
        ..Default::default()
      },
      EnvVar {
        name: "NUM_BROWSERS".to_string(),
        value: Some(browsers.to_string()),
        ..Default::default()
      },
    ]),
    volume_mounts: Some(vec![VolumeMount {
      name: "crawl-data".to_string(),
      mount_path: "/crawls".to_string(),
      ..Default::default()
    }]),
    resources: Some(ResourceRequirements {
      requests: Some(BTreeMap::from([
        ("memory".to_string(), Quantity(memory.to_string())),
        ("cpu".to_string(), Quantity(format!("{}m", cpu))),
      ])),
      limits: Some(BTreeMap::from([(
        "memory".to_string(),
        Quantity(memory_limit.to_string()),
      )])),
      ..Default::default()
    }),
    ..Default::default()
  };

  to_child(&Pod {
    metadata: ObjectMeta {
      name: Some(name),
      labels: Some(crawl_labels(spec)),
      ..Default::default()
    },
    spec: Some(PodSpec {
      restart_policy: Some("OnFailure".to_string()),
      containers: vec![container],
      volumes: Some(vec![Volume {
        name: "crawl-data".to_string(),
        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
          claim_name: pvc_name(&spec.id, index),
          ..Default::default()
        }),
        ..Default::default()
      }]),
      ..Default::default()
    }),
    ..Default::default()
  })
}

fn render_redis(params: &RenderParams) -> Result<Vec<serde_json::Value>> {
  let spec = params.spec;
  let mut labels = crawl_labels(spec);
  labels.insert("role".to_string(), "redis".to_string());

  let pod = Pod {
    metadata: ObjectMeta {
      name: Some(redis_name(&spec.id)),
      labels: Some(labels.clone()),
      ..Default::default()
    },
    spec: Some(PodSpec {
      restart_policy: Some("Always".to_string()),
      containers: vec![Container {
        name: "redis".to_string(),
        image: Some(params.settings.redis_image.clone()),
        ports: Some(vec![ContainerPort {
          container_port: 6379,
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
      name: Some(redis_name(&spec.id)),
      labels: Some(crawl_labels(spec)),
      ..Default::default()
    },
    spec: Some(ServiceSpec {
      selector: Some(labels),
      ports: Some(vec![ServicePort {
        port: 6379,
        ..Default::default()
      }]),
      ..Default::default()
    }),
    ..Default::default()
  };

  Ok(vec![to_child(&pod)?, to_child(&service)?])
}

/// Pure mapping from crawl spec + environment to the desired children list.
pub fn render_crawl_children(params: &RenderParams) -> Result<Vec<serde_json::Value>> {
  let mut children = vec![render_configmap(params)?];
  let count = pod_count(
    params.spec.browser_windows,
    params.settings.browsers_per_pod,
  );
  for index in 0..count {
    children.push(render_pvc(params, index)?);
    children.push(render_crawler_pod(params, index)?);
  }
  if params.include_redis {
    children.extend(render_redis(params)?);
  }
  Ok(children)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::operator::models::PodInfo;
  use uuid::Uuid;

  fn test_params<'a>(
    spec: &'a CrawlJobSpec,
    workflow: &'a Workflow,
    org: &'a Organization,
    status: &'a CrawlStatus,
    settings: &'a CrawlerSettings,
  ) -> RenderParams<'a> {
    RenderParams {
      spec,
      workflow,
      org,
      status,
      settings,
      redis_url: "redis://redis-c1.crawlers:6379/0".to_string(),
      store_endpoint: "http://crawlplane.default:8756".to_string(),
      include_redis: true,
    }
  }

  fn test_spec(browser_windows: u32) -> CrawlJobSpec {
    serde_json::from_value(serde_json::json!({
      "id": "c1",
      "configId": Uuid::new_v4().to_string(),
      "orgId": Uuid::new_v4().to_string(),
      "browserWindows": browser_windows,
    }))
    .unwrap()
  }

  fn test_settings() -> CrawlerSettings {
    CrawlerSettings {
      namespace: "crawlers".to_string(),
      image: "crawler:1".to_string(),
      image_pull_policy: "IfNotPresent".to_string(),
      browsers_per_pod: 2,
      max_crawl_scale: 3,
      pvc_size: "25Gi".to_string(),
      memory_base_mb: 700,
      cpu_base_millis: 900,
      redis_image: "redis:7-alpine".to_string(),
    }
  }

  #[test]
  fn test_pod_count_rounds_up() {
    assert_eq!(pod_count(1, 2), 1);
    assert_eq!(pod_count(2, 2), 1);
    assert_eq!(pod_count(3, 2), 2);
    assert_eq!(pod_count(5, 2), 3);
  }

  #[test]
  fn test_browsers_in_last_pod() {
    assert_eq!(browsers_in_pod(5, 2, 0), 2);
    assert_eq!(browsers_in_pod(5, 2, 1), 2);
    assert_eq!(browsers_in_pod(5, 2, 2), 1);
  }

  #[test]
  fn test_effective_page_limit() {
    assert_eq!(effective_page_limit(0, 0), 0);
    assert_eq!(effective_page_limit(100, 0), 100);
    assert_eq!(effective_page_limit(0, 50), 50);
    assert_eq!(effective_page_limit(100, 50), 50);
    assert_eq!(effective_page_limit(20, 50), 20);
  }

  #[test]
  fn test_render_children_shape() {
    let spec = test_spec(3);
    let workflow = Workflow {
      seeds: vec![crate::workflows::workflow::Seed::new("https://webrecorder.net/")],
      scope_type: "prefix".to_string(),
      ..Default::default()
    };
    let org = Organization::default();
    let status = CrawlStatus::default();
    let settings = test_settings();
    let params = test_params(&spec, &workflow, &org, &status, &settings);

    let children = render_crawl_children(&params).unwrap();
    // 1 configmap + 2 * (pvc + pod) + redis pod + redis service
    assert_eq!(children.len(), 1 + 4 + 2);

    let pod = children
      .iter()
      .find(|child| child["kind"] == "Pod" && child["metadata"]["name"] == "crawl-c1-0")
      .unwrap();
    assert_eq!(pod["metadata"]["labels"]["btrix.crawl"], "c1");
    assert_eq!(pod["apiVersion"], "v1");

    let requests = &pod["spec"]["containers"][0]["resources"]["requests"];
    let limits = &pod["spec"]["containers"][0]["resources"]["limits"];
    let requested: u64 = requests["memory"].as_str().unwrap().parse().unwrap();
    let limit: u64 = limits["memory"].as_str().unwrap().parse().unwrap();
    assert_eq!(requested, 700 * MIB * 2);
    assert_eq!(limit, (requested as f64 * MEM_LIMIT_PADDING) as u64);
  }

  #[test]
  fn test_render_without_redis() {
    let spec = test_spec(1);
    let workflow = Workflow::default();
    let org = Organization::default();
    let status = CrawlStatus::default();
    let settings = test_settings();
    let mut params = test_params(&spec, &workflow, &org, &status, &settings);
    params.include_redis = false;

    let children = render_crawl_children(&params).unwrap();
    assert!(children.iter().all(|child| child["kind"] != "Service"));
    assert_eq!(children.len(), 3);
  }

  #[test]
  fn test_new_memory_override_changes_requests() {
    let spec = test_spec(2);
    let workflow = Workflow::default();
    let org = Organization::default();
    let mut status = CrawlStatus::default();
    status.pod_status.insert(
      "crawl-c1-0".to_string(),
      PodInfo {
        new_memory: Some(2_000_000_000),
        ..Default::default()
      },
    );
    let settings = test_settings();
    let params = test_params(&spec, &workflow, &org, &status, &settings);

    let children = render_crawl_children(&params).unwrap();
    let pod = children
      .iter()
      .find(|child| child["kind"] == "Pod" && child["metadata"]["name"] == "crawl-c1-0")
      .unwrap();
    let requested: u64 = pod["spec"]["containers"][0]["resources"]["requests"]["memory"]
      .as_str()
      .unwrap()
      .parse()
      .unwrap();
    assert_eq!(requested, 2_000_000_000);
  }
}
