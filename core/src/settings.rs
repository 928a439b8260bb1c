use std::env;

fn env_or(key: &str, default: &str) -> String {
  env::var(key).unwrap_or_else(|_| default.to_string())
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct RedisSettings {
  pub url: String,
  pub max_pool_size: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct SqliteSettings {
  pub dir: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct TracingSettings {
  pub otel_collector_endpoint: String,
  pub service_name: String,
  pub host_name: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct CrawlerSettings {
  pub namespace: String,
  pub image: String,
  pub image_pull_policy: String,
  pub browsers_per_pod: u32,
  pub max_crawl_scale: u32,
  pub pvc_size: String,
  pub memory_base_mb: u64,
  pub cpu_base_millis: u64,
  pub redis_image: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct OperatorSettings {
  pub default_namespace: String,
  pub webhook_port: u16,
  pub paused_expiry_minutes: u32,
  pub app_origin: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct JobsSettings {
  pub concurrency: u32,
  pub replica_deletion_delay_days: u32,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct StorageSettings {
  pub endpoint: String,
  pub region: String,
  pub key: String,
  pub secret: String,
  pub presign_duration_secs: u32,
  pub replica_buckets: Vec<String>,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct KubeApiSettings {
  pub api_url: String,
  pub token_path: String,
}

#[derive(Debug, Clone, Default, serde_derive::Deserialize, PartialEq, Eq)]
pub struct Settings {
  pub redis: RedisSettings,
  pub sqlite: SqliteSettings,
  pub tracing: TracingSettings,
  pub crawler: CrawlerSettings,
  pub operator: OperatorSettings,
  pub jobs: JobsSettings,
  pub storage: StorageSettings,
  pub kube: KubeApiSettings,
}

impl Settings {
  pub fn new() -> Result<Self, config::ConfigError> {
    let s = config::Config::builder()
      .add_source(config::Environment::default().separator("__"))
      .set_default("redis.url", env_or("REDIS_URL", "redis://localhost:6379"))?
      .set_default("redis.max_pool_size", 10)?
      .set_default("sqlite.dir", env_or("SQLITE_DIR", "./data"))?
      .set_default(
        "tracing.otel_collector_endpoint",
        env_or("OTEL_COLLECTOR_ENDPOINT", "http://localhost:4317"),
      )?
      .set_default("tracing.service_name", "crawlplane")?
      .set_default("tracing.host_name", env_or("HOSTNAME", "localhost"))?
      .set_default("crawler.namespace", env_or("CRAWLER_NAMESPACE", "crawlers"))?
      .set_default(
        "crawler.image",
        env_or("CRAWLER_IMAGE", "webrecorder/browsertrix-crawler:latest"),
      )?
      .set_default(
        "crawler.image_pull_policy",
        env_or("CRAWLER_IMAGE_PULL_POLICY", "IfNotPresent"),
      )?
      .set_default("crawler.browsers_per_pod", env_or("NUM_BROWSERS", "2"))?
      .set_default("crawler.max_crawl_scale", env_or("MAX_CRAWL_SCALE", "3"))?
      .set_default("crawler.pvc_size", "25Gi")?
      .set_default("crawler.memory_base_mb", 700)?
      .set_default("crawler.cpu_base_millis", 900)?
      .set_default("crawler.redis_image", "redis:7-alpine")?
      .set_default(
        "operator.default_namespace",
        env_or("DEFAULT_NAMESPACE", "default"),
      )?
      .set_default("operator.webhook_port", 8756)?
      .set_default("operator.paused_expiry_minutes", 10080)?
      .set_default("operator.app_origin", env_or("APP_ORIGIN", ""))?
      .set_default("jobs.concurrency", 8)?
      .set_default(
        "jobs.replica_deletion_delay_days",
        env_or("REPLICA_DELETION_DELAY_DAYS", "0"),
      )?
      .set_default("storage.endpoint", "http://localhost:9000")?
      .set_default("storage.region", "us-east-1")?
      .set_default("storage.key", "")?
      .set_default("storage.secret", "")?
      .set_default("storage.presign_duration_secs", 3600)?
      .set_default("storage.replica_buckets", Vec::<String>::new())?
      .set_default(
        "kube.api_url",
        env_or("KUBE_API_URL", "https://kubernetes.default.svc"),
      )?
      .set_default(
        "kube.token_path",
        "/var/run/secrets/kubernetes.io/serviceaccount/token",
      )?
      .build()?;

    s.try_deserialize()
  }
}
