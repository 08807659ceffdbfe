use serde::Deserialize;
use std::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Postgres,
    /// Process-local document, nothing survives a restart.
    Memory,
}

fn default_max_connections() -> u32 {
    5
}

fn default_document_id() -> String {
    "shared-data".to_string()
}

fn default_notify_channel() -> String {
    "meter_documents".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    /// Required for the postgres backend.
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    #[serde(default = "default_document_id")]
    pub document_id: String,
    #[serde(default = "default_notify_channel")]
    pub notify_channel: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub bind_addr: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub store: StoreConfig,
    pub api: ApiConfig,
    pub metrics: Option<MetricsConfig>,
}

impl AppConfig {
    pub fn load() -> anyhow::Result<Self> {
        use std::env;

        let path = env::var("METER_CONFIG").unwrap_or_else(|_| "meter-config.toml".to_string());
        let contents = fs::read_to_string(&path)
            .map_err(|e| anyhow::anyhow!("failed to read config {path}: {e}"))?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> anyhow::Result<Self> {
        let cfg: AppConfig = toml::from_str(contents)?;
        if cfg.store.backend == StoreBackend::Postgres && cfg.store.uri.is_none() {
            anyhow::bail!("store.uri is required for the postgres backend");
        }
        Ok(cfg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_defaults_apply() {
        let cfg = AppConfig::from_toml(
            r#"
            [store]
            backend = "postgres"
            uri = "postgres://meters@localhost/meters"

            [api]
            bind_addr = "127.0.0.1:8080"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.store.backend, StoreBackend::Postgres);
        assert_eq!(cfg.store.max_connections, 5);
        assert_eq!(cfg.store.document_id, "shared-data");
        assert_eq!(cfg.store.notify_channel, "meter_documents");
        assert!(cfg.metrics.is_none());
    }

    #[test]
    fn postgres_backend_needs_uri() {
        let err = AppConfig::from_toml(
            r#"
            [store]
            backend = "postgres"

            [api]
            bind_addr = "127.0.0.1:8080"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("store.uri"));
    }

    #[test]
    fn memory_backend_with_metrics() {
        let cfg = AppConfig::from_toml(
            r#"
            [store]
            backend = "memory"

            [api]
            bind_addr = "0.0.0.0:8080"

            [metrics]
            bind_addr = "0.0.0.0:9100"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.store.backend, StoreBackend::Memory);
        assert_eq!(cfg.metrics.unwrap().bind_addr, "0.0.0.0:9100");
    }
}
