//! `loadfleet.toml` loading and environment overrides.

use loadfleet_coordinator::TlsConfig;
use loadfleet_core::{LoadfleetError, LoadfleetResult, ProjectId};
use serde::Deserialize;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Default, Deserialize)]
pub struct LoadfleetConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Deserialize)]
pub struct CoordinatorConfig {
    /// Namespace the project's engines run in.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default)]
    pub project_id: String,
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_files_root")]
    pub files_root: PathBuf,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_inventory_interval")]
    pub inventory_interval_secs: u64,
    #[serde(default = "default_endpoints_file")]
    pub endpoints_file: PathBuf,
    #[serde(default)]
    pub tls: TlsConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            project_id: String::new(),
            listen_addr: default_listen_addr(),
            api_key: String::new(),
            files_root: default_files_root(),
            log_level: default_log_level(),
            inventory_interval_secs: default_inventory_interval(),
            endpoints_file: default_endpoints_file(),
            tls: TlsConfig::default(),
        }
    }
}

fn default_namespace() -> String {
    "loadfleet-executors".to_string()
}
fn default_listen_addr() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_files_root() -> PathBuf {
    PathBuf::from("/coordinator/files")
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_inventory_interval() -> u64 {
    3
}
fn default_endpoints_file() -> PathBuf {
    PathBuf::from("endpoints.json")
}

impl CoordinatorConfig {
    /// Override file values with `POD_NAMESPACE`, `project_id`, `log_level`,
    /// `listen_addr` and `api_key`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let set = |target: &mut String, key: &str| {
            if let Some(v) = lookup(key).filter(|v| !v.is_empty()) {
                *target = v;
            }
        };
        set(&mut self.namespace, "POD_NAMESPACE");
        set(&mut self.project_id, "project_id");
        set(&mut self.log_level, "log_level");
        set(&mut self.listen_addr, "listen_addr");
        set(&mut self.api_key, "api_key");
    }

    pub fn project_id(&self) -> LoadfleetResult<ProjectId> {
        self.project_id.trim().parse().map_err(|_| {
            LoadfleetError::Config(format!("invalid project_id '{}'", self.project_id))
        })
    }

    /// The tracing filter directive; anything other than `debug` means `info`.
    pub fn log_filter(&self) -> &'static str {
        if self.log_level.eq_ignore_ascii_case("debug") {
            "debug"
        } else {
            "info"
        }
    }

    pub fn inventory_interval(&self) -> Duration {
        Duration::from_secs(self.inventory_interval_secs.max(1))
    }
}

impl LoadfleetConfig {
    /// Read the config file. A missing file yields the defaults.
    pub async fn load(path: &Path) -> LoadfleetResult<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(LoadfleetError::Config(format!(
                "Failed to read config file '{}': {e}",
                path.display()
            ))),
        }
    }

    pub fn parse(raw: &str) -> LoadfleetResult<Self> {
        toml::from_str(raw).map_err(|e| LoadfleetError::Config(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_parse_full_file() {
        let config = LoadfleetConfig::parse(
            r#"
            [coordinator]
            namespace = "perf"
            project_id = "12"
            listen_addr = "127.0.0.1:9000"
            api_key = "secret"
            files_root = "/tmp/files"
            log_level = "debug"
            inventory_interval_secs = 5
            endpoints_file = "eps.json"

            [coordinator.tls]
            enabled = true
            cert_path = "/tls/tls.crt"
            key_path = "/tls/tls.key"
            "#,
        )
        .unwrap();
        let c = &config.coordinator;
        assert_eq!(c.namespace, "perf");
        assert_eq!(c.project_id().unwrap(), 12);
        assert_eq!(c.listen_addr, "127.0.0.1:9000");
        assert_eq!(c.files_root, PathBuf::from("/tmp/files"));
        assert_eq!(c.log_filter(), "debug");
        assert_eq!(c.inventory_interval(), Duration::from_secs(5));
        assert!(c.tls.enabled);
        assert_eq!(c.tls.cert_path, PathBuf::from("/tls/tls.crt"));
        assert_eq!(c.tls.key_path, PathBuf::from("/tls/tls.key"));
    }

    #[test]
    fn test_defaults() {
        let config = LoadfleetConfig::parse("").unwrap();
        let c = &config.coordinator;
        assert_eq!(c.namespace, "loadfleet-executors");
        assert_eq!(c.listen_addr, "0.0.0.0:8080");
        assert_eq!(c.log_filter(), "info");
        assert_eq!(c.inventory_interval(), Duration::from_secs(3));
        assert!(!c.tls.enabled);
        assert!(c.project_id().is_err());
    }

    #[test]
    fn test_env_overrides_file() {
        let mut c = LoadfleetConfig::parse("[coordinator]\nproject_id = \"1\"\napi_key = \"file\"")
            .unwrap()
            .coordinator;
        let env: HashMap<&str, &str> = HashMap::from([
            ("POD_NAMESPACE", "ns-7"),
            ("project_id", "7"),
            ("api_key", "env"),
            ("log_level", ""),
        ]);
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.namespace, "ns-7");
        assert_eq!(c.project_id().unwrap(), 7);
        assert_eq!(c.api_key, "env");
        assert_eq!(c.log_level, "info");
    }

    #[test]
    fn test_unknown_log_level_means_info() {
        let c = CoordinatorConfig {
            log_level: "trace".into(),
            ..Default::default()
        };
        assert_eq!(c.log_filter(), "info");
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let config = LoadfleetConfig::load(&tmp.path().join("absent.toml")).await.unwrap();
        assert_eq!(config.coordinator.listen_addr, "0.0.0.0:8080");
    }
}
