use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// One host-mapping rule: actions whose hint payload contains `tag` (a
/// substring match) are preferentially routed to one of `hosts`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostMappingRule {
    pub tag: String,
    pub hosts: Vec<String>,
}

fn default_host() -> String {
    "coordinatool".to_string()
}

fn default_port() -> u16 {
    5123
}

fn default_kv_host() -> String {
    "localhost".to_string()
}

fn default_kv_port() -> u16 {
    6379
}

fn default_client_grace_ms() -> u64 {
    10_000
}

fn default_batch_slots() -> u32 {
    0
}

fn default_batch_slice_idle_ms() -> u64 {
    0
}

fn default_batch_slice_max_ms() -> u64 {
    0
}

/// All coordinator configuration, loadable from a file and overridable by
/// `COORDINATOOL_*` environment variables (see [`load`]).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoordinatorConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_kv_host")]
    pub kv_store_host: String,
    #[serde(default = "default_kv_port")]
    pub kv_store_port: u16,

    #[serde(default = "default_client_grace_ms")]
    pub client_grace_ms: u64,

    #[serde(default = "default_batch_slots")]
    pub batch_slots: u32,
    #[serde(default = "default_batch_slice_idle_ms")]
    pub batch_slice_idle_ms: u64,
    #[serde(default = "default_batch_slice_max_ms")]
    pub batch_slice_max_ms: u64,

    #[serde(default)]
    pub archive_ids: Vec<u32>,

    #[serde(default)]
    pub reporting_dir: Option<String>,
    #[serde(default)]
    pub reporting_hint: Option<String>,

    #[serde(default)]
    pub state_dir_prefix: Option<String>,

    #[serde(default)]
    pub host_mapping: Vec<HostMappingRule>,

    #[serde(default)]
    pub verbosity: i32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            kv_store_host: default_kv_host(),
            kv_store_port: default_kv_port(),
            client_grace_ms: default_client_grace_ms(),
            batch_slots: default_batch_slots(),
            batch_slice_idle_ms: default_batch_slice_idle_ms(),
            batch_slice_max_ms: default_batch_slice_max_ms(),
            archive_ids: Vec::new(),
            reporting_dir: None,
            reporting_hint: None,
            state_dir_prefix: None,
            host_mapping: Vec::new(),
            verbosity: 0,
        }
    }
}

/// Load configuration from an optional file, then layer `COORDINATOOL_*`
/// environment variables over it, matching the precedence of
/// `copytool/config.c`'s `config_init` (defaults, then file, then env).
pub fn load(conf_path: Option<&Path>) -> Result<CoordinatorConfig, ConfigError> {
    let mut builder = config::Config::builder();

    if let Some(path) = conf_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path));
        } else {
            tracing::info!(path = %path.display(), "config file not found, skipping");
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("COORDINATOOL")
            .separator("__")
            .try_parsing(true)
            .list_separator(","),
    );

    let settings = builder.build()?;
    Ok(settings.try_deserialize()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_original_coordinatool() {
        let cfg = CoordinatorConfig::default();
        assert_eq!(cfg.port, 5123);
        assert_eq!(cfg.kv_store_port, 6379);
        assert_eq!(cfg.client_grace_ms, 10_000);
        assert_eq!(cfg.batch_slots, 0);
    }

    #[test]
    fn file_overrides_defaults_and_env_overrides_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("coordinatool.toml");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "host = \"fromfile\"").unwrap();
        writeln!(f, "port = 6000").unwrap();
        drop(f);

        // SAFETY: test-only process-wide env mutation, no other thread reads it concurrently.
        unsafe {
            std::env::set_var("COORDINATOOL_PORT", "7000");
        }
        let cfg = load(Some(&path)).unwrap();
        unsafe {
            std::env::remove_var("COORDINATOOL_PORT");
        }

        assert_eq!(cfg.host, "fromfile");
        assert_eq!(cfg.port, 7000);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = load(Some(Path::new("/nonexistent/coordinatool.toml"))).unwrap();
        assert_eq!(cfg, CoordinatorConfig::default());
    }
}
