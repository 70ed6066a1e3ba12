//! Configuration tree for the proxy, loaded from a YAML file at boot.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

fn default_addr() -> String {
    "0.0.0.0:8082".to_string()
}

fn default_proxy_url() -> String {
    "http://127.0.0.1:8082/".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ProxyConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_proxy_url")]
    pub proxy_url: String,
    #[serde(default)]
    pub targets: Vec<String>,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            proxy_url: default_proxy_url(),
            targets: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LocalCacheConfig {
    pub cache_dir: PathBuf,
}

impl Default for LocalCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct MetaCacheConfig {
    pub shards: usize,
    pub life_window_secs: u64,
    pub clean_window_secs: u64,
    pub max_entries_in_window: u64,
    pub max_entry_size: u32,
}

impl Default for MetaCacheConfig {
    fn default() -> Self {
        Self {
            shards: 1024,
            life_window_secs: 24 * 60 * 60,
            clean_window_secs: 10,
            max_entries_in_window: 1000,
            max_entry_size: 4096,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RemoteCacheConfig {
    /// Key prefix prepended to every blob's basename in the remote store.
    pub cache_dir: String,
    pub concurrent: usize,
    pub store_url: String,
    #[serde(default)]
    pub store_options: Vec<(String, String)>,
}

impl Default for RemoteCacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: "huggingface/blobs/".to_string(),
            concurrent: 3,
            store_url: String::new(),
            store_options: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    pub proxy: ProxyConfig,
    pub local_cache: LocalCacheConfig,
    pub meta_cache: MetaCacheConfig,
    pub remote_cache: RemoteCacheConfig,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy: ProxyConfig::default(),
            local_cache: LocalCacheConfig::default(),
            meta_cache: MetaCacheConfig::default(),
            remote_cache: RemoteCacheConfig::default(),
            log_level: default_log_level(),
        }
    }
}

/// Loads the config from a YAML file on disk.
pub fn load<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("failed to parse config file {}", path.display()))?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let yaml = r#"
proxy:
  addr: "0.0.0.0:8082"
  proxy_url: "http://127.0.0.1:8082/"
  targets: ["https://huggingface.co"]
local_cache:
  cache_dir: "/tmp/cache"
meta_cache:
  shards: 1024
  life_window_secs: 86400
  clean_window_secs: 10
  max_entries_in_window: 1000
  max_entry_size: 4096
remote_cache:
  cache_dir: "huggingface/blobs/"
  concurrent: 3
  store_url: "s3://bucket"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.proxy.targets, vec!["https://huggingface.co"]);
        assert_eq!(config.remote_cache.concurrent, 3);
        assert_eq!(config.log_level, "info");
    }
}
