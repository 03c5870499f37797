use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::device::DeviceProfile;
use crate::error::{ConfigError, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct MirageConfig {
    pub behavior: BehaviorSection,
    #[serde(default)]
    pub devices: DeviceSection,
    pub pool: PoolSection,
    pub driver: DriverSection,
    pub observability: ObservabilitySection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BehaviorSection {
    pub click_probability: f64,
    pub scroll_probability: f64,
    pub scroll_depth_pct: [u8; 2],
    pub dwell_time_s: [f64; 2],
    pub click_delay_s: [f64; 2],
    #[serde(default = "default_search_queries")]
    pub search_queries: Vec<String>,
}

impl Default for BehaviorSection {
    fn default() -> Self {
        Self {
            click_probability: 0.7,
            scroll_probability: 0.5,
            scroll_depth_pct: [20, 80],
            dwell_time_s: [2.0, 10.0],
            click_delay_s: [0.5, 2.0],
            search_queries: default_search_queries(),
        }
    }
}

fn default_search_queries() -> Vec<String> {
    [
        "python programming",
        "web development",
        "data science",
        "machine learning",
        "software engineering",
        "artificial intelligence",
        "cloud computing",
        "cybersecurity",
    ]
    .iter()
    .map(|query| query.to_string())
    .collect()
}

/// Catalog override. An empty profile list keeps the built-in catalog.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeviceSection {
    #[serde(default)]
    pub profiles: Vec<DeviceProfile>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolSection {
    #[serde(default)]
    pub proxies: Vec<String>,
    #[serde(default = "default_rotation_policy")]
    pub rotation_policy: String,
    /// Self-populate a placeholder pool when no proxies are configured, so
    /// rotation and scoring stay exercisable without live egress resources.
    #[serde(default = "default_true")]
    pub synthetic_pool: bool,
}

fn default_rotation_policy() -> String {
    "least_used".to_string()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct DriverSection {
    pub executable_path: String,
    pub headless: bool,
    pub sandbox: bool,
    pub navigation_timeout_s: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilitySection {
    pub events_db: String,
}

pub fn load_mirage_config<P: AsRef<Path>>(path: P) -> Result<MirageConfig> {
    load_toml(path)
}

fn load_toml<T, P>(path: P) -> Result<T>
where
    T: DeserializeOwned,
    P: AsRef<Path>,
{
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        source,
        path: path.to_path_buf(),
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        source,
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn load_fixture_config() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("../configs/mirage.toml");
        let config = load_mirage_config(path).expect("fixture config should parse");
        assert_eq!(config.pool.rotation_policy, "least_used");
        assert!(config.pool.synthetic_pool);
        assert!(config.behavior.click_probability > 0.0);
        assert!(!config.behavior.search_queries.is_empty());
        assert_eq!(config.observability.events_db, "data/events.sqlite");
    }

    #[test]
    fn behavior_defaults_match_builtin_catalogue() {
        let section = BehaviorSection::default();
        assert_eq!(section.scroll_depth_pct, [20, 80]);
        assert_eq!(section.search_queries.len(), 8);
    }

    #[test]
    fn missing_file_reports_io_error() {
        let err = load_mirage_config("does/not/exist.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
