use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// tunables for one download. every field has a default so a config file only needs the keys
/// it wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// number of pieces we must own before switching from random to strict rarest-first.
    pub rarest_first_cutoff: usize,
    /// requests longer than this close the connection.
    pub max_slice_length: u32,
    /// global upload cap in bytes/sec, 0 means unlimited.
    pub max_upload_rate: u64,
    /// bytes handed to one connection per rate limiter quantum.
    pub upload_unit_size: usize,
    /// seconds over which transfer rates are averaged.
    pub max_rate_period: f64,
    pub upload_rate_fudge: f64,
    /// averaging window of the second, slower upload total.
    pub max_rate_period_seedtime: f64,
    pub max_uploads: usize,
    pub round_robin_period: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            rarest_first_cutoff: 4,
            max_slice_length: 1 << 17,
            max_upload_rate: 0,
            upload_unit_size: 1380,
            max_rate_period: 20.0,
            upload_rate_fudge: 5.0,
            max_rate_period_seedtime: 100.0,
            max_uploads: 4,
            round_robin_period: 10.0,
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        use anyhow::Context as _;

        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        Self::from_json_str(&raw).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn round_robin_interval(&self) -> Duration {
        Duration::from_secs_f64(self.round_robin_period.max(0.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{ "rarest_first_cutoff": 0, "max_uploads": 7 }"#)
            .unwrap();
        assert_eq!(config.rarest_first_cutoff, 0);
        assert_eq!(config.max_uploads, 7);
        assert_eq!(config.max_slice_length, EngineConfig::default().max_slice_length);
    }

    #[test]
    fn unknown_types_are_rejected() {
        assert!(EngineConfig::from_json_str(r#"{ "max_uploads": "four" }"#).is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = EngineConfig::from_json_file("/nonexistent/swarm.json").unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/swarm.json"));
    }
}
