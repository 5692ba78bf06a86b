use std::path::Path;

use anyhow::{Context as _, Result};
use serde::Deserialize;

/// Configuration loaded from `flowmeta.yaml`.
/// All fields are optional; missing fields fall back to CLI/env/defaults.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FlowMetaConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// sqlx connection URL, e.g. `sqlite://data/flowmeta.db?mode=rwc`.
    pub database_url: Option<String>,
    pub max_connections: Option<u32>,
    /// Seconds to wait for a pooled connection before reporting unavailable.
    pub acquire_timeout_s: Option<u64>,
    pub max_body: Option<usize>,
}

impl FlowMetaConfig {
    /// Load configuration from a YAML file.
    ///
    /// - If `path` is `Some`, load that specific file (error if missing).
    /// - If `path` is `None`, auto-detect `flowmeta.yaml` in cwd; return defaults if absent.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let file_path = match path {
            Some(p) => {
                if !p.exists() {
                    anyhow::bail!("Config file not found: {}", p.display());
                }
                p.to_path_buf()
            }
            None => {
                let default_path = Path::new("flowmeta.yaml");
                if !default_path.exists() {
                    return Ok(Self::default());
                }
                default_path.to_path_buf()
            }
        };

        let contents = std::fs::read_to_string(&file_path)
            .with_context(|| format!("Failed to read config file: {}", file_path.display()))?;

        // An empty file parses as null; treat it like an empty mapping.
        if contents.trim().is_empty() {
            return Ok(Self::default());
        }

        let config: FlowMetaConfig = serde_yml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", file_path.display()))?;

        Ok(config)
    }
}
