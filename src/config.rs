//! Explicit configuration threaded into constructors. There is no ambient
//! process-wide settings object; a graph or a pipeline owns its own copy.

use camino::{Utf8Path, Utf8PathBuf};
use serde::{Deserialize, Serialize};

/// Configuration for a [`TaskGraph`](crate::TaskGraph): where signature
/// tokens live and how many workers pull from the ready queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphConfig {
    /// Directory holding per-task signature token files.
    pub cache_dir: Utf8PathBuf,
    /// Worker pool size. Clamped to a minimum of 1.
    pub workers: usize,
}

impl GraphConfig {
    pub fn new(cache_dir: impl AsRef<Utf8Path>, workers: usize) -> Self {
        Self {
            cache_dir: cache_dir.as_ref().to_owned(),
            workers: workers.max(1),
        }
    }
}

/// Configuration for the stormwater pipeline driver. Loadable from a JSON
/// file; every parameter arrives as a plain value before the graph starts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Workspace directory receiving every produced raster and the
    /// aggregated watershed vector.
    pub workspace: Utf8PathBuf,
    /// Worker pool size for the task graph.
    #[serde(default = "default_workers")]
    pub workers: usize,
    /// Replacement cost of retention devices, in currency units per m³.
    /// Valuation is skipped when absent.
    #[serde(default)]
    pub replacement_cost: Option<f64>,
    /// Whether an unknown land-cover code fails the run instead of
    /// producing nodata.
    #[serde(default)]
    pub strict_reclassify: bool,
}

fn default_workers() -> usize {
    1
}

impl PipelineConfig {
    pub fn new(workspace: impl AsRef<Utf8Path>) -> Self {
        Self {
            workspace: workspace.as_ref().to_owned(),
            workers: default_workers(),
            replacement_cost: None,
            strict_reclassify: false,
        }
    }

    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    pub(crate) fn graph_config(&self) -> GraphConfig {
        GraphConfig::new(self.workspace.join(".cache"), self.workers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workers_clamp_to_one() {
        let config = GraphConfig::new("cache", 0);
        assert_eq!(config.workers, 1);
    }

    #[test]
    fn pipeline_config_from_json() {
        let config = PipelineConfig::from_json(
            r#"{ "workspace": "out", "workers": 4, "replacement_cost": 1.28 }"#,
        )
        .unwrap();
        assert_eq!(config.workers, 4);
        assert_eq!(config.replacement_cost, Some(1.28));
        assert!(!config.strict_reclassify);
    }
}
