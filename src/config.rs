use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::analysis::{MarkingGraphConfig, ReplayConfig, TerminationCriteria};

/// `pn.toml` 中的分析参数. 缺省字段取默认值, 文件不存在时整体取默认值.
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
pub struct AnalysisConfig {
    #[serde(default = "default_state_limit")]
    pub state_limit: Option<usize>,
    #[serde(default)]
    pub include_zero_tokens: bool,
    #[serde(default)]
    pub termination: TerminationCriteria,
    #[serde(default = "default_max_states_per_trace")]
    pub max_states_per_trace: Option<usize>,
    /// 分析线程池大小; 0 表示使用 rayon 全局线程池.
    #[serde(default)]
    pub threads: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            state_limit: default_state_limit(),
            include_zero_tokens: false,
            termination: TerminationCriteria::default(),
            max_states_per_trace: default_max_states_per_trace(),
            threads: 0,
        }
    }
}

impl AnalysisConfig {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            log::debug!("config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        let config: AnalysisConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;
        Ok(config)
    }

    pub fn marking_graph(&self) -> MarkingGraphConfig {
        MarkingGraphConfig {
            state_limit: self.state_limit,
            include_zero_tokens: self.include_zero_tokens,
        }
    }

    pub fn replay(&self) -> ReplayConfig {
        ReplayConfig {
            termination: self.termination,
            max_states_per_trace: self.max_states_per_trace,
        }
    }

    /// 需要专用线程池时构造之.
    pub fn thread_pool(&self) -> Result<Option<rayon::ThreadPool>> {
        if self.threads == 0 {
            return Ok(None);
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("pn-analysis-{}", i))
            .build()
            .context("Failed to build analysis thread pool")?;
        Ok(Some(pool))
    }
}

fn default_state_limit() -> Option<usize> {
    MarkingGraphConfig::default().state_limit
}

fn default_max_states_per_trace() -> Option<usize> {
    ReplayConfig::default().max_states_per_trace
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AnalysisConfig::load_from_file(dir.path().join("pn.toml")).unwrap();
        assert_eq!(config, AnalysisConfig::default());
        assert_eq!(config.state_limit, Some(10_000));
        assert_eq!(config.max_states_per_trace, Some(100_000));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pn.toml");
        fs::write(&path, "state_limit = 42\ntermination = \"NoEnabledTransitions\"\n").unwrap();
        let config = AnalysisConfig::load_from_file(&path).unwrap();
        assert_eq!(config.marking_graph().state_limit, Some(42));
        assert_eq!(config.replay().termination, TerminationCriteria::NoEnabledTransitions);
        assert_eq!(config.max_states_per_trace, Some(100_000));
        assert!(config.thread_pool().unwrap().is_none());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pn.toml");
        fs::write(&path, "state_limit = \"many\"").unwrap();
        let err = AnalysisConfig::load_from_file(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));
    }
}
