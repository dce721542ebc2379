//! Optimizer configuration.
//!
//! Every field has a default, so a JSON file only needs the keys it changes. CLI flags are
//! applied on top of whatever the file provides.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use sieve_analysis::AnalysisConfig;
use sieve_core::disasm::{BuiltinDisassembler, Disassembler, ExternalDisassembler};
use sieve_verification::ReachabilityConfig;
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimizerConfig {
    /// Wall-clock limit for path enumeration.
    pub path_search_timeout_secs: u64,
    pub max_paths: usize,
    /// Per-path solver limit. An `unknown` answer keeps the path.
    pub solver_timeout_ms: u64,
    /// Block visits the repair walk may spend.
    pub repair_visit_budget: usize,
    /// Stack of the pipeline thread, in MiB.
    pub stack_size_mb: usize,
    /// External disassembler: program then arguments, with `{input}` and `{output_dir}`
    /// placeholders. `None` selects the built-in splitter.
    pub disassembler: Option<Vec<String>>,
    pub disassembler_timeout_secs: u64,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        let analysis = AnalysisConfig::default();
        Self {
            path_search_timeout_secs: analysis.path_search_timeout.as_secs(),
            max_paths: analysis.max_paths,
            solver_timeout_ms: ReachabilityConfig::default().solver_timeout_ms,
            repair_visit_budget: analysis.repair_visit_budget,
            stack_size_mb: 512,
            disassembler: None,
            disassembler_timeout_secs: 120,
        }
    }
}

impl OptimizerConfig {
    /// Reads a JSON configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_paths == 0 {
            return Err(Error::Config("max_paths must be positive".into()));
        }
        if self.stack_size_mb == 0 {
            return Err(Error::Config("stack_size_mb must be positive".into()));
        }
        if self.disassembler.as_ref().is_some_and(Vec::is_empty) {
            return Err(Error::Config("disassembler command is empty".into()));
        }
        Ok(())
    }

    pub fn analysis(&self) -> AnalysisConfig {
        AnalysisConfig {
            path_search_timeout: Duration::from_secs(self.path_search_timeout_secs),
            max_paths: self.max_paths,
            repair_visit_budget: self.repair_visit_budget,
        }
    }

    pub fn reachability(&self) -> ReachabilityConfig {
        ReachabilityConfig {
            solver_timeout_ms: self.solver_timeout_ms,
        }
    }

    pub fn stack_size_bytes(&self) -> usize {
        self.stack_size_mb.saturating_mul(1 << 20)
    }

    /// The disassembler this configuration selects.
    pub fn disassembler(&self) -> Result<Box<dyn Disassembler>> {
        match &self.disassembler {
            None => Ok(Box::new(BuiltinDisassembler)),
            Some(command) => Ok(Box::new(ExternalDisassembler::new(
                command.clone(),
                Duration::from_secs(self.disassembler_timeout_secs),
            )?)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_paths": 12, "disassembler": ["tool", "{{input}}"]}}"#).unwrap();

        let config = OptimizerConfig::load(file.path()).unwrap();
        assert_eq!(config.max_paths, 12);
        assert_eq!(config.path_search_timeout_secs, 600);
        assert_eq!(config.solver_timeout_ms, 10_000);
        assert_eq!(config.stack_size_mb, 512);
        assert_eq!(
            config.disassembler,
            Some(vec!["tool".to_string(), "{input}".to_string()])
        );
        assert_eq!(config.analysis().max_paths, 12);
    }

    #[test]
    fn rejects_zero_path_cap() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"max_paths": 0}}"#).unwrap();
        assert!(matches!(
            OptimizerConfig::load(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn selects_builtin_by_default() {
        let config = OptimizerConfig::default();
        assert_eq!(config.disassembler().unwrap().name(), "builtin");
        assert_eq!(config.stack_size_bytes(), 512 << 20);
    }
}
