//! Per-contract JSON report.

use crate::Result;
use crate::pipeline::{Optimization, OptimizationResult, SkipReason};
use serde::{Deserialize, Serialize};
use sieve_verification::InvalidVerdict;
use std::path::Path;
use std::time::Duration;

/// Exit code for failures that are not a recognised skip reason.
pub const FAILURE_CODE: u8 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractReport {
    pub return_code: u8,
    pub elapsed_secs: f64,
    /// True when path search ran out of time.
    pub timeout: bool,
    pub reason: Option<String>,
    pub invalids: Vec<InvalidVerdict>,
    pub elided: Vec<usize>,
}

impl ContractReport {
    pub fn new(optimization: &Optimization, elapsed: Duration) -> Self {
        let (reason, elided) = match &optimization.result {
            OptimizationResult::Rewritten { elided, .. } => (None, elided.clone()),
            OptimizationResult::Skipped { reason, detail } => {
                (Some(format!("{reason}: {detail}")), Vec::new())
            }
        };
        Self {
            return_code: optimization.result.exit_code(),
            elapsed_secs: elapsed.as_secs_f64(),
            timeout: optimization.result.skip_reason() == Some(SkipReason::PathSearchTimeout),
            reason,
            invalids: optimization.invalids.clone(),
            elided,
        }
    }

    /// Report for a run that ended in an error.
    pub fn failed(error: &crate::Error, elapsed: Duration) -> Self {
        Self {
            return_code: FAILURE_CODE,
            elapsed_secs: elapsed.as_secs_f64(),
            timeout: false,
            reason: Some(error.to_string()),
            invalids: Vec::new(),
            elided: Vec::new(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn skipped_run_names_reason() {
        let optimization = Optimization {
            result: OptimizationResult::Skipped {
                reason: SkipReason::PathSearchTimeout,
                detail: "600s".into(),
            },
            invalids: Vec::new(),
            graphs: Vec::new(),
        };
        let report = ContractReport::new(&optimization, Duration::from_millis(1500));
        assert_eq!(report.return_code, 10);
        assert!(report.timeout);
        assert_eq!(report.reason.as_deref(), Some("path search timeout: 600s"));

        let json: serde_json::Value = serde_json::to_value(&report).unwrap();
        assert_eq!(json["return_code"], 10);
        assert_eq!(json["elapsed_secs"], 1.5);
    }

    #[test]
    fn write_produces_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("c.report.json");
        let report = ContractReport {
            return_code: 0,
            elapsed_secs: 0.25,
            timeout: false,
            reason: None,
            invalids: Vec::new(),
            elided: vec![8],
        };
        report.write(&path).unwrap();
        let back: ContractReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
    }
}
