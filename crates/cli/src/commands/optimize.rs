//! The optimizer command: reads a contract, removes unreachable `INVALID` blocks and writes the
//! result plus a JSON report into the output directory.

use crate::config::OptimizerConfig;
use crate::pipeline::{self, OptimizationResult};
use crate::report::ContractReport;
use crate::Result;
use async_trait::async_trait;
use clap::Args;
use sieve_core::disasm::DisassemblyReport;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

#[derive(Args, Debug, Clone)]
pub struct OptimizeArgs {
    /// Contract bytecode: a file holding hex, or a 0x-prefixed hex string.
    pub source: String,
    /// Directory receiving the rewritten bytecode and the report.
    pub output_path: PathBuf,
    /// File stem for the outputs.
    pub output_name: String,
    /// Verbose logging. `-pd` is accepted as well.
    #[arg(long = "process-detail")]
    pub process_detail: bool,
    /// Write the repaired CFG and the function graphs as Graphviz files.
    #[arg(short = 'H', long)]
    pub html: bool,
    /// JSON optimizer configuration.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// Pre-computed disassembler output; skips disassembly.
    #[arg(long, value_name = "FILE")]
    pub cfg_json: Option<PathBuf>,
    /// External disassembler command; `{input}` and `{output_dir}` are substituted.
    #[arg(long, num_args = 1.., allow_hyphen_values = true, value_name = "CMD")]
    pub disassembler: Option<Vec<String>>,
    /// Path search timeout in seconds.
    #[arg(long, value_name = "SECS")]
    pub timeout: Option<u64>,
    /// Maximum number of recorded paths.
    #[arg(long, value_name = "N")]
    pub max_paths: Option<usize>,
}

impl OptimizeArgs {
    /// Configuration file (or defaults) with the command-line overrides applied.
    pub fn resolve_config(&self) -> Result<OptimizerConfig> {
        let mut config = match &self.config {
            Some(path) => OptimizerConfig::load(path)?,
            None => OptimizerConfig::default(),
        };
        if let Some(secs) = self.timeout {
            config.path_search_timeout_secs = secs;
        }
        if let Some(max) = self.max_paths {
            config.max_paths = max;
        }
        if let Some(command) = &self.disassembler {
            config.disassembler = Some(command.clone());
        }
        config.validate()?;
        Ok(config)
    }

    fn output(&self, suffix: &str) -> PathBuf {
        self.output_path.join(format!("{}.{suffix}", self.output_name))
    }
}

fn read_source(source: &str) -> Result<Vec<u8>> {
    let is_file = !source.starts_with("0x") && Path::new(source).is_file();
    Ok(sieve_core::input_to_bytes(source, is_file)?)
}

#[async_trait]
impl super::Command for OptimizeArgs {
    async fn execute(self) -> Result<ExitCode> {
        let started = Instant::now();
        let config = self.resolve_config()?;
        let original = read_source(&self.source)?;
        let precomputed = match &self.cfg_json {
            Some(path) => Some(DisassemblyReport::from_json(&fs::read_to_string(path)?)?),
            None => None,
        };
        fs::create_dir_all(&self.output_path)?;
        let report_path = self.output("report.json");

        let optimization =
            match pipeline::optimize(original.clone(), precomputed, &config, self.html).await {
                Ok(optimization) => optimization,
                Err(err) => {
                    ContractReport::failed(&err, started.elapsed()).write(&report_path)?;
                    return Err(err);
                }
            };

        let bytecode = match &optimization.result {
            OptimizationResult::Rewritten { bytecode, .. } => bytecode.as_slice(),
            OptimizationResult::Skipped { .. } => original.as_slice(),
        };
        fs::write(
            self.output("optimized.hex"),
            format!("0x{}\n", hex::encode(bytecode)),
        )?;
        for graph in &optimization.graphs {
            fs::write(self.output(&format!("{}.dot", graph.name)), &graph.dot)?;
        }
        ContractReport::new(&optimization, started.elapsed()).write(&report_path)?;

        match &optimization.result {
            OptimizationResult::Rewritten {
                elided,
                removed_bytes,
                ..
            } => tracing::info!(
                elided = elided.len(),
                removed_bytes,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "optimization finished"
            ),
            OptimizationResult::Skipped { reason, detail } => eprintln!("{reason}: {detail}"),
        }
        Ok(ExitCode::from(optimization.result.exit_code()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::Command;

    fn args(dir: &Path, source: &str) -> OptimizeArgs {
        OptimizeArgs {
            source: source.into(),
            output_path: dir.to_path_buf(),
            output_name: "c".into(),
            process_detail: false,
            html: true,
            config: None,
            cfg_json: None,
            disassembler: None,
            timeout: None,
            max_paths: None,
        }
    }

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("cfg.json");
        fs::write(&file, r#"{"max_paths": 5, "path_search_timeout_secs": 9}"#).unwrap();
        let mut a = args(dir.path(), "0x00");
        a.config = Some(file);
        a.max_paths = Some(7);
        let config = a.resolve_config().unwrap();
        assert_eq!(config.max_paths, 7);
        assert_eq!(config.path_search_timeout_secs, 9);
    }

    #[tokio::test]
    async fn writes_bytecode_report_and_graphs() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("in.hex");
        // PUSH1 0 PUSH1 0 EQ PUSH1 09 JUMPI INVALID JUMPDEST STOP
        fs::write(&source, "6000600014600957fe5b00").unwrap();

        args(dir.path(), source.to_str().unwrap())
            .execute()
            .await
            .unwrap();

        let hex = fs::read_to_string(dir.path().join("c.optimized.hex")).unwrap();
        assert_eq!(hex.trim(), "0x60006000146008575b00");
        let report: ContractReport = serde_json::from_str(
            &fs::read_to_string(dir.path().join("c.report.json")).unwrap(),
        )
        .unwrap();
        assert_eq!(report.return_code, 0);
        assert_eq!(report.elided, vec![8]);
        assert!(dir.path().join("c.cfg.dot").exists());
        assert!(dir.path().join("c.func_0.dot").exists());
    }
}
