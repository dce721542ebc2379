use super::{Disassembler, DisassemblyReport};
use crate::result::{Error, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;

/// Runs an external disassembler as a subprocess.
///
/// `command` is the program followed by its arguments. `{input}` is replaced with the path of a
/// file holding the bytecode as hex, `{output_dir}` with a scratch directory. The tool either
/// leaves a JSON document in that directory or prints it on stdout.
#[derive(Debug, Clone)]
pub struct ExternalDisassembler {
    command: Vec<String>,
    timeout: Duration,
}

impl ExternalDisassembler {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        if command.is_empty() {
            return Err(Error::Disassembler("empty disassembler command".into()));
        }
        Ok(Self { command, timeout })
    }

    fn substitute(&self, input: &Path, output_dir: &Path) -> Vec<String> {
        let input = input.display().to_string();
        let output_dir = output_dir.display().to_string();
        self.command
            .iter()
            .map(|arg| {
                arg.replace("{input}", &input)
                    .replace("{output_dir}", &output_dir)
            })
            .collect()
    }
}

#[async_trait]
impl Disassembler for ExternalDisassembler {
    fn name(&self) -> &str {
        &self.command[0]
    }

    async fn disassemble(&self, bytecode: &[u8]) -> Result<DisassemblyReport> {
        let scratch = tempfile::tempdir().map_err(|e| Error::Disassembler(e.to_string()))?;
        let input = scratch.path().join("input.hex");
        let output_dir = scratch.path().join("out");
        tokio::fs::create_dir_all(&output_dir)
            .await
            .map_err(|e| Error::Disassembler(e.to_string()))?;
        tokio::fs::write(&input, hex::encode(bytecode))
            .await
            .map_err(|e| Error::Disassembler(e.to_string()))?;

        let argv = self.substitute(&input, &output_dir);
        tracing::debug!(command = ?argv, "running external disassembler");

        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]).kill_on_drop(true);
        let output = tokio::time::timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| Error::DisassemblerTimeout(self.timeout.as_secs()))?
            .map_err(|e| Error::Disassembler(format!("failed to start {}: {e}", argv[0])))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::Disassembler(format!(
                "{} exited with {}: {}",
                argv[0],
                output.status,
                stderr.trim()
            )));
        }

        let text = match first_json(&output_dir).await? {
            Some(path) => {
                tracing::debug!(path = %path.display(), "reading disassembler output");
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| Error::FileRead {
                        path: path.display().to_string(),
                        source,
                    })?
            }
            None => String::from_utf8_lossy(&output.stdout).into_owned(),
        };

        DisassemblyReport::from_json(&text)
    }
}

/// First `*.json` file in `dir`, by name.
async fn first_json(dir: &Path) -> Result<Option<PathBuf>> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| Error::Disassembler(e.to_string()))?;
    let mut found = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| Error::Disassembler(e.to_string()))?
    {
        let path = entry.path();
        if path.extension().is_some_and(|ext| ext == "json") {
            found.push(path);
        }
    }
    found.sort();
    Ok(found.into_iter().next())
}
