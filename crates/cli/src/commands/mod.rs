use async_trait::async_trait;
use std::process::ExitCode;

pub mod optimize;

/// Trait for executing CLI commands.
///
/// Implementors read their inputs, run the work and return the process exit code. Errors that
/// escape are reported by `main` with exit code 1.
#[async_trait]
pub trait Command {
    async fn execute(self) -> crate::Result<ExitCode>;
}

/// Rewrites the single-dash long flag `-pd` into `--process-detail` so clap accepts it.
pub fn normalize_args<I>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    args.into_iter()
        .map(|arg| {
            if arg == "-pd" {
                "--process-detail".to_string()
            } else {
                arg
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_exact_pd_is_rewritten() {
        let args = ["sieve", "-pd", "in.hex", "-pdx", "--pd"].map(String::from);
        assert_eq!(
            normalize_args(args),
            vec!["sieve", "--process-detail", "in.hex", "-pdx", "--pd"]
        );
    }
}
