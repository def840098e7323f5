use std::future::Future;
use std::time::Duration;

use super::ControllerError;

/// Runs external programs on behalf of a routing backend.
pub trait CommandRunner: Send + Sync {
    /// Run `program args` and return stdout. A non-zero exit is an error.
    fn output(
        &self,
        program: &str,
        args: &[&str],
    ) -> impl Future<Output = Result<String, ControllerError>> + Send;
}

fn command_line(program: &str, args: &[&str]) -> String {
    if args.is_empty() {
        program.to_string()
    } else {
        format!("{program} {}", args.join(" "))
    }
}

/// Spawns real processes. Every call is bounded by `timeout` and the child is
/// killed if the call is cancelled.
#[derive(Debug, Clone)]
pub struct TokioCommandRunner {
    timeout: Duration,
}

impl TokioCommandRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl CommandRunner for TokioCommandRunner {
    async fn output(&self, program: &str, args: &[&str]) -> Result<String, ControllerError> {
        let child = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        let out = match tokio::time::timeout(self.timeout, child).await {
            Err(_) => {
                return Err(ControllerError::Timeout {
                    command: command_line(program, args),
                    after: self.timeout,
                });
            }
            Ok(Err(source)) => {
                return Err(ControllerError::Spawn {
                    command: command_line(program, args),
                    source,
                });
            }
            Ok(Ok(out)) => out,
        };

        if !out.status.success() {
            return Err(ControllerError::Command {
                command: command_line(program, args),
                status: out.status.to_string(),
                stderr: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}
