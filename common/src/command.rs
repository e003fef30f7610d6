//! Command execution utilities
//!
//! Provides consistent command execution with proper error handling and logging.

use anyhow::{anyhow, Context, Result};
use std::io::ErrorKind;
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Result of a command execution.
#[derive(Debug)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub success: bool,
    pub code: Option<i32>,
}

impl CommandOutput {
    fn from_output(output: std::process::Output) -> Self {
        Self {
            stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            success: output.status.success(),
            code: output.status.code(),
        }
    }

    fn into_checked(self, cmd: &str) -> Result<String> {
        if self.success {
            Ok(self.stdout)
        } else {
            let code = self
                .code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            Err(anyhow!("{} failed (exit {}): {}", cmd, code, self.stderr))
        }
    }
}

/// Run a command and return its output.
///
/// This is a low-level function that returns both stdout and stderr.
/// Use `run_checked` if you want to treat non-zero exit as an error.
#[instrument(skip_all, fields(cmd = %cmd))]
pub async fn run(cmd: &str, args: &[&str]) -> Result<CommandOutput> {
    debug!(args = ?args, "Running command");

    let output = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .context(format!("Failed to execute {}", cmd))?;

    Ok(CommandOutput::from_output(output))
}

/// Run a command and return stdout if successful, error otherwise.
pub async fn run_checked(cmd: &str, args: &[&str]) -> Result<String> {
    run(cmd, args).await?.into_checked(cmd)
}

/// Run a command with extra environment variables, feeding `input` on stdin.
///
/// Environment values are handed to the child only and never logged, so
/// this is the way to pass secrets such as `PGPASSWORD`.
#[instrument(skip_all, fields(cmd = %cmd))]
pub async fn run_with_input(
    cmd: &str,
    args: &[&str],
    envs: &[(&str, &str)],
    input: &str,
) -> Result<String> {
    let names: Vec<&str> = envs.iter().map(|(k, _)| *k).collect();
    debug!(args = ?args, env = ?names, bytes = input.len(), "Running command with input");

    let mut child = Command::new(cmd)
        .args(args)
        .envs(envs.iter().copied())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context(format!("Failed to spawn {}", cmd))?;

    // Feed stdin while stdout and stderr drain, or a chatty child blocks on
    // a full pipe. Dropping `stdin` at the end closes it.
    let stdin = child.stdin.take();
    let feed = async move {
        if let Some(mut stdin) = stdin {
            stdin.write_all(input.as_bytes()).await?;
        }
        Ok::<_, std::io::Error>(())
    };
    let (fed, output) = tokio::join!(feed, child.wait_with_output());
    let output = output.context(format!("Failed to wait for {}", cmd))?;

    match fed {
        Ok(()) => {}
        // Child exited without reading everything; its status tells why
        Err(e) if e.kind() == ErrorKind::BrokenPipe => {
            debug!("{} closed stdin early", cmd);
        }
        Err(e) => return Err(e).context(format!("Failed to write stdin of {}", cmd)),
    }

    CommandOutput::from_output(output).into_checked(cmd)
}

/// Version line of the local psql client, failing when it is not installed
pub async fn psql_version() -> Result<String> {
    run_checked("psql", &["--version"]).await
}

/// Run a multi-statement SQL script through psql against a remote host.
///
/// The script is streamed on stdin with `ON_ERROR_STOP=1` so the first
/// failing statement aborts the whole run.
///
/// # Example
/// ```ignore
/// psql_script("db.internal", 5432, "app", "admin", &password, "SELECT 1;").await?;
/// ```
pub async fn psql_script(
    host: &str,
    port: u16,
    database: &str,
    user: &str,
    password: &str,
    sql: &str,
) -> Result<String> {
    let port = port.to_string();
    run_with_input(
        "psql",
        &[
            "-v",
            "ON_ERROR_STOP=1",
            "-h",
            host,
            "-p",
            &port,
            "-U",
            user,
            "-d",
            database,
        ],
        &[("PGPASSWORD", password), ("PGCONNECT_TIMEOUT", "10")],
        sql,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_checked_reports_failure() {
        let err = run_checked("sh", &["-c", "echo boom >&2; exit 3"])
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit 3"));
        assert!(msg.contains("boom"));
    }

    #[tokio::test]
    async fn test_run_with_input_pipes_stdin_and_env() {
        let out = run_with_input(
            "sh",
            &["-c", "cat; printf %s \"$GREETING\""],
            &[("GREETING", "-ok")],
            "hello",
        )
        .await
        .unwrap();
        assert_eq!(out, "hello-ok");
    }

    #[tokio::test]
    async fn test_run_with_input_drains_output_while_feeding() {
        let input = "x".repeat(1 << 20);
        let run = run_with_input(
            "sh",
            &["-c", "head -c 1000000 /dev/zero | tr '\\0' y; cat >/dev/null"],
            &[],
            &input,
        );

        let out = tokio::time::timeout(std::time::Duration::from_secs(30), run)
            .await
            .expect("child output and stdin must not block each other")
            .unwrap();
        assert_eq!(out.len(), 1_000_000);
    }

    #[tokio::test]
    async fn test_run_with_input_reports_status_when_stdin_closed_early() {
        let input = "SELECT 1;\n".repeat(100_000);
        let err = run_with_input("sh", &["-c", "echo stopped >&2; exit 4"], &[], &input)
            .await
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("exit 4"), "{}", msg);
        assert!(msg.contains("stopped"), "{}", msg);
    }
}
