//! Remote execution client that shells out to user-provided commands.
//!
//! The remote service's transport and authentication stay outside of this
//! crate: the user supplies two command templates that know how to talk to
//! it, and this client only runs them and interprets their output.
//!
//! # Protocol
//!
//! ## Submit
//! ```bash
//! <submit_command with {device} {udid} {test_case} {specification}>
//! ```
//! Output: a JSON line on stdout (the last one wins)
//! ```json
//! {"success": true, "message": "<execution id>"}
//! {"success": false, "message": "device offline"}
//! ```
//!
//! ## Fetch
//! ```bash
//! <fetch_command with {execution_id}>
//! ```
//! Output: nothing, `null` or `{"pending": true}` while the execution is
//! still running, otherwise the result
//! ```json
//! {"status": 0, "creation_date": "2024-05-01T12:00:00Z", "end_date": "2024-05-01T12:03:10Z",
//!  "build_number": 42, "key_string": "agxzfmphbW8"}
//! ```
//!
//! A non-zero exit code is a failed call in both modes.
//!
//! # Example
//!
//! ```
//! use automator::client::ShellClient;
//!
//! let client = ShellClient::new(
//!     "./jamo submit --device {device} --test {test_case}",
//!     "./jamo report {execution_id}",
//! )?;
//! # Ok::<(), automator::client::ClientError>(())
//! ```

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::{ClientError, ClientResult, FetchOutcome, RemoteExecutionClient, SubmitResponse};
use crate::config::ClientConfig;
use crate::model::{Device, ExecutionResult, TestCase};

/// Reply of the submit command.
#[derive(Debug, Deserialize)]
struct SubmitReply {
    success: bool,
    #[serde(default)]
    message: Option<String>,
}

/// Captured output of one command invocation.
struct CommandOutput {
    exit_code: i32,
    stdout: String,
    stderr: String,
}

/// A client that runs one command per remote call.
///
/// Templates are split into arguments once, at construction time, and
/// placeholders are substituted per argument. Nothing goes through a shell,
/// so device or test names never need quoting.
#[derive(Debug, Clone)]
pub struct ShellClient {
    submit_template: Vec<String>,
    fetch_template: Vec<String>,
    working_dir: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ShellClient {
    /// Creates a client from submit and fetch command templates.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidCommand`] if a template is empty or has
    /// unbalanced quotes.
    pub fn new(submit_command: &str, fetch_command: &str) -> ClientResult<Self> {
        Ok(Self {
            submit_template: split_template(submit_command)?,
            fetch_template: split_template(fetch_command)?,
            working_dir: None,
            timeout: None,
        })
    }

    /// Creates a client from the `[client]` config section.
    pub fn from_config(config: &ClientConfig) -> ClientResult<Self> {
        let mut client = Self::new(&config.submit_command, &config.fetch_command)?;
        if let Some(dir) = &config.working_dir {
            client = client.with_working_dir(dir.clone());
        }
        if let Some(secs) = config.timeout_secs {
            client = client.with_timeout(Duration::from_secs(secs));
        }
        Ok(client)
    }

    pub fn with_working_dir(mut self, dir: PathBuf) -> Self {
        self.working_dir = Some(dir);
        self
    }

    /// Limits how long a single call may take. Unlimited by default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    async fn run(&self, argv: Vec<String>) -> ClientResult<CommandOutput> {
        let Some((program, args)) = argv.split_first() else {
            return Err(ClientError::InvalidCommand("empty command".to_string()));
        };

        debug!("Running remote call: {:?}", argv);

        let mut cmd = tokio::process::Command::new(program);
        cmd.args(args);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);

        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, cmd.output())
                .await
                .map_err(|_| {
                    ClientError::Timeout(format!("{} did not finish within {:?}", program, limit))
                })?,
            None => cmd.output().await,
        }
        .map_err(|e| ClientError::Spawn(format!("{}: {}", program, e)))?;

        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        })
    }

    async fn run_checked(&self, argv: Vec<String>) -> ClientResult<String> {
        let output = self.run(argv).await?;
        if output.exit_code != 0 {
            return Err(ClientError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl RemoteExecutionClient for ShellClient {
    async fn submit(&self, device: &Device, test_case: &TestCase) -> ClientResult<SubmitResponse> {
        let vars = [
            ("{device}", device.name.as_str()),
            ("{udid}", device.udid.as_deref().unwrap_or("")),
            ("{test_case}", test_case.name.as_str()),
            (
                "{specification}",
                test_case.specification.as_deref().unwrap_or(""),
            ),
        ];
        let stdout = self
            .run_checked(render(&self.submit_template, &vars))
            .await?;
        parse_submit_reply(&stdout)
    }

    async fn fetch_result(&self, execution_id: &str) -> ClientResult<FetchOutcome> {
        let vars = [("{execution_id}", execution_id)];
        let stdout = self.run_checked(render(&self.fetch_template, &vars)).await?;
        parse_fetch_reply(&stdout)
    }

    fn name(&self) -> &str {
        self.submit_template
            .first()
            .map(String::as_str)
            .unwrap_or("shell")
    }
}

fn split_template(template: &str) -> ClientResult<Vec<String>> {
    let parts = shell_words::split(template)
        .map_err(|e| ClientError::InvalidCommand(format!("{}: {}", template, e)))?;
    if parts.is_empty() {
        return Err(ClientError::InvalidCommand("empty command".to_string()));
    }
    Ok(parts)
}

/// Substitutes `{placeholder}` values in every argument of a template.
fn render(template: &[String], vars: &[(&str, &str)]) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            vars.iter()
                .fold(arg.clone(), |acc, (key, value)| acc.replace(key, value))
        })
        .collect()
}

/// Last stdout line that looks like a JSON payload.
fn last_json_line(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .map(str::trim)
        .rev()
        .find(|line| line.starts_with('{') || *line == "null")
}

fn parse_submit_reply(stdout: &str) -> ClientResult<SubmitResponse> {
    let line = last_json_line(stdout)
        .ok_or_else(|| ClientError::InvalidResponse("submit printed no JSON reply".to_string()))?;
    let reply: SubmitReply = serde_json::from_str(line)
        .map_err(|e| ClientError::InvalidResponse(format!("submit reply {}: {}", line, e)))?;

    let message = reply.message.unwrap_or_default();
    if reply.success && !message.trim().is_empty() {
        Ok(SubmitResponse::Accepted {
            execution_id: message.trim().to_string(),
        })
    } else if reply.success {
        Ok(SubmitResponse::Rejected {
            message: "service accepted the execution without an execution id".to_string(),
        })
    } else {
        Ok(SubmitResponse::Rejected { message })
    }
}

fn parse_fetch_reply(stdout: &str) -> ClientResult<FetchOutcome> {
    if stdout.trim().is_empty() {
        return Ok(FetchOutcome::Pending);
    }
    let line = last_json_line(stdout)
        .ok_or_else(|| ClientError::InvalidResponse("fetch printed no JSON reply".to_string()))?;

    let value: serde_json::Value = serde_json::from_str(line)
        .map_err(|e| ClientError::InvalidResponse(format!("fetch reply {}: {}", line, e)))?;
    if value.is_null() || value.get("pending").and_then(|p| p.as_bool()) == Some(true) {
        return Ok(FetchOutcome::Pending);
    }

    let result: ExecutionResult = serde_json::from_value(value)
        .map_err(|e| ClientError::InvalidResponse(format!("fetch reply {}: {}", line, e)))?;
    Ok(FetchOutcome::Ready(result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_substitutes_every_argument() {
        let template = split_template("submit --device {device} --name={test_case} {udid}").unwrap();
        let argv = render(
            &template,
            &[("{device}", "pixel 7"), ("{test_case}", "login"), ("{udid}", "")],
        );
        assert_eq!(
            argv,
            vec!["submit", "--device", "pixel 7", "--name=login", ""]
        );
    }

    #[test]
    fn test_empty_template_is_rejected() {
        assert!(matches!(
            ShellClient::new("", "fetch"),
            Err(ClientError::InvalidCommand(_))
        ));
        assert!(matches!(
            ShellClient::new("submit 'unbalanced", "fetch"),
            Err(ClientError::InvalidCommand(_))
        ));
    }

    #[test]
    fn test_parse_submit_reply() {
        let accepted = parse_submit_reply("logging in\n{\"success\": true, \"message\": \"e-17\"}\n");
        assert_eq!(
            accepted.unwrap(),
            SubmitResponse::Accepted {
                execution_id: "e-17".to_string()
            }
        );

        let rejected = parse_submit_reply("{\"success\": false, \"message\": \"device offline\"}");
        assert_eq!(
            rejected.unwrap(),
            SubmitResponse::Rejected {
                message: "device offline".to_string()
            }
        );

        let missing_id = parse_submit_reply("{\"success\": true}").unwrap();
        assert!(matches!(missing_id, SubmitResponse::Rejected { .. }));

        assert!(matches!(
            parse_submit_reply("no json here"),
            Err(ClientError::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_parse_fetch_reply_pending_forms() {
        assert_eq!(parse_fetch_reply("").unwrap(), FetchOutcome::Pending);
        assert_eq!(parse_fetch_reply("null\n").unwrap(), FetchOutcome::Pending);
        assert_eq!(
            parse_fetch_reply("{\"pending\": true}").unwrap(),
            FetchOutcome::Pending
        );
    }

    #[test]
    fn test_parse_fetch_reply_result() {
        let outcome = parse_fetch_reply(
            "{\"status\": 1, \"build_number\": 3, \"key_string\": \"abc\"}",
        )
        .unwrap();
        match outcome {
            FetchOutcome::Ready(result) => {
                assert_eq!(result.status, 1);
                assert_eq!(result.build_number, Some(3));
                assert_eq!(result.key, "abc");
            }
            FetchOutcome::Pending => panic!("expected a result"),
        }

        assert!(matches!(
            parse_fetch_reply("{\"status\": \"broken\"}"),
            Err(ClientError::InvalidResponse(_))
        ));
        assert!(matches!(
            parse_fetch_reply("HTTP 500"),
            Err(ClientError::InvalidResponse(_))
        ));
    }

    #[tokio::test]
    async fn test_submit_runs_command() {
        let client = ShellClient::new(
            r#"echo '{"success": true, "message": "exec-{test_case}-{device}"}'"#,
            "echo",
        )
        .unwrap();

        let response = client
            .submit(&Device::new("pixel"), &TestCase::new("login"))
            .await
            .unwrap();
        assert_eq!(
            response,
            SubmitResponse::Accepted {
                execution_id: "exec-login-pixel".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_fetch_non_zero_exit_is_error() {
        let client = ShellClient::new("echo", "false {execution_id}").unwrap();

        let err = client.fetch_result("exec-1").await.unwrap_err();
        assert!(matches!(err, ClientError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn test_fetch_blank_output_is_pending() {
        let client = ShellClient::new("echo", "true {execution_id}").unwrap();

        let outcome = client.fetch_result("exec-1").await.unwrap();
        assert_eq!(outcome, FetchOutcome::Pending);
    }

    #[tokio::test]
    async fn test_missing_program_is_spawn_error() {
        let client = ShellClient::new("echo", "/nonexistent/automator-fetch {execution_id}").unwrap();

        let err = client.fetch_result("exec-1").await.unwrap_err();
        assert!(matches!(err, ClientError::Spawn(_)));
    }
}
