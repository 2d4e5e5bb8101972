use cmdstream_runtime::{CommandExecutionResult, ConnectParams, SshError, SshPoolHandle};
use serde::Serialize;
use uuid::Uuid;

use crate::streams::{CommandStream, StreamCommand};

type Result<T> = std::result::Result<T, ExecutorError>;

#[derive(thiserror::Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to serialize result: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Session pool error: {0}")]
    PoolError(#[from] SshError),
}

#[derive(Serialize)]
struct Report<'a> {
    name: &'a str,
    #[serde(flatten)]
    result: &'a CommandExecutionResult,
}

/// Render one result for the terminal
fn render(name: &str, result: &CommandExecutionResult, json: bool) -> Result<String> {
    if json {
        return Ok(serde_json::to_string(&Report { name, result })?);
    }

    let mut text = result.output.trim_end_matches('\n').to_string();
    if !result.success {
        if !text.is_empty() {
            text.push('\n');
        }
        text.push_str(&format!("✗ {name} failed"));
    }
    Ok(text)
}

pub fn all_succeeded(results: &[CommandExecutionResult]) -> bool {
    results.iter().all(|r| r.success)
}

pub struct Executor {
    pool: SshPoolHandle,
    json: bool,
}

impl Executor {
    pub fn new(pool: SshPoolHandle, json: bool) -> Self {
        Self { pool, json }
    }

    /// One command, no pooling
    pub async fn exec(
        &self,
        command: &str,
        params: Option<&ConnectParams>,
    ) -> Result<Vec<CommandExecutionResult>> {
        let result = self.pool.run_once(command, params).await;
        self.report(command, &result)?;
        Ok(vec![result])
    }

    /// Commands in order on one shared shell
    pub async fn run(
        &self,
        commands: &[String],
        params: &ConnectParams,
        session: Option<&str>,
        keep_alive: bool,
    ) -> Result<Vec<CommandExecutionResult>> {
        let steps: Vec<StreamCommand> = commands
            .iter()
            .map(|command| StreamCommand {
                name: command.clone(),
                command: command.clone(),
            })
            .collect();
        let key = session
            .map(str::to_string)
            .unwrap_or_else(|| params.connection_key());

        self.run_sequence(&steps, params, &key, keep_alive).await
    }

    /// Run a command stream. Without a connection (in the file or on the
    /// command line) each command runs locally and independently.
    pub async fn stream(
        &self,
        stream: &CommandStream,
        fallback: Option<&ConnectParams>,
    ) -> Result<Vec<CommandExecutionResult>> {
        tracing::info!("Running command stream {}", stream.name);

        let Some(params) = stream.connection.as_ref().or(fallback) else {
            let mut results = Vec::new();
            for step in &stream.commands {
                let result = self.pool.run_once(&step.command, None).await;
                self.report(&step.name, &result)?;
                let failed = !result.success;
                results.push(result);
                if failed {
                    break;
                }
            }
            return Ok(results);
        };

        // A private session, so nothing else can interleave with the stream
        let key = Uuid::new_v4().to_string();
        self.run_sequence(&stream.commands, params, &key, false)
            .await
    }

    /// Every step but the last keeps the session alive. Stops at the first
    /// failure, closing the session unless asked to keep it.
    async fn run_sequence(
        &self,
        steps: &[StreamCommand],
        params: &ConnectParams,
        key: &str,
        keep_alive: bool,
    ) -> Result<Vec<CommandExecutionResult>> {
        let mut results = Vec::with_capacity(steps.len());

        for (i, step) in steps.iter().enumerate() {
            let last = i + 1 == steps.len();
            let result = self
                .pool
                .run_multiplexed(&step.command, params, keep_alive || !last, Some(key))
                .await;
            self.report(&step.name, &result)?;

            let failed = !result.success;
            results.push(result);

            if failed {
                if !keep_alive && !last {
                    self.pool.disconnect(key).await?;
                }
                break;
            }
        }

        Ok(results)
    }

    fn report(&self, name: &str, result: &CommandExecutionResult) -> Result<()> {
        let text = render(name, result, self.json)?;
        if !text.is_empty() {
            println!("{text}");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cmdstream_runtime::PoolConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_render_plain() {
        let ok = CommandExecutionResult::success("hello\n");
        assert_eq!(render("greet", &ok, false).unwrap(), "hello");

        let failed = CommandExecutionResult::failure("nope");
        assert_eq!(render("greet", &failed, false).unwrap(), "nope\n✗ greet failed");
    }

    #[test]
    fn test_render_json() {
        let ok = CommandExecutionResult::success("hello");
        assert_eq!(
            render("greet", &ok, true).unwrap(),
            r#"{"name":"greet","output":"hello","success":true}"#
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_local_stream_stops_at_first_failure() {
        let executor = Executor::new(SshPoolHandle::new(PoolConfig::default()), false);
        let stream = CommandStream {
            name: "local".into(),
            connection: None,
            commands: vec![
                StreamCommand {
                    name: "first".into(),
                    command: "echo one".into(),
                },
                StreamCommand {
                    name: "broken".into(),
                    command: "exit 3".into(),
                },
                StreamCommand {
                    name: "never".into(),
                    command: "echo three".into(),
                },
            ],
        };

        let results = executor.stream(&stream, None).await.unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0], CommandExecutionResult::success("one\n"));
        assert!(!all_succeeded(&results));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exec_locally() {
        let executor = Executor::new(SshPoolHandle::new(PoolConfig::default()), true);

        let results = executor.exec("echo hi", None).await.unwrap();
        assert!(all_succeeded(&results));
        assert_eq!(results[0].output, "hi\n");
    }
}
