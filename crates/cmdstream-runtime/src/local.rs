//! Run commands as local child processes. No pooling, no shared state.

use tokio::process::Command;

use crate::execution::CommandExecutionResult;

fn shell_command(command: &str) -> Command {
    if cfg!(windows) {
        let mut cmd = Command::new("cmd");
        cmd.arg("/C").arg(command);
        cmd
    } else {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

/// Run `command` through the platform shell and wait for it to finish.
///
/// Anything on stderr marks the result as failed and replaces stdout as the
/// output.
pub async fn execute(command: &str) -> CommandExecutionResult {
    tracing::debug!("Executing local command: {command}");

    let output = match shell_command(command).output().await {
        Ok(output) => output,
        Err(e) => {
            tracing::error!("Failed to spawn local command: {e}");
            return CommandExecutionResult::failure(e.to_string());
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();

    if !output.status.success() {
        let message = if stderr.is_empty() {
            format!("Command failed: {command} ({})", output.status)
        } else {
            stderr
        };
        return CommandExecutionResult::failure(message);
    }

    if !stderr.is_empty() {
        return CommandExecutionResult::failure(stderr);
    }

    CommandExecutionResult::success(stdout)
}
