use std::path::{Path, PathBuf};

use cmdstream_runtime::ConnectParams;
use serde::Deserialize;

type Result<T> = std::result::Result<T, StreamError>;

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("Failed to read stream file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlParseError(#[from] serde_yaml::Error),

    #[error("Invalid stream file {0}: {1}")]
    InvalidStreamFile(PathBuf, String),
}

/// A named list of commands that run in order on one shell, so each sees
/// the working directory and environment the previous ones left behind.
///
/// ```yaml
/// name: deploy
/// connection:
///   host: app1.internal
///   username: deploy
/// commands:
///   - name: enter release dir
///     command: cd /srv/app/current
///   - name: restart
///     command: ./bin/restart
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CommandStream {
    pub name: String,
    pub commands: Vec<StreamCommand>,
    #[serde(default)]
    pub connection: Option<ConnectParams>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamCommand {
    pub name: String,
    pub command: String,
}

pub async fn load_stream(path: impl AsRef<Path>) -> Result<CommandStream> {
    let content = tokio::fs::read_to_string(path.as_ref()).await?;
    parse_stream(&content, path)
}

fn parse_stream(content: &str, path: impl AsRef<Path>) -> Result<CommandStream> {
    let stream: CommandStream = serde_yaml::from_str(content)?;

    if stream.commands.is_empty() {
        return Err(StreamError::InvalidStreamFile(
            path.as_ref().to_path_buf(),
            "stream has no commands".to_string(),
        ));
    }

    if let Some(empty) = stream.commands.iter().find(|c| c.command.trim().is_empty()) {
        return Err(StreamError::InvalidStreamFile(
            path.as_ref().to_path_buf(),
            format!("command '{}' is empty", empty.name),
        ));
    }

    Ok(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[tokio::test]
    async fn test_load_stream_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
name: inspect
connection:
  host: db1.internal
  username: postgres
  password: secret
commands:
  - name: go home
    command: cd ~
  - name: where
    command: pwd
"#
        )
        .unwrap();

        let stream = load_stream(file.path()).await.unwrap();

        assert_eq!(stream.name, "inspect");
        assert_eq!(stream.commands.len(), 2);
        assert_eq!(
            stream.commands[1],
            StreamCommand {
                name: "where".into(),
                command: "pwd".into()
            }
        );

        let connection = stream.connection.unwrap();
        assert_eq!(connection.connection_key(), "postgres@db1.internal:22");
    }

    #[test]
    fn test_connection_is_optional() {
        let stream = parse_stream(
            "name: local\ncommands:\n  - name: hi\n    command: echo hi\n",
            "local.yaml",
        )
        .unwrap();

        assert!(stream.connection.is_none());
    }

    #[test]
    fn test_empty_stream_is_rejected() {
        let result = parse_stream("name: nothing\ncommands: []\n", "nothing.yaml");
        assert!(matches!(result, Err(StreamError::InvalidStreamFile(_, _))));
    }

    #[test]
    fn test_blank_command_is_rejected() {
        let result = parse_stream(
            "name: blank\ncommands:\n  - name: oops\n    command: '  '\n",
            "blank.yaml",
        );

        let Err(StreamError::InvalidStreamFile(_, message)) = result else {
            panic!("expected an invalid stream error");
        };
        assert_eq!(message, "command 'oops' is empty");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let result = load_stream(dir.path().join("missing.yaml")).await;
        assert!(matches!(result, Err(StreamError::IoError(_))));
    }
}
