//! Command completion detection on a shared interactive shell.
//!
//! An interactive shell is just bytes in and bytes out, so there is no frame
//! telling us where one command's output stops. Every command is therefore
//! written as a single line bracketed by two markers:
//!
//! ```text
//! echo "<begin>"; <command>; echo "<end>"
//! ```
//!
//! and the inbound stream is accumulated until the executed end marker shows
//! up. Two things make this harder than a substring search:
//!
//! - The terminal echoes the line we wrote before running it, so the end
//!   marker appears once inside `echo "<end>"` before it appears as output.
//!   A candidate match directly preceded by `echo "` is that echo and is
//!   skipped. Some terminals repeat a single character while echoing, so the
//!   check tolerates one doubled character.
//! - The buffer may start with the tail of an earlier command. The last begin
//!   marker and the last end marker are the ones that count.
//!
//! Some failures kill the line before the end marker is ever printed (the
//! shell rejects the whole line, for example), so an [`ErrorDetector`] also
//! looks at each chunk. When it fires and the text after the last end marker
//! is itself an error, that text is the result and the command failed. When
//! the end marker is matched normally, the detector is run once more over the
//! delimited output to decide `success`.
//!
//! The default detector is a plain keyword match. It will report failure for
//! legitimate output that contains the keyword, e.g. a log line with
//! `level=error`.

use std::sync::Arc;

use eyre::Result;

use crate::config::MarkerConfig;
use crate::execution::CommandExecutionResult;
use crate::ssh::error::SshError;
use crate::ssh::transport::{ShellChannel, ShellEvent};

const ECHO_INVOCATION: &str = "echo \"";

/// The begin/end pair for one invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Markers {
    begin: String,
    end: String,
}

impl Markers {
    /// Build the markers for a single invocation. With `randomize` set, both
    /// markers share a fresh suffix so that output from other invocations can
    /// never match.
    pub fn new(config: &MarkerConfig) -> Self {
        if config.randomize {
            let suffix = uuid::Uuid::new_v4().simple().to_string();
            Self::fixed(
                format!("{}{suffix}", config.begin),
                format!("{}{suffix}", config.end),
            )
        } else {
            Self::fixed(config.begin.clone(), config.end.clone())
        }
    }

    pub fn fixed(begin: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            begin: begin.into(),
            end: end.into(),
        }
    }

    pub fn begin(&self) -> &str {
        &self.begin
    }

    pub fn end(&self) -> &str {
        &self.end
    }

    /// The full line written to the shell, including the trailing newline
    pub fn compose(&self, command: &str) -> String {
        format!(
            "echo \"{}\"; {}; echo \"{}\"\n",
            self.begin, command, self.end
        )
    }

    pub fn collides_with(&self, command: &str) -> bool {
        command.contains(&self.begin) || command.contains(&self.end)
    }
}

/// Decides whether a chunk of shell output signals a failed command.
pub trait ErrorDetector: Send + Sync {
    fn is_error(&self, chunk: &str) -> bool;
}

impl<F> ErrorDetector for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn is_error(&self, chunk: &str) -> bool {
        self(chunk)
    }
}

/// Substring matching on a case-insensitive error keyword and on the
/// prefixes shells put in front of their own diagnostics.
#[derive(Debug, Clone)]
pub struct KeywordErrorDetector {
    keywords: Vec<String>,
    shell_prefixes: Vec<String>,
}

impl KeywordErrorDetector {
    pub fn new(keywords: Vec<String>, shell_prefixes: Vec<String>) -> Self {
        Self {
            keywords: keywords.into_iter().map(|k| k.to_lowercase()).collect(),
            shell_prefixes,
        }
    }
}

impl Default for KeywordErrorDetector {
    fn default() -> Self {
        Self::new(
            vec!["error".to_string()],
            vec!["-bash:".to_string(), "bash:".to_string(), "zsh:".to_string()],
        )
    }
}

impl ErrorDetector for KeywordErrorDetector {
    fn is_error(&self, chunk: &str) -> bool {
        let lower = chunk.to_lowercase();
        self.keywords.iter().any(|k| lower.contains(k.as_str()))
            || self.shell_prefixes.iter().any(|p| chunk.contains(p.as_str()))
    }
}

/// Does `prefix` end with the text of an `echo "` invocation, allowing a
/// single character of it to be doubled?
fn ends_with_echo_invocation(prefix: &str) -> bool {
    let mut window = prefix.chars().rev().peekable();
    let mut doubled = false;

    for expected in ECHO_INVOCATION.chars().rev() {
        match window.next() {
            Some(c) if c == expected => {}
            _ => return false,
        }

        if !doubled && window.peek() == Some(&expected) {
            doubled = true;
            window.next();
        }
    }

    true
}

fn normalize_newlines(text: &str) -> String {
    text.replace("\r\n", "\n")
}

/// Output between the markers, minus the line breaks the markers' own
/// `echo` calls contribute.
fn clean_delimited(text: &str) -> String {
    let text = normalize_newlines(text);
    let text = text.strip_prefix('\n').unwrap_or(&text);
    let text = text.strip_suffix('\n').unwrap_or(text);
    text.to_string()
}

/// Text after an echoed end marker: drop the closing quote of the echoed
/// `echo "<end>"` and surrounding whitespace.
fn clean_error_tail(text: &str) -> String {
    let text = normalize_newlines(text);
    text.trim_start_matches('"').trim().to_string()
}

/// Incremental parser for one invocation's slice of the shell stream.
///
/// Decoded text is kept across chunks and each marker is only searched for
/// in the newly arrived text (plus enough overlap to catch a marker split
/// between chunks), so a long-running command costs linear time.
pub struct MarkerParser {
    markers: Markers,
    detector: Arc<dyn ErrorDetector>,
    text: String,
    /// Trailing bytes of an unfinished UTF-8 sequence
    partial: Vec<u8>,
    last_begin: Option<usize>,
    last_end: Option<usize>,
    stderr: String,
}

impl MarkerParser {
    pub fn new(markers: Markers, detector: Arc<dyn ErrorDetector>) -> Self {
        Self {
            markers,
            detector,
            text: String::new(),
            partial: Vec::new(),
            last_begin: None,
            last_end: None,
            stderr: String::new(),
        }
    }

    /// Feed a chunk from the shell's output stream. Returns the result once
    /// the invocation is complete; chunks need not align with lines or even
    /// with UTF-8 boundaries.
    pub fn push_stdout(&mut self, chunk: &[u8]) -> Option<CommandExecutionResult> {
        let start = self.decode(chunk);
        self.scan_markers(start);

        let error_fired = self.detector.is_error(&self.text[start..]);
        if !error_fired && self.last_end.is_none() {
            return None;
        }

        let (Some(begin_idx), Some(end_idx)) = (self.last_begin, self.last_end) else {
            tracing::trace!("Tentative match without both markers, waiting for more output");
            return None;
        };

        if begin_idx >= end_idx {
            tracing::trace!("Last begin marker follows last end marker, waiting for more output");
            return None;
        }

        let text = &self.text;
        let begin = self.markers.begin();
        let end = self.markers.end();

        let tail = &text[end_idx + end.len()..];
        if error_fired && self.detector.is_error(tail) {
            tracing::debug!("Error indicator after the last end marker, command aborted");
            return Some(self.assemble(clean_error_tail(tail), false));
        }

        if ends_with_echo_invocation(&text[..end_idx]) {
            tracing::trace!("End marker is the terminal echo of our own input, skipping");
            return None;
        }

        let delimited = &text[begin_idx + begin.len()..end_idx];
        let success = !self.detector.is_error(delimited);
        Some(self.assemble(clean_delimited(delimited), success))
    }

    /// Append a chunk to the decoded text, holding back an unfinished
    /// multibyte sequence. Invalid bytes become U+FFFD. Returns where the
    /// new text starts.
    fn decode(&mut self, chunk: &[u8]) -> usize {
        let start = self.text.len();
        self.partial.extend_from_slice(chunk);
        let bytes = std::mem::take(&mut self.partial);

        let mut rest = bytes.as_slice();
        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    self.text.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    self.text.push_str(&String::from_utf8_lossy(valid));
                    match e.error_len() {
                        Some(len) => {
                            self.text.push(char::REPLACEMENT_CHARACTER);
                            rest = &after[len..];
                        }
                        None => {
                            self.partial = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }

        start
    }

    /// Update the last seen marker positions from text appended at `start`
    fn scan_markers(&mut self, start: usize) {
        let text = &self.text;
        let find_last = |marker: &str| {
            let mut from = start.saturating_sub(marker.len().saturating_sub(1));
            while !text.is_char_boundary(from) {
                from -= 1;
            }
            text[from..].rfind(marker).map(|idx| from + idx)
        };

        if let Some(idx) = find_last(self.markers.begin()) {
            self.last_begin = Some(idx);
        }
        if let Some(idx) = find_last(self.markers.end()) {
            self.last_end = Some(idx);
        }
    }

    /// Data from the stderr side channel, when the transport keeps one
    pub fn push_stderr(&mut self, chunk: &[u8]) {
        self.stderr.push_str(&String::from_utf8_lossy(chunk));
    }

    /// The channel went away before the invocation completed
    pub fn finish_closed(self) -> CommandExecutionResult {
        let mut text = self.text.clone();
        text.push_str(&String::from_utf8_lossy(&self.partial));
        let output = normalize_newlines(&text).trim().to_string();
        let mut result = self.assemble(output, false);
        if result.output.is_empty() {
            result.output = "Shell channel closed before the command completed".to_string();
        }
        result
    }

    fn assemble(&self, mut output: String, success: bool) -> CommandExecutionResult {
        if self.stderr.is_empty() {
            return CommandExecutionResult { output, success };
        }

        if !output.is_empty() && !output.ends_with('\n') {
            output.push('\n');
        }
        output.push_str(&normalize_newlines(&self.stderr));

        CommandExecutionResult::failure(output)
    }
}

/// How an invocation on a shared shell ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub result: CommandExecutionResult,
    /// The channel closed before the end marker arrived; the shell is gone
    pub channel_closed: bool,
}

/// Run one command on an open shell and wait for its markers.
///
/// Errors are only returned for transport problems (the line could not be
/// written) or a command that contains the marker text. Everything the
/// command itself does ends up in the returned [`Completion`].
pub async fn run_command(
    shell: &mut dyn ShellChannel,
    command: &str,
    markers: Markers,
    detector: Arc<dyn ErrorDetector>,
) -> Result<Completion> {
    if markers.collides_with(command) {
        return Err(SshError::ReservedMarker(markers.end().to_string()).into());
    }

    let line = markers.compose(command);
    tracing::trace!("Writing composite line to shell: {line:?}");
    shell.write(line.as_bytes()).await?;

    let mut parser = MarkerParser::new(markers, detector);

    loop {
        match shell.recv().await {
            ShellEvent::Stdout(data) => {
                tracing::trace!("Shell stdout chunk of {} bytes", data.len());
                if let Some(result) = parser.push_stdout(&data) {
                    return Ok(Completion {
                        result,
                        channel_closed: false,
                    });
                }
            }
            ShellEvent::Stderr(data) => {
                tracing::trace!("Shell stderr chunk of {} bytes", data.len());
                parser.push_stderr(&data);
            }
            ShellEvent::Closed => {
                tracing::debug!("Shell closed before end marker was seen");
                return Ok(Completion {
                    result: parser.finish_closed(),
                    channel_closed: true,
                });
            }
        }
    }
}
