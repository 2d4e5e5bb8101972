// An in-memory stand-in for a remote host, used by the pool tests.
//
// The shell understands just enough to exercise the pool: it echoes every
// line it receives the way a PTY does, then runs `;`/`&&` separated
// `echo`, `cd`, `pwd`, `export`, `exit`, `warn` (writes to stderr) and
// `hang` (never finishes). Anything else is "command not found".

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use eyre::Result;

use crate::config::PtyConfig;
use crate::execution::ConnectParams;
use crate::ssh::error::SshError;
use crate::ssh::transport::{CommandOutput, Connector, ShellChannel, ShellEvent, Transport};

pub const BAD_PASSWORD: &str = "wrong";

#[derive(Default)]
pub struct FakeConnector {
    connects: AtomicUsize,
    transports: Mutex<Vec<Arc<FakeTransport>>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Successful connections made so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn transport(&self, index: usize) -> Arc<FakeTransport> {
        self.transports.lock().unwrap()[index].clone()
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, params: &ConnectParams) -> Result<Arc<dyn Transport>> {
        // Give racing callers a chance to interleave
        tokio::task::yield_now().await;

        if params.password == BAD_PASSWORD {
            return Err(SshError::Authentication {
                username: params.username.clone(),
                host: params.address(),
            }
            .into());
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let transport = Arc::new(FakeTransport::default());
        self.transports.lock().unwrap().push(transport.clone());
        Ok(transport)
    }
}

#[derive(Default)]
pub struct FakeTransport {
    closed: AtomicBool,
    shells_opened: AtomicUsize,
    shells_closed: Arc<AtomicUsize>,
}

impl FakeTransport {
    /// Simulate the remote end dropping the connection
    pub fn kill(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn shells_opened(&self) -> usize {
        self.shells_opened.load(Ordering::SeqCst)
    }

    pub fn shells_closed(&self) -> usize {
        self.shells_closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn exec(&self, command: &str) -> Result<CommandOutput> {
        let mut shell = FakeShell::new(self.shells_closed.clone());
        let mut output = CommandOutput::default();
        let mut code = 0;

        for event in shell.run_line(command) {
            match event {
                ShellEvent::Stdout(data) => output.stdout.push_str(&String::from_utf8_lossy(&data)),
                ShellEvent::Stderr(data) => {
                    code = 1;
                    output.stderr.push_str(&String::from_utf8_lossy(&data))
                }
                ShellEvent::Closed => break,
            }
        }

        output.exit_code = Some(code);
        Ok(output)
    }

    async fn open_shell(&self, _pty: &PtyConfig) -> Result<Box<dyn ShellChannel>> {
        if self.is_closed() {
            return Err(SshError::Channel("connection closed".into()).into());
        }
        self.shells_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeShell::new(self.shells_closed.clone())))
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct FakeShell {
    cwd: String,
    env: HashMap<String, String>,
    pending: VecDeque<ShellEvent>,
    /// Stop running the rest of the current line
    halted: bool,
    /// `exit` ran; the channel closes once pending output drains
    exited: bool,
    channel_closed: bool,
    shells_closed: Arc<AtomicUsize>,
}

impl FakeShell {
    fn new(shells_closed: Arc<AtomicUsize>) -> Self {
        Self {
            cwd: "/home/test".to_string(),
            env: HashMap::new(),
            pending: VecDeque::new(),
            halted: false,
            exited: false,
            channel_closed: false,
            shells_closed,
        }
    }

    fn stdout(text: String) -> ShellEvent {
        ShellEvent::Stdout(Bytes::from(text))
    }

    fn expand(&self, word: &str) -> String {
        let word = word.trim_matches('"');
        match word.strip_prefix('$') {
            Some(name) => self.env.get(name).cloned().unwrap_or_default(),
            None => word.to_string(),
        }
    }

    /// Run one simple command. Returns false if the rest of an `&&` chain
    /// should be skipped.
    fn run_simple(&mut self, command: &str, events: &mut Vec<ShellEvent>) -> bool {
        let command = command.trim();
        let (program, rest) = command.split_once(' ').unwrap_or((command, ""));

        match program {
            "" => true,
            "echo" => {
                let words: Vec<String> = rest.split_whitespace().map(|w| self.expand(w)).collect();
                events.push(Self::stdout(format!("{}\r\n", words.join(" "))));
                true
            }
            "pwd" => {
                events.push(Self::stdout(format!("{}\r\n", self.cwd)));
                true
            }
            "cd" => {
                let dir = self.expand(rest.trim());
                if dir.starts_with("/nope") {
                    events.push(Self::stdout(format!(
                        "-bash: cd: {dir}: No such file or directory\r\n"
                    )));
                    false
                } else {
                    self.cwd = dir;
                    true
                }
            }
            "export" => {
                if let Some((name, value)) = rest.split_once('=') {
                    let value = self.expand(value);
                    self.env.insert(name.trim().to_string(), value);
                }
                true
            }
            "warn" => {
                events.push(ShellEvent::Stderr(Bytes::from(format!("{rest}\n"))));
                true
            }
            "exit" => {
                self.halted = true;
                self.exited = true;
                events.push(Self::stdout("logout\r\n".to_string()));
                events.push(ShellEvent::Closed);
                false
            }
            "hang" => {
                self.halted = true;
                false
            }
            other => {
                events.push(Self::stdout(format!("-bash: {other}: command not found\r\n")));
                false
            }
        }
    }

    fn run_line(&mut self, line: &str) -> Vec<ShellEvent> {
        let mut events = Vec::new();
        self.halted = false;

        'statements: for statement in line.trim_end().split("; ") {
            for part in statement.split(" && ") {
                if !self.run_simple(part, &mut events) {
                    if self.halted {
                        break 'statements;
                    }
                    break;
                }
            }
        }

        events
    }
}

#[async_trait]
impl ShellChannel for FakeShell {
    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if self.exited || self.channel_closed {
            return Err(SshError::Channel("shell has exited".into()).into());
        }

        let line = String::from_utf8_lossy(data).to_string();
        // Terminal echo of the input comes first
        self.pending
            .push_back(Self::stdout(line.trim_end().to_string() + "\r\n"));
        let events = self.run_line(&line);
        self.pending.extend(events);
        Ok(())
    }

    async fn recv(&mut self) -> ShellEvent {
        if let Some(event) = self.pending.pop_front() {
            if event == ShellEvent::Closed {
                self.channel_closed = true;
            }
            return event;
        }

        if self.channel_closed {
            return ShellEvent::Closed;
        }

        // Nothing more until the next write
        std::future::pending().await
    }

    async fn close(&mut self) -> Result<()> {
        self.channel_closed = true;
        self.shells_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
