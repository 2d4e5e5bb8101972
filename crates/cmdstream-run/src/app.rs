use std::path::PathBuf;

use clap::{Args as ClapArgs, Parser, Subcommand};
use cmdstream_runtime::ConnectParams;

#[derive(Parser, Debug)]
#[command(name = "cmdstream", version, about = "Run shell commands locally or over pooled SSH sessions")]
pub struct Args {
    /// Print each result as a JSON object
    #[arg(long, global = true)]
    pub json: bool,

    /// Pool configuration file (defaults to <config dir>/cmdstream/config.yaml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Seconds a kept-alive session may sit idle
    #[arg(long, global = true)]
    pub idle_timeout: Option<u64>,

    /// Give up on a single command after this many seconds
    #[arg(long, global = true)]
    pub command_timeout: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run one command on its own connection, or locally when no host is given
    Exec {
        command: String,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
    /// Run commands one after another on a single shared shell
    Run {
        /// Pool key to run under; defaults to user@host:port
        #[arg(long)]
        session: Option<String>,

        /// Leave the session open after the last command
        #[arg(long)]
        keep_alive: bool,

        #[command(flatten)]
        connection: ConnectionArgs,

        #[arg(required = true)]
        commands: Vec<String>,
    },
    /// Run a command stream described in a YAML file
    Stream {
        file: PathBuf,

        #[command(flatten)]
        connection: ConnectionArgs,
    },
}

#[derive(ClapArgs, Debug, Clone, Default)]
pub struct ConnectionArgs {
    /// Remote host; commands run locally when omitted
    #[arg(long, short = 'H')]
    pub host: Option<String>,

    #[arg(long, short, default_value_t = 22)]
    pub port: u16,

    /// Login name (defaults to the current user)
    #[arg(long, short)]
    pub user: Option<String>,

    #[arg(long, env = "CMDSTREAM_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

impl ConnectionArgs {
    /// Connection parameters, if a host was given
    pub fn params(&self) -> Option<ConnectParams> {
        let host = self.host.as_ref()?;
        let username = self.user.clone().unwrap_or_else(whoami::username);

        Some(ConnectParams::new(
            host.clone(),
            self.port,
            username,
            self.password.clone().unwrap_or_default(),
        ))
    }
}
