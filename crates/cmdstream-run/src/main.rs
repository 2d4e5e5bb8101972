use clap::Parser;
use cmdstream_runtime::SshPoolHandle;
use eyre::{eyre, Result};

use crate::{
    app::{Args, Command},
    executor::{all_succeeded, Executor},
};

mod app;
mod config;
mod executor;
mod streams;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    cmdstream_runtime::init_tracing();

    let pool_config = config::load_config(args.config.as_deref())?;
    let pool_config = config::apply_overrides(pool_config, &args);
    let executor = Executor::new(SshPoolHandle::new(pool_config), args.json);

    let results = match &args.command {
        Command::Exec {
            command,
            connection,
        } => executor.exec(command, connection.params().as_ref()).await?,
        Command::Run {
            session,
            keep_alive,
            connection,
            commands,
        } => {
            let params = connection
                .params()
                .ok_or_else(|| eyre!("`run` needs a remote host (--host)"))?;
            executor
                .run(commands, &params, session.as_deref(), *keep_alive)
                .await?
        }
        Command::Stream { file, connection } => {
            let stream = streams::load_stream(file).await?;
            executor
                .stream(&stream, connection.params().as_ref())
                .await?
        }
    };

    if !all_succeeded(&results) {
        std::process::exit(1);
    }

    Ok(())
}
