mod cli;

use channel_host::config::HostConfig;
use clap::Parser;
use cli::{Cli, CliContext};

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = HostConfig::load(Some(cli.env_file.as_path()))?;
    let context = CliContext::new(config);
    let command = cli.command.unwrap_or_else(cli::default_command);
    cli::execute(&context, command).await
}
