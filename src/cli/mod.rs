use std::path::PathBuf;

use channel_host::config::HostConfig;
use clap::{Parser, Subcommand};

pub mod probe;
pub mod run;
pub mod schema;

use probe::ProbeArgs;
use run::RunArgs;
use schema::SchemaArgs;

#[derive(Parser, Debug)]
#[command(
    name = "channel-host",
    about = "Host-side channel runtime",
    version = "0.1.0"
)]
pub struct Cli {
    /// Optional .env file loaded before reading CHANNEL_HOST_* settings
    #[arg(long, global = true, default_value = ".env")]
    pub env_file: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the runtime with a local console channel
    Run(RunArgs),

    /// Issue one GET through the host HTTP client
    Probe(ProbeArgs),

    /// Emit JSON-Schema for the wire types
    Schema(SchemaArgs),
}

#[derive(Clone, Debug)]
pub struct CliContext {
    pub config: HostConfig,
}

impl CliContext {
    pub fn new(config: HostConfig) -> Self {
        Self { config }
    }
}

pub async fn execute(context: &CliContext, command: Commands) -> anyhow::Result<()> {
    match command {
        Commands::Run(args) => run::execute(args, context).await,
        Commands::Probe(args) => probe::execute(args, context).await,
        Commands::Schema(args) => schema::execute(args, context).await,
    }
}

pub fn default_command() -> Commands {
    Commands::Run(RunArgs::default_runtime())
}
