use std::fs;
use std::path::PathBuf;

use channel_host::channel::{ChannelEvent, ChannelRegistration};
use channel_host::session::Session;
use channel_plugin::{ChannelMessage, ChannelMetadata};
use clap::Args;
use schemars::schema_for;

use super::CliContext;

#[derive(Args, Debug)]
pub struct SchemaArgs {
    /// Directory to write `<name>.schema.json` files into; prints to stdout when absent
    #[arg(long)]
    pub out_dir: Option<PathBuf>,
}

pub async fn execute(args: SchemaArgs, _context: &CliContext) -> anyhow::Result<()> {
    let schemas = [
        ("channel_message", schema_for!(ChannelMessage)),
        ("channel_metadata", schema_for!(ChannelMetadata)),
        ("channel_event", schema_for!(ChannelEvent)),
        ("channel_registration", schema_for!(ChannelRegistration)),
        ("session", schema_for!(Session)),
    ];
    if let Some(dir) = &args.out_dir {
        fs::create_dir_all(dir)?;
    }
    for (name, schema) in schemas {
        let text = serde_json::to_string_pretty(&schema)?;
        match &args.out_dir {
            Some(dir) => {
                let path = dir.join(format!("{name}.schema.json"));
                fs::write(&path, text)?;
                println!("wrote {}", path.display());
            }
            None => println!("{text}"),
        }
    }
    Ok(())
}
