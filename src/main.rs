use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};

use sd_graph::{assemble_graph, config, graph::GraphVariant};

#[derive(Parser, Debug)]
struct CommandLineFlags {
    /// Session file describing the generation request.
    #[arg(long, short)]
    pub config_path: String,
    /// Build this variant instead of the one in the session file.
    #[arg(long)]
    pub variant: Option<GraphVariant>,
    #[arg(long)]
    pub pretty: bool,
}

fn main() -> Result<()> {
    env_logger::init();
    let args = CommandLineFlags::parse();

    // Immediately crash on panic.
    std::panic::set_hook(Box::new(|panic_info| {
        error!("Panic: {:?}", panic_info);
        std::process::exit(1);
    }));

    let mut session = config::read_config(&args.config_path).context("failed to load session")?;
    if let Some(variant) = args.variant {
        info!("Overriding variant {} with {}", session.variant, variant);
        session.variant = variant;
    }

    let graph = assemble_graph(&session).context("failed to assemble graph")?;
    let json = if args.pretty {
        serde_json::to_string_pretty(&graph)
    } else {
        serde_json::to_string(&graph)
    }
    .context("failed to serialize graph")?;
    println!("{}", json);
    Ok(())
}
