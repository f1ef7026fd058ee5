mod cli;
mod commands;

use clap::Parser;
use cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version {
            client_only,
            timeout,
        } => commands::version::run(client_only, &timeout).await?,
        Commands::Check => commands::check::run().await?,
        Commands::Operator => commands::operator::run().await?,
        Commands::Crd { action } => commands::crd::run(action).await?,
        Commands::Webhook { action } => commands::webhook::run(action).await?,
        Commands::Pause {
            skyhook,
            confirm,
            dry_run,
        } => commands::flow::pause(&skyhook, true, confirm, dry_run).await?,
        Commands::Resume {
            skyhook,
            confirm,
            dry_run,
        } => commands::flow::pause(&skyhook, false, confirm, dry_run).await?,
        Commands::Disable {
            skyhook,
            confirm,
            dry_run,
        } => commands::flow::disable(&skyhook, true, confirm, dry_run).await?,
        Commands::Enable {
            skyhook,
            confirm,
            dry_run,
        } => commands::flow::disable(&skyhook, false, confirm, dry_run).await?,
        Commands::Node { action } => commands::node::run(action).await?,
        Commands::Package { action } => commands::package::run(action).await?,
    }

    Ok(())
}
