mod cli;
mod commands;
mod error;
mod logging;
mod output;

use anyhow::Result;
use clap::Parser;
use cli::{Cli, Commands};
use pricewatch_core::AppConfig;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(err) = dispatch(cli).await {
        error::handle_error(err);
    }
}

async fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Completions { shell } => {
            commands::completions(shell);
            Ok(())
        }
        Commands::Reload { pid_file } => commands::reload::run(&pid_file),
        Commands::Rules { dir: Some(dir) } => {
            let _guard = logging::init(None, cli.verbose)?;
            commands::rules::run(&dir, cli.format)
        }
        Commands::Rules { dir: None } => {
            let config = AppConfig::load(&cli.config)?;
            let _guard = logging::init(None, cli.verbose)?;
            commands::rules::run(&config.task.rules, cli.format)
        }
        Commands::Run(args) => {
            let config = AppConfig::load(&cli.config)?;
            let _guard = logging::init(Some(&config.log), cli.verbose)?;
            commands::run::run(config, args).await
        }
        Commands::Crawl { urls } => {
            let config = AppConfig::load(&cli.config)?;
            let _guard = logging::init(Some(&config.log), cli.verbose)?;
            commands::crawl::crawl(config, &urls, cli.format).await
        }
        Commands::Normalize { urls } => {
            let config = AppConfig::load(&cli.config)?;
            let _guard = logging::init(Some(&config.log), cli.verbose)?;
            commands::crawl::normalize(config, &urls, cli.format).await
        }
    }
}
