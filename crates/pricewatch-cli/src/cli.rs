use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use std::path::PathBuf;

/// Output format for CLI commands
#[derive(ValueEnum, Clone, Copy, Debug, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl OutputFormat {
    pub fn is_json(self) -> bool {
        matches!(self, OutputFormat::Json)
    }
}

#[derive(Parser)]
#[command(name = "pricewatch")]
#[command(version, about = "Pricewatch - rule-driven product price crawler")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file
    #[arg(
        short,
        long,
        global = true,
        env = "PRICEWATCH_CONFIG",
        default_value = "pricewatch.toml"
    )]
    pub config: PathBuf,

    /// Also write logs to stderr
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },

    /// Run the crawl service until interrupted
    Run(RunArgs),

    /// Crawl product pages once and print the results as JSON
    Crawl {
        /// Product or share links
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Resolve links to canonical product URLs
    Normalize {
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Validate a rule directory and list its rules
    Rules {
        /// Rule directory (defaults to the configured one)
        dir: Option<PathBuf>,
    },

    /// Ask a running service to reload its rules
    Reload {
        /// PID file written by `pricewatch run --pid-file`
        #[arg(long)]
        pid_file: PathBuf,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Write the service PID to this file
    #[arg(long)]
    pub pid_file: Option<PathBuf>,
}
