use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Generate cli docs in markdown format
    #[cfg(feature = "markdown-docs")]
    #[clap(hide = true)]
    MarkdownDocs {},

    /// Start llmparser as a service.
    Daemon {
        /// Address to bind. Overrides config.yaml and LLMPARSER_HOST.
        #[clap(long)]
        host: Option<String>,

        /// Port to bind. Overrides config.yaml and LLMPARSER_PORT.
        #[clap(short, long)]
        port: Option<u16>,
    },
    /// Print the number of stored preset queries
    Size {},
    /// Find the preset queries closest to each query
    Retrieve {
        /// One or more query texts
        #[clap(required = true)]
        queries: Vec<String>,

        /// Matches per query (defaults to preset.default_n_results)
        #[clap(short = 'n', long)]
        n_results: Option<usize>,
    },
    /// Print preset queries by id
    Get {
        #[clap(required = true)]
        ids: Vec<String>,
    },
    /// Delete preset queries by id
    Delete {
        #[clap(required = true)]
        ids: Vec<String>,
    },
    /// Add preset queries from a JSON file of [{preset_query, preset_query_id}]
    Import {
        file: PathBuf,
    },
    /// Remove every preset query
    Empty {
        /// Auto confirm
        #[clap(short, long, default_value = "false")]
        yes: bool,
    },
}
