use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use homedir::my_home;
use inquire::error::InquireResult;

mod cli;
mod collaborators;
mod config;
mod lock;
mod preset;
#[cfg(test)]
mod tests;
mod web;

use collaborators::RemoteCollaborator;
use config::Config;
use lock::FileLock;
use preset::{provider_from_config, EmbeddingPolicy, PresetQuery, PresetQueryIndex, VectorStorage};

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "llmparser=info,tower_http=info".into()),
        )
        .init();
}

/// `$LLMPARSER_BASE_PATH`, or `~/.local/share/llmparser`.
fn base_path() -> anyhow::Result<PathBuf> {
    if let Ok(path) = std::env::var("LLMPARSER_BASE_PATH") {
        return Ok(PathBuf::from(path));
    }

    let home = my_home()
        .context("could not determine home directory")?
        .context("home directory path is empty")?;

    Ok(home.join(".local/share/llmparser"))
}

fn open_index(config: &Config) -> anyhow::Result<PresetQueryIndex> {
    let embedder = provider_from_config(&config.embedding, config.base_path())
        .context("failed to initialize embedding provider")?;
    let policy = EmbeddingPolicy::from_config(&config.embedding);

    let index = if config.preset.persist {
        let storage = VectorStorage::new(config.base_path().join(preset::STORAGE_FILE));
        PresetQueryIndex::open(embedder, policy, storage).context("failed to load preset queries")?
    } else {
        PresetQueryIndex::in_memory(embedder, policy)
    };

    log::info!(
        "embedding model '{}' ({} dimensions), {} preset queries",
        index.model_name(),
        index.dimensions(),
        index.size()?
    );

    Ok(index)
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> anyhow::Result<()> {
    init_logging();

    let args = cli::Args::parse();

    #[cfg(feature = "markdown-docs")]
    if let cli::Command::MarkdownDocs {} = args.command {
        clap_markdown::print_help_markdown::<cli::Args>();
        return Ok(());
    }

    let config = Config::load_with(&base_path()?)?;

    let _lock = FileLock::try_acquire(config.base_path()).with_context(|| {
        format!(
            "failed to lock {}; is another llmparser running?",
            config.base_path().display()
        )
    })?;

    let index = open_index(&config)?;

    match args.command {
        #[cfg(feature = "markdown-docs")]
        cli::Command::MarkdownDocs {} => Ok(()),

        cli::Command::Daemon { host, port } => {
            let collaborators = &config.collaborators;
            let state = web::SharedState {
                index: Arc::new(index),
                text2sql: Arc::new(RemoteCollaborator::text2sql(collaborators)?),
                plugins: Arc::new(RemoteCollaborator::plugin_selector(collaborators)?),
                default_n_results: config.preset.default_n_results,
            };

            let host = host.unwrap_or_else(|| config.server.host.clone());
            let port = port.unwrap_or(config.server.port);

            web::start_daemon(state, &host, port)
        }

        cli::Command::Size {} => {
            println!("{}", index.size()?);
            Ok(())
        }

        cli::Command::Retrieve { queries, n_results } => {
            let n_results = n_results.unwrap_or(config.preset.default_n_results);
            print_json(&index.retrieve(&queries, n_results)?)
        }

        cli::Command::Get { ids } => {
            let records = index.get_by_ids(&ids)?;

            for (id, record) in ids.iter().zip(&records) {
                if record.is_none() {
                    log::warn!("preset query '{id}' not found");
                }
            }

            print_json(&records.into_iter().flatten().collect::<Vec<_>>())
        }

        cli::Command::Delete { ids } => {
            let removed = index.delete_by_ids(&ids)?;
            println!("{removed} preset queries removed");
            Ok(())
        }

        cli::Command::Import { file } => {
            let content = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let presets: Vec<PresetQuery> = serde_json::from_str(&content)
                .with_context(|| format!("{} is not a list of preset queries", file.display()))?;

            let report = index.add(presets)?;
            println!("{} preset queries added", report.applied.len());

            if !report.is_complete() {
                for failure in &report.failed {
                    eprintln!("{}: {}", failure.id, failure.error);
                }
                bail!("{} preset queries could not be embedded", report.failed.len());
            }

            Ok(())
        }

        cli::Command::Empty { yes } => {
            let size = index.size()?;

            if !yes {
                match inquire::prompt_confirmation(format!(
                    "Are you sure you want to delete all {size} preset queries?"
                )) {
                    InquireResult::Ok(true) => {}
                    InquireResult::Ok(false) => return Ok(()),
                    InquireResult::Err(err) => bail!("An error occurred: {}", err),
                }
            }

            index.empty()?;
            println!("{size} preset queries removed");
            Ok(())
        }
    }
}
