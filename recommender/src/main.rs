//! Pantry recommender CLI
//!
//! # Commands
//!
//! - `build`: load the corpus, warm the asset cache and print service stats
//! - `recommend`: rank recipes for a pantry and print them as JSON

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use pantry_recommender::{EmbeddingProviderType, RecommenderConfig, RecommenderService};
use tracing_subscriber::{EnvFilter, fmt};

/// Recommend recipes from the ingredients you have at home.
#[derive(Parser)]
#[command(name = "pantry-recommend")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// TOML configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Recipe corpus (.json, .jsonl, .csv or .parquet).
    #[arg(long, global = true)]
    corpus: Option<PathBuf>,

    /// Asset cache file.
    #[arg(long, global = true, conflicts_with = "no_asset_cache")]
    asset_cache: Option<PathBuf>,

    /// Always embed the corpus and never write the asset cache.
    #[arg(long, global = true)]
    no_asset_cache: bool,

    /// Embedding provider.
    #[arg(long, global = true, value_enum)]
    provider: Option<ProviderArg>,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build or validate the cached index and print stats.
    Build,

    /// Recommend recipes for a pantry.
    Recommend {
        /// Pantry item. Repeat for each item.
        #[arg(long = "item", required = true)]
        items: Vec<String>,

        /// Number of recipes to return.
        #[arg(long, default_value_t = 5)]
        top_n: usize,

        /// User id for the per-user query cache.
        #[arg(long)]
        user: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum ProviderArg {
    Hashing,
    Openai,
}

impl From<ProviderArg> for EmbeddingProviderType {
    fn from(arg: ProviderArg) -> Self {
        match arg {
            ProviderArg::Hashing => Self::Hashing,
            ProviderArg::Openai => Self::OpenAI,
        }
    }
}

impl Cli {
    fn resolve_config(&self) -> anyhow::Result<RecommenderConfig> {
        let mut config = match &self.config {
            Some(path) => RecommenderConfig::load(path)?,
            None => RecommenderConfig::default(),
        };

        if let Some(corpus) = &self.corpus {
            config.corpus.path = corpus.clone();
        }
        if let Some(asset_cache) = &self.asset_cache {
            config.cache.asset_path = Some(asset_cache.clone());
        }
        if self.no_asset_cache {
            config.cache.asset_path = None;
        }
        if let Some(provider) = self.provider {
            config.embedding.provider = provider.into();
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        1 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = cli.resolve_config()?;
    let service = RecommenderService::from_config(config)
        .await
        .context("failed to start recommender")?;

    match cli.command {
        Commands::Build => {
            println!("{}", serde_json::to_string_pretty(&service.stats())?);
        }
        Commands::Recommend { items, top_n, user } => {
            let results = service.recommend(&items, top_n, user.as_deref()).await?;
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
    }

    Ok(())
}
