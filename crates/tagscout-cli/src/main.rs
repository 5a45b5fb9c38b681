use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tagscout_sync::{DiscoveryConfig, DiscoveryState};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "tagscout")]
#[command(about = "Discover tagged media on a randomized schedule")]
struct Cli {
    #[command(flatten)]
    overrides: Overrides,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the discovery loop until killed.
    Run,
    /// Ingest the metadata directory once, persist, and exit.
    Ingest,
    /// Print the sizes of the persisted tag registry and media inventory.
    Stats,
}

#[derive(Debug, Args)]
struct Overrides {
    #[arg(long, global = true)]
    metadata_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    inventory_file: Option<PathBuf>,
    #[arg(long, global = true)]
    tags_file: Option<PathBuf>,
    #[arg(long, global = true)]
    scraper_bin: Option<PathBuf>,
    #[arg(long, short = 'u', global = true)]
    login_user: Option<String>,
    #[arg(long, short = 'p', global = true)]
    login_pass: Option<String>,
    /// Tag to add to the registry at startup; repeatable.
    #[arg(long = "seed-tag", global = true)]
    seed_tags: Vec<String>,
    #[arg(long, global = true)]
    rng_seed: Option<u64>,
}

impl Overrides {
    fn apply(self, mut config: DiscoveryConfig) -> DiscoveryConfig {
        if let Some(dir) = self.metadata_dir {
            config.metadata_dir = dir;
        }
        if let Some(path) = self.inventory_file {
            config.inventory_file = path;
        }
        if let Some(path) = self.tags_file {
            config.tags_file = path;
        }
        if let Some(bin) = self.scraper_bin {
            config.scraper_bin = bin;
        }
        if self.login_user.is_some() {
            config.login_user = self.login_user;
        }
        if self.login_pass.is_some() {
            config.login_pass = self.login_pass;
        }
        if self.rng_seed.is_some() {
            config.rng_seed = self.rng_seed;
        }
        config.seed_tags.extend(self.seed_tags);
        config
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("tagscout=info".parse()?))
        .init();

    let cli = Cli::parse();
    let config = cli.overrides.apply(DiscoveryConfig::from_env());

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            info!(metadata_dir = %config.metadata_dir.display(), "starting discovery loop");
            match tagscout_sync::run_discovery(config).await? {}
        }
        Commands::Ingest => {
            let snapshot = tagscout_sync::ingest_once(&config).await?;
            println!(
                "ingest complete: documents={} skipped_documents={} skipped_entries={} new_tags={} new_media={} tags={} media={}",
                snapshot.report.documents_scanned,
                snapshot.report.documents_skipped,
                snapshot.report.entries_skipped,
                snapshot.report.new_tags,
                snapshot.report.new_media,
                snapshot.tag_count,
                snapshot.media_count
            );
        }
        Commands::Stats => {
            let state = DiscoveryState::load(config.state_store()).await?;
            println!(
                "tags={} media={} tags_file={} inventory_file={}",
                state.registry().len(),
                state.inventory().len(),
                config.tags_file.display(),
                config.inventory_file.display()
            );
        }
    }

    Ok(())
}
