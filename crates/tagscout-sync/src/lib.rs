//! Discovery loop: ingest fetched metadata, checkpoint state, pick the next tag,
//! wait a randomized delay, run the fetch client, repeat.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tagscout_adapters::{
    load_document, AuthMode, CommandFetchClientFactory, CredentialPairError, FetchClientFactory,
    FetchConfig, FetchError, RawMetadataDocument, DEFAULT_SCRAPER_BIN, METADATA_SUFFIX,
};
use tagscout_core::{MediaInventory, TagRegistry};
use tagscout_storage::StateStore;
use thiserror::Error;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "tagscout-sync";

pub const DEFAULT_DELAY_MEAN_SECS: f64 = 90.0;
pub const DEFAULT_DELAY_STD_DEV_SECS: f64 = 180.0;
pub const DEFAULT_MAX_VOLUME: u32 = 12;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error(transparent)]
    Credentials(#[from] CredentialPairError),
    #[error("max volume must be at least 1")]
    InvalidMaxVolume,
    #[error("delay distribution needs a finite mean and a finite, non-negative std dev (got {mean}, {std_dev})")]
    InvalidDelay { mean: f64, std_dev: f64 },
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub metadata_dir: PathBuf,
    pub inventory_file: PathBuf,
    pub tags_file: PathBuf,
    pub scraper_bin: PathBuf,
    pub login_user: Option<String>,
    pub login_pass: Option<String>,
    pub media_types: Vec<String>,
    pub fetch_timeout_secs: u64,
    pub delay_mean_secs: f64,
    pub delay_std_dev_secs: f64,
    pub max_volume: u32,
    pub rng_seed: Option<u64>,
    pub seed_tags: Vec<String>,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            metadata_dir: PathBuf::from("./img"),
            inventory_file: PathBuf::from("image_data.csv"),
            tags_file: PathBuf::from("tags.csv"),
            scraper_bin: PathBuf::from(DEFAULT_SCRAPER_BIN),
            login_user: None,
            login_pass: None,
            media_types: vec!["image".to_string()],
            fetch_timeout_secs: 900,
            delay_mean_secs: DEFAULT_DELAY_MEAN_SECS,
            delay_std_dev_secs: DEFAULT_DELAY_STD_DEV_SECS,
            max_volume: DEFAULT_MAX_VOLUME,
            rng_seed: None,
            seed_tags: Vec::new(),
        }
    }
}

impl DiscoveryConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            metadata_dir: env_var("TAGSCOUT_METADATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.metadata_dir),
            inventory_file: env_var("TAGSCOUT_INVENTORY_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.inventory_file),
            tags_file: env_var("TAGSCOUT_TAGS_FILE")
                .map(PathBuf::from)
                .unwrap_or(defaults.tags_file),
            scraper_bin: env_var("TAGSCOUT_SCRAPER_BIN")
                .map(PathBuf::from)
                .unwrap_or(defaults.scraper_bin),
            login_user: env_var("TAGSCOUT_LOGIN_USER"),
            login_pass: env_var("TAGSCOUT_LOGIN_PASS"),
            media_types: env_var("TAGSCOUT_MEDIA_TYPES")
                .map(|v| parse_delimited(&v))
                .unwrap_or(defaults.media_types),
            fetch_timeout_secs: env_parse("TAGSCOUT_FETCH_TIMEOUT_SECS")
                .unwrap_or(defaults.fetch_timeout_secs),
            delay_mean_secs: env_parse("TAGSCOUT_DELAY_MEAN_SECS")
                .unwrap_or(defaults.delay_mean_secs),
            delay_std_dev_secs: env_parse("TAGSCOUT_DELAY_STD_DEV_SECS")
                .unwrap_or(defaults.delay_std_dev_secs),
            max_volume: env_parse("TAGSCOUT_MAX_VOLUME").unwrap_or(defaults.max_volume),
            rng_seed: env_parse("TAGSCOUT_RNG_SEED"),
            seed_tags: defaults.seed_tags,
        }
    }

    /// Check the settings and decide, once, how fetches authenticate.
    pub fn validate(&self) -> Result<AuthMode, ConfigError> {
        if self.max_volume == 0 {
            return Err(ConfigError::InvalidMaxVolume);
        }
        self.delay_distribution()?;
        Ok(AuthMode::from_login(
            self.login_user.clone(),
            self.login_pass.clone(),
        )?)
    }

    pub fn delay_distribution(&self) -> Result<DelayDistribution, ConfigError> {
        DelayDistribution::new(self.delay_mean_secs, self.delay_std_dev_secs)
    }

    pub fn state_store(&self) -> StateStore {
        StateStore::new(&self.tags_file, &self.inventory_file)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    env_var(name).and_then(|v| v.parse().ok())
}

/// Split a list given as one string on commas, semicolons, or whitespace.
pub fn parse_delimited(input: &str) -> Vec<String> {
    input
        .split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|part| !part.is_empty())
        .map(str::to_string)
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub documents_scanned: usize,
    pub documents_skipped: usize,
    pub entries_seen: usize,
    pub entries_skipped: usize,
    pub new_tags: usize,
    pub new_media: usize,
}

impl IngestReport {
    fn absorb(&mut self, other: IngestReport) {
        self.documents_scanned += other.documents_scanned;
        self.documents_skipped += other.documents_skipped;
        self.entries_seen += other.entries_seen;
        self.entries_skipped += other.entries_skipped;
        self.new_tags += other.new_tags;
        self.new_media += other.new_media;
    }
}

/// Merge one document's tags and media into the registry and inventory.
/// Unusable entries are logged and skipped; nothing here is fatal.
pub fn ingest_document(
    document: &RawMetadataDocument,
    source: &str,
    registry: &mut TagRegistry,
    inventory: &mut MediaInventory,
) -> IngestReport {
    let mut report = IngestReport {
        documents_scanned: 1,
        ..Default::default()
    };

    debug!(file = source, entries = document.len(), "ingesting metadata document");
    for entry in document.entries() {
        report.entries_seen += 1;

        let tags = entry.tags();
        if tags.is_empty() {
            debug!(file = source, entry = entry.position(), "media entry has no tags");
        }
        report.new_tags += registry.extend(tags);

        match entry.media_record() {
            Ok(record) => {
                if inventory.insert_if_absent(record) {
                    report.new_media += 1;
                }
            }
            Err(err) => {
                report.entries_skipped += 1;
                warn!(file = source, entry = entry.position(), error = %err, "skipping media entry");
            }
        }
    }

    report
}

/// Scan `dir` for metadata documents (in file-name order) and merge each one.
///
/// Only an unreadable directory is an error. Documents that cannot be read or
/// parsed are logged and skipped; source files are never modified.
pub async fn ingest_directory(
    dir: &Path,
    registry: &mut TagRegistry,
    inventory: &mut MediaInventory,
) -> Result<IngestReport> {
    let mut listing = tokio::fs::read_dir(dir)
        .await
        .with_context(|| format!("reading metadata directory {}", dir.display()))?;

    let mut paths = Vec::new();
    while let Some(entry) = listing
        .next_entry()
        .await
        .with_context(|| format!("listing metadata directory {}", dir.display()))?
    {
        let path = entry.path();
        let is_document = path
            .file_name()
            .map(|name| name.to_string_lossy().ends_with(METADATA_SUFFIX))
            .unwrap_or(false);
        if is_document {
            paths.push(path);
        }
    }
    paths.sort();

    let mut report = IngestReport::default();
    for path in paths {
        let source = path.display().to_string();
        match load_document(&path).await {
            Ok(document) => {
                report.absorb(ingest_document(&document, &source, registry, inventory));
            }
            Err(err) => {
                report.documents_scanned += 1;
                report.documents_skipped += 1;
                warn!(file = %source, error = %err, "skipping metadata document");
            }
        }
    }
    Ok(report)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FetchTarget {
    pub tag: String,
    pub volume: u32,
}

/// Uniform pick with replacement over the whole registry.
pub fn select_tag<R: Rng + ?Sized>(registry: &TagRegistry, rng: &mut R) -> Option<String> {
    if registry.is_empty() {
        return None;
    }
    let index = rng.random_range(0..registry.len());
    registry.get(index).map(str::to_string)
}

/// Uniform fetch volume in `1..=max_volume`.
pub fn select_volume<R: Rng + ?Sized>(max_volume: u32, rng: &mut R) -> u32 {
    rng.random_range(1..=max_volume.max(1))
}

pub fn select_target<R: Rng + ?Sized>(
    registry: &TagRegistry,
    max_volume: u32,
    rng: &mut R,
) -> Option<FetchTarget> {
    let volume = select_volume(max_volume, rng);
    select_tag(registry, rng).map(|tag| FetchTarget { tag, volume })
}

/// Delay in whole seconds drawn as `floor(|N(mean, std_dev)|)`: usually short,
/// occasionally long, never bounded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelayDistribution {
    mean_secs: f64,
    std_dev_secs: f64,
}

impl Default for DelayDistribution {
    fn default() -> Self {
        Self {
            mean_secs: DEFAULT_DELAY_MEAN_SECS,
            std_dev_secs: DEFAULT_DELAY_STD_DEV_SECS,
        }
    }
}

impl DelayDistribution {
    pub fn new(mean_secs: f64, std_dev_secs: f64) -> Result<Self, ConfigError> {
        if !mean_secs.is_finite() || !std_dev_secs.is_finite() || std_dev_secs < 0.0 {
            return Err(ConfigError::InvalidDelay {
                mean: mean_secs,
                std_dev: std_dev_secs,
            });
        }
        Ok(Self {
            mean_secs,
            std_dev_secs,
        })
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let value = self.mean_secs + self.std_dev_secs * standard_normal(rng);
        Duration::from_secs(value.abs().floor() as u64)
    }
}

// Box-Muller; u1 is drawn from (0, 1] so ln(u1) stays finite.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f64 {
    let u1 = 1.0 - rng.random::<f64>();
    let u2 = rng.random::<f64>();
    (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
}

/// Suspension point between cycles.
#[async_trait]
pub trait Pause: Send + Sync {
    async fn pause(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioPause;

#[async_trait]
impl Pause for TokioPause {
    async fn pause(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FetchOutcome {
    Completed,
    Failed { reason: String },
    Skipped,
}

/// Runs the fetch client for one target and contains every failure it raises.
pub struct FetchInvoker {
    factory: Box<dyn FetchClientFactory>,
    auth: AuthMode,
    destination: PathBuf,
    media_types: Vec<String>,
}

impl FetchInvoker {
    pub fn new(
        factory: Box<dyn FetchClientFactory>,
        auth: AuthMode,
        destination: impl Into<PathBuf>,
        media_types: Vec<String>,
    ) -> Self {
        Self {
            factory,
            auth,
            destination: destination.into(),
            media_types,
        }
    }

    pub async fn invoke(&self, target: &FetchTarget) -> FetchOutcome {
        match self.try_invoke(target).await {
            Ok(()) => {
                info!(tag = %target.tag, volume = target.volume, "fetch completed");
                FetchOutcome::Completed
            }
            Err(err) => {
                warn!(
                    tag = %target.tag,
                    volume = target.volume,
                    error = %err,
                    "fetch failed; continuing with next cycle"
                );
                FetchOutcome::Failed {
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn try_invoke(&self, target: &FetchTarget) -> Result<(), FetchError> {
        let config = FetchConfig::for_tag(
            target.tag.clone(),
            target.volume,
            self.destination.clone(),
            self.media_types.clone(),
        );
        let mut client = self.factory.build(config);
        match &self.auth {
            AuthMode::Credentials(credentials) => {
                client.authenticate_with_credentials(credentials).await?
            }
            AuthMode::Anonymous => client.authenticate_anonymously().await?,
        }
        client.scrape_by_tag().await
    }
}

/// Registry, inventory, and the state files they checkpoint into.
#[derive(Debug)]
pub struct DiscoveryState {
    store: StateStore,
    registry: TagRegistry,
    inventory: MediaInventory,
}

impl DiscoveryState {
    pub async fn load(store: StateStore) -> Result<Self> {
        let registry = store.load_tags().await?;
        let inventory = store.load_inventory().await?;
        Ok(Self {
            store,
            registry,
            inventory,
        })
    }

    pub fn registry(&self) -> &TagRegistry {
        &self.registry
    }

    pub fn inventory(&self) -> &MediaInventory {
        &self.inventory
    }

    pub fn seed_tags(&mut self, tags: &[String]) -> usize {
        self.registry.extend(tags)
    }

    pub async fn ingest(&mut self, metadata_dir: &Path) -> Result<IngestReport> {
        ingest_directory(metadata_dir, &mut self.registry, &mut self.inventory).await
    }

    pub async fn persist(&self) -> Result<()> {
        self.store.save_inventory(&self.inventory).await?;
        self.store.save_tags(&self.registry).await
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleSummary {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingest: IngestReport,
    pub tag_count: usize,
    pub media_count: usize,
    pub delay_secs: u64,
    pub target: Option<FetchTarget>,
    pub outcome: FetchOutcome,
}

/// The perpetual driver: INGEST, PERSIST, SCHEDULE, SELECT, INVOKE, and around again.
///
/// Runs on one task. Only one loop should own a given pair of state files; nothing
/// here locks them.
pub struct DiscoveryLoop {
    metadata_dir: PathBuf,
    state: DiscoveryState,
    delay: DelayDistribution,
    max_volume: u32,
    rng: StdRng,
    invoker: FetchInvoker,
    pause: Box<dyn Pause>,
    cycles: u64,
}

impl DiscoveryLoop {
    pub async fn open(
        config: &DiscoveryConfig,
        factory: Box<dyn FetchClientFactory>,
        pause: Box<dyn Pause>,
    ) -> Result<Self> {
        let auth = config.validate()?;
        let delay = config.delay_distribution()?;
        tokio::fs::create_dir_all(&config.metadata_dir)
            .await
            .with_context(|| {
                format!("creating metadata directory {}", config.metadata_dir.display())
            })?;

        let mut state = DiscoveryState::load(config.state_store()).await?;
        let seeded = state.seed_tags(&config.seed_tags);
        info!(
            tags = state.registry().len(),
            media = state.inventory().len(),
            seeded,
            auth = auth.label(),
            "discovery state loaded"
        );

        let rng = match config.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };

        Ok(Self {
            metadata_dir: config.metadata_dir.clone(),
            state,
            delay,
            max_volume: config.max_volume,
            rng,
            invoker: FetchInvoker::new(
                factory,
                auth,
                config.metadata_dir.clone(),
                config.media_types.clone(),
            ),
            pause,
            cycles: 0,
        })
    }

    pub fn registry(&self) -> &TagRegistry {
        self.state.registry()
    }

    pub fn inventory(&self) -> &MediaInventory {
        self.state.inventory()
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// One full cycle. Errors returned here are fatal environment failures; a
    /// failing fetch shows up as [`FetchOutcome::Failed`] instead.
    pub async fn run_cycle(&mut self) -> Result<CycleSummary> {
        self.cycles += 1;
        let cycle_id = Uuid::new_v4();
        let span = info_span!("discovery_cycle", %cycle_id, cycle = self.cycles);
        self.cycle_body(cycle_id).instrument(span).await
    }

    async fn cycle_body(&mut self, cycle_id: Uuid) -> Result<CycleSummary> {
        let started_at = Utc::now();

        let ingest = self.state.ingest(&self.metadata_dir).await?;
        debug!(?ingest, "ingest finished");
        self.state.persist().await?;

        let delay = self.delay.sample(&mut self.rng);
        info!(delay_secs = delay.as_secs(), "sleeping before next fetch");

        // The registry cannot change during the pause, so picking now is the same
        // draw as picking after it, and the target can be announced up front.
        let target = select_target(self.state.registry(), self.max_volume, &mut self.rng);
        match &target {
            Some(target) => info!(tag = %target.tag, volume = target.volume, "next target"),
            None => warn!("tag registry is empty; skipping fetch this cycle"),
        }

        self.pause.pause(delay).await;

        let outcome = match &target {
            Some(target) => self.invoker.invoke(target).await,
            None => FetchOutcome::Skipped,
        };

        let summary = CycleSummary {
            cycle_id,
            started_at,
            finished_at: Utc::now(),
            ingest,
            tag_count: self.state.registry().len(),
            media_count: self.state.inventory().len(),
            delay_secs: delay.as_secs(),
            target,
            outcome,
        };
        info!(
            new_tags = summary.ingest.new_tags,
            new_media = summary.ingest.new_media,
            tags = summary.tag_count,
            media = summary.media_count,
            outcome = ?summary.outcome,
            "cycle complete"
        );
        Ok(summary)
    }

    /// Cycle until a fatal error or until the process is killed. The last
    /// completed persist is the durable checkpoint.
    pub async fn run_forever(mut self) -> Result<Infallible> {
        loop {
            self.run_cycle().await?;
        }
    }
}

pub async fn run_discovery(config: DiscoveryConfig) -> Result<Infallible> {
    let factory = CommandFetchClientFactory::new(config.scraper_bin.clone(), config.fetch_timeout());
    let discovery = DiscoveryLoop::open(&config, Box::new(factory), Box::new(TokioPause)).await?;
    discovery.run_forever().await
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestSnapshot {
    pub report: IngestReport,
    pub tag_count: usize,
    pub media_count: usize,
}

/// A single INGEST + PERSIST pass without scheduling or fetching.
pub async fn ingest_once(config: &DiscoveryConfig) -> Result<IngestSnapshot> {
    let mut state = DiscoveryState::load(config.state_store()).await?;
    state.seed_tags(&config.seed_tags);
    let report = state.ingest(&config.metadata_dir).await?;
    state.persist().await?;
    Ok(IngestSnapshot {
        report,
        tag_count: state.registry().len(),
        media_count: state.inventory().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tagscout_core::MediaRecord;
    use tempfile::tempdir;

    fn doc(value: serde_json::Value) -> RawMetadataDocument {
        RawMetadataDocument::from_slice(value.to_string().as_bytes()).expect("doc")
    }

    fn bike_road_document() -> serde_json::Value {
        json!({
            "GraphImages": [
                {
                    "tags": ["bike", "road"],
                    "display_url": "https://cdn/x123.jpg?e35=1",
                    "edge_liked_by": {"count": 12}
                },
                {
                    "display_url": "https://cdn/y456.jpg?e35=2",
                    "edge_liked_by": {"count": 4}
                }
            ]
        })
    }

    #[test]
    fn ingest_document_merges_tags_after_existing_ones() {
        let mut registry = TagRegistry::from_tags(["cycling"]);
        let mut inventory = MediaInventory::new();
        let report = ingest_document(
            &doc(bike_road_document()),
            "sample.json",
            &mut registry,
            &mut inventory,
        );

        assert_eq!(registry.as_slice(), ["cycling", "bike", "road"]);
        assert!(inventory.contains("x123"));
        assert!(inventory.contains("y456"));
        assert_eq!(report.new_tags, 2);
        assert_eq!(report.new_media, 2);
        assert_eq!(report.entries_skipped, 0);
    }

    #[test]
    fn bad_entry_is_skipped_but_keeps_its_tags() {
        let mut registry = TagRegistry::new();
        let mut inventory = MediaInventory::new();
        let report = ingest_document(
            &doc(json!({
                "GraphImages": [
                    {"tags": ["gravel"]},
                    {"display_url": "https://cdn/z9.jpg?x", "edge_liked_by": {"count": 1}}
                ]
            })),
            "partial.json",
            &mut registry,
            &mut inventory,
        );
        assert_eq!(registry.as_slice(), ["gravel"]);
        assert_eq!(inventory.records(), [MediaRecord::new("z9", 1)]);
        assert_eq!(report.entries_seen, 2);
        assert_eq!(report.entries_skipped, 1);
    }

    #[test]
    fn repeated_identifier_keeps_first_popularity_count() {
        let mut registry = TagRegistry::new();
        let mut inventory = MediaInventory::new();
        ingest_document(
            &doc(json!({
                "GraphImages": [
                    {"display_url": "https://cdn/a1.jpg?x", "edge_liked_by": {"count": 5}},
                    {"display_url": "https://cdn/a1.jpg?y", "edge_liked_by": {"count": 50}}
                ]
            })),
            "dup.json",
            &mut registry,
            &mut inventory,
        );
        assert_eq!(inventory.len(), 1);
        assert_eq!(inventory.get("a1").map(|r| r.popularity_count), Some(5));
    }

    #[test]
    fn non_jpeg_urls_with_shared_query_stay_distinct() {
        let mut registry = TagRegistry::new();
        let mut inventory = MediaInventory::new();
        let report = ingest_document(
            &doc(json!({
                "GraphImages": [
                    {"display_url": "https://cdn/a.mp4?e35=1", "edge_liked_by": {"count": 3}},
                    {"display_url": "https://cdn/b.mp4?e35=1", "edge_liked_by": {"count": 4}}
                ]
            })),
            "clips.json",
            &mut registry,
            &mut inventory,
        );
        assert_eq!(report.new_media, 2);
        assert_eq!(
            inventory.records(),
            [MediaRecord::new("a.mp4", 3), MediaRecord::new("b.mp4", 4)]
        );
    }

    #[test]
    fn inventory_holds_one_record_per_identifier_across_random_documents() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut registry = TagRegistry::new();
        let mut inventory = MediaInventory::new();
        let mut distinct = std::collections::HashSet::new();

        for round in 0..40 {
            let entries: Vec<_> = (0..rng.random_range(1..8))
                .map(|_| {
                    let id = rng.random_range(0..20);
                    let url = match rng.random_range(0..3) {
                        0 => format!("https://cdn/v/e35/m{id}.jpg?e35={}", rng.random_range(0..5)),
                        1 => format!("https://cdn/m{id}.mp4?e35={}", rng.random_range(0..5)),
                        _ => format!("https://cdn/m{id}.png?stp={}", rng.random_range(0..5)),
                    };
                    json!({
                        "tags": [format!("t{}", rng.random_range(0..6))],
                        "display_url": url,
                        "edge_liked_by": {"count": rng.random_range(0..100u64)}
                    })
                })
                .collect();
            let document = doc(json!({ "GraphImages": entries }));
            for entry in document.entries() {
                if let Ok(record) = entry.media_record() {
                    distinct.insert(record.identifier);
                }
            }

            ingest_document(&document, &format!("{round}.json"), &mut registry, &mut inventory);

            assert_eq!(inventory.len(), distinct.len());
            let mut identifiers: Vec<_> = inventory.iter().map(|r| &r.identifier).collect();
            identifiers.sort();
            identifiers.dedup();
            assert_eq!(identifiers.len(), inventory.len());
        }
        assert!(inventory.len() > 20);
    }

    #[tokio::test]
    async fn directory_ingest_is_idempotent_and_skips_bad_documents() {
        let dir = tempdir().expect("tempdir");
        std::fs::write(dir.path().join("a.json"), bike_road_document().to_string())
            .expect("write");
        std::fs::write(dir.path().join("b.json"), "{ not json").expect("write");
        std::fs::write(dir.path().join("notes.txt"), "ignored").expect("write");

        let mut registry = TagRegistry::new();
        let mut inventory = MediaInventory::new();
        let first = ingest_directory(dir.path(), &mut registry, &mut inventory)
            .await
            .expect("first ingest");
        assert_eq!(first.documents_scanned, 2);
        assert_eq!(first.documents_skipped, 1);
        assert_eq!(registry.len(), 2);
        assert_eq!(inventory.len(), 2);

        let second = ingest_directory(dir.path(), &mut registry, &mut inventory)
            .await
            .expect("second ingest");
        assert_eq!(second.new_tags, 0);
        assert_eq!(second.new_media, 0);
        assert_eq!(registry.len(), 2);
        assert_eq!(inventory.len(), 2);
        assert!(dir.path().join("a.json").exists());
    }

    #[tokio::test]
    async fn unreadable_directory_is_fatal() {
        let dir = tempdir().expect("tempdir");
        let mut registry = TagRegistry::new();
        let mut inventory = MediaInventory::new();
        let result = ingest_directory(
            &dir.path().join("does-not-exist"),
            &mut registry,
            &mut inventory,
        )
        .await;
        assert!(result.is_err());
    }

    #[test]
    fn single_tag_registry_always_selects_it() {
        let registry = TagRegistry::from_tags(["cycling"]);
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..100 {
            assert_eq!(select_tag(&registry, &mut rng).as_deref(), Some("cycling"));
        }
    }

    #[test]
    fn empty_registry_selects_nothing() {
        let mut rng = StdRng::seed_from_u64(7);
        assert_eq!(select_target(&TagRegistry::new(), 12, &mut rng), None);
    }

    #[test]
    fn selection_covers_the_registry_and_volume_range() {
        let registry = TagRegistry::from_tags(["a", "b", "c"]);
        let mut rng = StdRng::seed_from_u64(11);
        let mut seen_tags = std::collections::HashSet::new();
        let mut seen_volumes = std::collections::HashSet::new();
        for _ in 0..2_000 {
            let target = select_target(&registry, 12, &mut rng).expect("target");
            assert!((1..=12).contains(&target.volume));
            seen_tags.insert(target.tag);
            seen_volumes.insert(target.volume);
        }
        assert_eq!(seen_tags.len(), 3);
        assert_eq!(seen_volumes.len(), 12);
    }

    #[test]
    fn delay_has_folded_normal_shape() {
        let delay = DelayDistribution::default();
        let mut rng = StdRng::seed_from_u64(42);
        let samples = (0..20_000)
            .map(|_| delay.sample(&mut rng).as_secs() as f64)
            .collect::<Vec<_>>();
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        // E|N(90, 180)| is about 161s.
        assert!((150.0..172.0).contains(&mean), "mean {mean}");
        assert!(samples.iter().any(|s| *s < 10.0));
        assert!(samples.iter().any(|s| *s > 500.0));
    }

    #[test]
    fn zero_spread_delay_is_the_absolute_mean() {
        let mut rng = StdRng::seed_from_u64(1);
        let fixed = DelayDistribution::new(90.7, 0.0).expect("valid");
        assert_eq!(fixed.sample(&mut rng), Duration::from_secs(90));
        let negative = DelayDistribution::new(-30.0, 0.0).expect("valid");
        assert_eq!(negative.sample(&mut rng), Duration::from_secs(30));
    }

    #[test]
    fn invalid_delay_and_volume_are_config_errors() {
        assert!(DelayDistribution::new(90.0, -1.0).is_err());
        assert!(DelayDistribution::new(f64::NAN, 1.0).is_err());

        let config = DiscoveryConfig {
            max_volume: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::InvalidMaxVolume)));
    }

    #[test]
    fn half_a_credential_pair_is_rejected() {
        let config = DiscoveryConfig {
            login_user: Some("rider".into()),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Credentials(_))));
        assert_eq!(DiscoveryConfig::default().validate().ok(), Some(AuthMode::Anonymous));
    }

    #[test]
    fn delimited_lists_split_on_commas_semicolons_and_spaces() {
        assert_eq!(parse_delimited("image, video;story  none"), ["image", "video", "story", "none"]);
    }

    #[tokio::test]
    async fn ingest_once_persists_both_state_files() {
        let dir = tempdir().expect("tempdir");
        let metadata_dir = dir.path().join("img");
        std::fs::create_dir_all(&metadata_dir).expect("mkdir");
        std::fs::write(metadata_dir.join("bike.json"), bike_road_document().to_string())
            .expect("write");
        let config = DiscoveryConfig {
            metadata_dir,
            inventory_file: dir.path().join("image_data.csv"),
            tags_file: dir.path().join("tags.csv"),
            seed_tags: vec!["cycling".to_string()],
            ..Default::default()
        };

        let snapshot = ingest_once(&config).await.expect("ingest");
        assert_eq!(snapshot.tag_count, 3);
        assert_eq!(snapshot.media_count, 2);

        let tags = std::fs::read_to_string(&config.tags_file).expect("tags");
        assert_eq!(tags, "tag\ncycling\nbike\nroad\n");
        let reloaded = config.state_store().load_inventory().await.expect("inventory");
        assert_eq!(reloaded.get("x123").map(|r| r.popularity_count), Some(12));
        assert_eq!(reloaded.get("y456").map(|r| r.popularity_count), Some(4));
    }
}
