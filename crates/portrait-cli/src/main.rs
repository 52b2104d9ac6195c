use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use portrait_core::{Emotion, LandmarkId, PaintingId, Point, SidecarDetector};
use portrait_ingest::{run_analysis, run_crawl, HttpCatalog, SelectorConfig, Store};
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

mod config;
mod engine;

use config::Config;
use engine::{spawn_engine, Retrieved};

#[derive(Parser)]
#[command(name = "portrait", about = "Find the paintings that share a face's geometry")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Crawl the catalog and download paintings not seen before
    Crawl {
        /// First listing page to visit
        #[arg(long, default_value_t = 1)]
        first_page: u32,
        /// Number of listing pages to visit
        #[arg(short, long, default_value_t = 1)]
        pages: u32,
    },
    /// Extract face landmarks from downloaded paintings
    Analyze {
        /// Directory holding `<image>.landmarks.json` detector output
        #[arg(short, long)]
        landmarks_dir: PathBuf,
    },
    /// Find the paintings closest to a face
    Query {
        /// JSON file with 68 `[x, y]` landmark points
        #[arg(short, long)]
        landmarks: PathBuf,
        /// Restrict matches to one emotion category (e.g. "happy")
        #[arg(short, long)]
        category: Option<Emotion>,
        /// Number of matches (default: PORTRAIT_TOP_K)
        #[arg(short)]
        k: Option<usize>,
        /// Directory to write matched paintings and face crops into
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Show store and index statistics
    Status,
}

#[derive(Serialize)]
struct QueryHit {
    rank: usize,
    painting_id: PaintingId,
    landmark_id: LandmarkId,
    distance: f64,
    painting_bytes: usize,
    painting_path: Option<PathBuf>,
    portrait_path: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Crawl { first_page, pages } => {
            let report = tokio::task::spawn_blocking(move || -> Result<_> {
                let store = Store::open(&config.db_path)?;
                let catalog = HttpCatalog::new(
                    &config.listing_url,
                    config.fetch_timeout(),
                    &SelectorConfig::default(),
                )?;
                let report = run_crawl(&catalog, &store, &config.pipeline(first_page, pages))?;
                store.close()?;
                Ok(report)
            })
            .await??;
            print_json(&report)?;
        }
        Commands::Analyze { landmarks_dir } => {
            let report = tokio::task::spawn_blocking(move || -> Result<_> {
                let store = Store::open(&config.db_path)?;
                let mut detector = SidecarDetector::open(&landmarks_dir)?;
                let report = run_analysis(&store, &mut detector, None, &config.face_dir())?;
                store.close()?;
                Ok(report)
            })
            .await??;
            print_json(&report)?;
        }
        Commands::Query {
            landmarks,
            category,
            k,
            out,
        } => {
            let points = read_landmarks(&landmarks)?;
            let weights = config.region_weights()?;
            let engine = spawn_engine(Store::open(&config.db_path)?, weights)?;
            let hits = engine
                .retrieve(points, category, k.unwrap_or(config.top_k))
                .await?;

            if let Some(dir) = &out {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("creating {}", dir.display()))?;
            }
            let mut report = Vec::with_capacity(hits.len());
            for (i, hit) in hits.iter().enumerate() {
                let rank = i + 1;
                let (painting_path, portrait_path) = match &out {
                    Some(dir) => save_hit(dir, rank, hit)?,
                    None => (None, None),
                };
                report.push(QueryHit {
                    rank,
                    painting_id: hit.painting_id,
                    landmark_id: hit.landmark_id,
                    distance: hit.distance,
                    painting_bytes: hit.painting_bytes.len(),
                    painting_path,
                    portrait_path,
                });
            }
            print_json(&report)?;
        }
        Commands::Status => {
            let store = Store::open(&config.db_path)?;
            let stats = store.stats()?;
            let engine = spawn_engine(store, config.region_weights()?)?;
            let index = engine.stats().await?;
            print_json(&serde_json::json!({
                "db_path": config.db_path,
                "store": stats,
                "index": index,
            }))?;
        }
    }

    Ok(())
}

fn read_landmarks(path: &Path) -> Result<Vec<Point>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading landmarks from {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("{} is not a JSON list of [x, y] points", path.display()))
}

/// Write a hit's painting and face crop into `dir`, prefixed by rank.
fn save_hit(dir: &Path, rank: usize, hit: &Retrieved) -> Result<(Option<PathBuf>, Option<PathBuf>)> {
    let painting = write_file(
        dir,
        &format!("{rank}_painting_{}.jpg", hit.painting_id),
        &hit.painting_bytes,
    )?;
    let portrait = match &hit.portrait_bytes {
        Some(bytes) => Some(write_file(
            dir,
            &format!("{rank}_portrait_{}.jpg", hit.landmark_id),
            bytes,
        )?),
        None => None,
    };
    Ok((Some(painting), portrait))
}

fn write_file(dir: &Path, name: &str, bytes: &[u8]) -> Result<PathBuf> {
    let path = dir.join(name);
    std::fs::write(&path, bytes).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
