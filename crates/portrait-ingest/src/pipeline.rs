//! Crawl/fetch pipeline.
//!
//! One run walks `FetchListing → ExtractCandidates → DedupFilter → Download → Commit`.
//! Candidate extraction runs on a compute pool, downloads on an I/O pool. Item
//! failures become `DownloadOutcome`s; only store errors abort the run.

use crate::catalog::{CatalogItem, CatalogSource, FetchError, ListingEntry, ListingPage};
use crate::pool::{PoolKind, WorkerPool};
use crate::store::{DedupStore, DownloadStatus, RunTransaction, StoreError};
use portrait_core::PaintingId;
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;
use url::Url;

pub const DEFAULT_MIN_IMAGE_BYTES: usize = 10 * 1024;
pub const DEFAULT_MAX_IMAGE_BYTES: usize = 32 * 1024 * 1024;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("download directory: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub first_page: u32,
    pub page_count: u32,
    /// Extraction workers; 0 selects available parallelism.
    pub compute_workers: usize,
    /// Download workers; 0 selects the I/O pool default.
    pub io_workers: usize,
    pub download_dir: PathBuf,
    pub min_image_bytes: usize,
    pub max_image_bytes: usize,
    /// Failed downloads are retried by later runs until this many attempts.
    pub max_attempts: u32,
}

impl PipelineConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            first_page: 1,
            page_count: 1,
            compute_workers: 0,
            io_workers: 0,
            download_dir: download_dir.into(),
            min_image_bytes: DEFAULT_MIN_IMAGE_BYTES,
            max_image_bytes: DEFAULT_MAX_IMAGE_BYTES,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// How one download ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    Fetched { painting_id: PaintingId },
    /// Transient failure, retried by a later run.
    Failed { attempts: u32, reason: String },
    /// Permanent rejection, never retried.
    Rejected { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CrawlReport {
    pub pages: usize,
    pub entries: usize,
    pub candidates: usize,
    pub already_known: usize,
    /// Failed items that reached the attempt limit.
    pub exhausted: usize,
    pub fetched: usize,
    pub failed: usize,
    pub rejected: usize,
    pub panicked: usize,
}

impl CrawlReport {
    fn record(&mut self, outcome: &DownloadOutcome) {
        match outcome {
            DownloadOutcome::Fetched { .. } => self.fetched += 1,
            DownloadOutcome::Failed { .. } => self.failed += 1,
            DownloadOutcome::Rejected { .. } => self.rejected += 1,
        }
    }
}

/// Run one crawl. All store writes of the run are committed together at the end.
pub fn run_crawl(
    catalog: &dyn CatalogSource,
    store: &dyn DedupStore,
    config: &PipelineConfig,
) -> Result<CrawlReport, PipelineError> {
    std::fs::create_dir_all(&config.download_dir)?;
    let tx = RunTransaction::begin(store)?;
    let mut report = CrawlReport::default();

    let pages = fetch_listings(catalog, config, &mut report);
    let candidates = extract_candidates(pages, config.compute_workers, &mut report);
    report.candidates = candidates.len();
    let queue = dedup_filter(store, candidates, config.max_attempts, &mut report)?;
    download_all(catalog, store, queue, config, &mut report)?;

    tx.commit()?;
    tracing::info!(
        pages = report.pages,
        candidates = report.candidates,
        fetched = report.fetched,
        failed = report.failed,
        rejected = report.rejected,
        already_known = report.already_known,
        "crawl finished"
    );
    Ok(report)
}

fn fetch_listings(
    catalog: &dyn CatalogSource,
    config: &PipelineConfig,
    report: &mut CrawlReport,
) -> Vec<ListingPage> {
    let last = config.first_page.saturating_add(config.page_count);
    let mut pages = Vec::new();
    for page in config.first_page..last {
        match catalog.fetch_listing(page) {
            Ok(listing) => {
                tracing::info!(page, entries = listing.entries.len(), "listing fetched");
                report.pages += 1;
                pages.push(listing);
            }
            Err(e) => tracing::warn!(page, error = %e, "skipping listing page"),
        }
    }
    pages
}

fn extract_candidates(
    pages: Vec<ListingPage>,
    workers: usize,
    report: &mut CrawlReport,
) -> Vec<CatalogItem> {
    let mut entries: Vec<(Url, ListingEntry)> = Vec::new();
    for page in pages {
        let base = match Url::parse(&page.url) {
            Ok(base) => base,
            Err(e) => {
                tracing::warn!(url = %page.url, error = %e, "listing page has no usable base URL");
                continue;
            }
        };
        report.entries += page.entries.len();
        entries.extend(page.entries.into_iter().map(|entry| (base.clone(), entry)));
    }

    let found = Mutex::new(Vec::with_capacity(entries.len()));
    let mut pool = WorkerPool::new(PoolKind::Compute, workers, |(base, entry): (Url, ListingEntry)| {
        match CatalogItem::from_entry(&base, &entry) {
            Ok(item) => found.lock().unwrap_or_else(PoisonError::into_inner).push(item),
            Err(e) => tracing::warn!(title = %entry.title, error = %e, "skipping listing entry"),
        }
    });
    pool.submit(entries);
    report.panicked += pool.join().iter().filter(|r| r.is_err()).count();

    // The same painting can appear on several pages.
    let mut by_id = BTreeMap::new();
    for item in found.into_inner().unwrap_or_else(PoisonError::into_inner) {
        by_id.entry(item.remote_id.clone()).or_insert(item);
    }
    by_id.into_values().collect()
}

fn dedup_filter(
    store: &dyn DedupStore,
    candidates: Vec<CatalogItem>,
    max_attempts: u32,
    report: &mut CrawlReport,
) -> Result<Vec<CatalogItem>, StoreError> {
    let mut queue = Vec::with_capacity(candidates.len());
    for item in candidates {
        match store.record(&item.remote_id)? {
            Some(rec) if matches!(rec.status, DownloadStatus::Fetched | DownloadStatus::Skipped) => {
                tracing::info!(remote_id = %item.remote_id, status = %rec.status, "already known");
                report.already_known += 1;
            }
            Some(rec) if rec.status == DownloadStatus::Failed && rec.attempts >= max_attempts => {
                tracing::info!(remote_id = %item.remote_id, attempts = rec.attempts, "attempt limit reached");
                report.exhausted += 1;
            }
            Some(_) => queue.push(item),
            None => {
                store.mark_pending(&item.remote_id, item.source_url())?;
                queue.push(item);
            }
        }
    }
    Ok(queue)
}

fn download_all(
    catalog: &dyn CatalogSource,
    store: &dyn DedupStore,
    queue: Vec<CatalogItem>,
    config: &PipelineConfig,
    report: &mut CrawlReport,
) -> Result<(), PipelineError> {
    let fetched = AtomicUsize::new(0);
    let aborted = AtomicBool::new(false);

    let mut pool = WorkerPool::new(PoolKind::Io, config.io_workers, |item: CatalogItem| {
        if aborted.load(Ordering::Relaxed) {
            return Ok(None);
        }
        let outcome = download_one(catalog, store, &item, config);
        match &outcome {
            Ok(DownloadOutcome::Fetched { painting_id }) => {
                let n = fetched.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::info!(n, remote_id = %item.remote_id, painting_id, "painting fetched");
            }
            Ok(_) => {}
            Err(e) => {
                aborted.store(true, Ordering::Relaxed);
                tracing::error!(remote_id = %item.remote_id, error = %e, "store failed, aborting run");
            }
        }
        outcome.map(Some)
    });
    pool.submit(queue);

    let mut fatal = None;
    for result in pool.join() {
        match result {
            Ok(Ok(Some(outcome))) => report.record(&outcome),
            Ok(Ok(None)) => {}
            Ok(Err(e)) => {
                fatal.get_or_insert(e);
            }
            Err(_) => report.panicked += 1,
        }
    }
    match fatal {
        Some(e) => Err(e.into()),
        None => Ok(()),
    }
}

fn download_one(
    catalog: &dyn CatalogSource,
    store: &dyn DedupStore,
    item: &CatalogItem,
    config: &PipelineConfig,
) -> Result<DownloadOutcome, StoreError> {
    let remote_id = item.remote_id.as_str();
    let source_url = item.source_url();

    let path = config.download_dir.join(format!("{remote_id}.jpg"));
    let fetched = catalog
        .fetch_image_url(&item.detail_url)
        .and_then(|image_url| catalog.fetch_image(&image_url, config.max_image_bytes));
    let bytes = match fetched {
        Ok(bytes) => bytes,
        Err(e) => {
            if matches!(e, FetchError::TooLarge { .. }) {
                remove_stale(&path);
            }
            return record_fetch_error(store, item, e);
        }
    };

    let size = bytes.len();
    if !(config.min_image_bytes..=config.max_image_bytes).contains(&size) {
        remove_stale(&path);
        store.mark_skipped(remote_id, source_url)?;
        tracing::warn!(remote_id, size, "image size out of range, rejecting");
        return Ok(DownloadOutcome::Rejected { reason: format!("image is {size} bytes") });
    }

    if let Err(e) = std::fs::write(&path, &bytes) {
        let attempts = store.mark_failed(remote_id, source_url)?;
        tracing::warn!(remote_id, path = %path.display(), error = %e, "cannot save image");
        return Ok(DownloadOutcome::Failed { attempts, reason: e.to_string() });
    }

    let painting_id = store.mark_fetched(remote_id, source_url, &path)?;
    Ok(DownloadOutcome::Fetched { painting_id })
}

fn record_fetch_error(
    store: &dyn DedupStore,
    item: &CatalogItem,
    error: FetchError,
) -> Result<DownloadOutcome, StoreError> {
    let remote_id = item.remote_id.as_str();
    if error.is_permanent() {
        store.mark_skipped(remote_id, item.source_url())?;
        tracing::warn!(remote_id, url = %item.detail_url, error = %error, "rejecting item");
        return Ok(DownloadOutcome::Rejected { reason: error.to_string() });
    }
    let attempts = store.mark_failed(remote_id, item.source_url())?;
    if error.is_timeout() {
        tracing::warn!(remote_id, attempts, "timeout while downloading");
    } else {
        tracing::warn!(remote_id, attempts, error = %error, "download failed");
    }
    Ok(DownloadOutcome::Failed { attempts, reason: error.to_string() })
}

fn remove_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), error = %e, "cannot remove rejected image");
        }
        _ => {}
    }
}
