//! portrait-ingest: Catalog crawling, image fetching and face analysis.
//!
//! Fills the store the similarity index is built from: a two-stage crawl
//! (listing extraction on a compute pool, downloads on an I/O pool) guarded
//! by a durable dedup record, followed by per-painting landmark analysis.

pub mod analyze;
pub mod catalog;
pub mod pipeline;
pub mod pool;
pub mod store;

pub use analyze::{run_analysis, AnalyzeError, AnalyzeReport};
pub use catalog::{
    CatalogItem, CatalogSource, FetchError, HttpCatalog, ListingEntry, ListingPage,
    SelectorConfig,
};
pub use pipeline::{run_crawl, CrawlReport, DownloadOutcome, PipelineConfig, PipelineError};
pub use pool::{PoolKind, TaskPanic, WorkerPool};
pub use store::{
    DedupStore, DownloadRecord, DownloadStatus, FaceRecord, RunTransaction, Store, StoreError,
    StoreStats,
};
