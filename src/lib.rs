pub mod crawler;
pub mod media;
pub mod store;
pub mod telemetry;

pub mod util {
    pub mod db;
    pub mod env;
}

pub use crawler::{
    config::CrawlerConfig,
    error::CrawlError,
    events::{CrawlSeverity, CrawlSource, CrawlStatus},
    reconcile::ReconcileReport,
};
pub use store::{CatalogStore, SharedStore};
