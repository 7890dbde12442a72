//! Page fetching, link extraction and URL scoring for the crawl worker.
//!
//! The crawl scheduling core only talks to this crate through the
//! [`PageFetcher`] and [`PageScorer`] traits, so tests (and alternative
//! fetch backends such as a headless browser) can swap the implementation
//! without touching the worker.

pub mod fetcher;
pub mod scorer;
pub mod types;

pub use fetcher::{same_domain, HttpPageFetcher, PageFetcher};
pub use scorer::{HeuristicScorer, PageScorer};
pub use types::{FetchError, FetchedPage};
