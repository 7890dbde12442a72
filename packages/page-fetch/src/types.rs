use thiserror::Error;
use url::Url;

/// A successfully fetched and parsed HTML page.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: Url,
    pub title: Option<String>,
    pub description: Option<String>,
    pub body_text: String,
    pub word_count: usize,
    /// Absolute, deduplicated, fragment-free http(s) links found on the page.
    pub links: Vec<Url>,
}

impl FetchedPage {
    /// Links pointing at the given domain (case-insensitive host match).
    pub fn same_domain_links(&self, domain: &str) -> Vec<Url> {
        self.links
            .iter()
            .filter(|l| crate::fetcher::same_domain(l, domain))
            .cloned()
            .collect()
    }
}

/// Why a fetch did not produce a page.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected status {0}")]
    Status(u16),

    #[error("unsupported content type {0:?}")]
    NotHtml(String),

    #[error("invalid url: {0}")]
    InvalidUrl(String),

    #[error("parse error: {0}")]
    Parse(String),
}

impl FetchError {
    /// Whether retrying the same URL later could plausibly succeed.
    ///
    /// The crawl worker does not retry on its own; this exists for operators
    /// and higher-level policies inspecting failure reasons.
    pub fn is_transient(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Status(_))
    }
}
