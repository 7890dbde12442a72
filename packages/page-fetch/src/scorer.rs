//! URL priority scoring.
//!
//! Higher scores are claimed sooner by the crawl worker. The full
//! content-quality pipeline lives elsewhere; this is the cheap URL-shape
//! heuristic used when enqueueing newly discovered links.

use url::Url;

use crate::types::FetchedPage;

/// Trait for computing a claim priority for a candidate URL.
pub trait PageScorer: Send + Sync {
    /// Score a candidate link discovered on `source`. Higher = sooner.
    fn priority(&self, url: &Url, source: &FetchedPage) -> i32;
}

/// Extensions that almost never lead to indexable HTML.
const ASSET_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".svg", ".ico", ".css", ".js", ".pdf", ".zip", ".gz",
    ".mp4", ".mp3", ".woff", ".woff2",
];

/// Default scorer: prefers shallow, clean URLs discovered on substantial pages.
pub struct HeuristicScorer;

impl PageScorer for HeuristicScorer {
    fn priority(&self, url: &Url, source: &FetchedPage) -> i32 {
        let mut score = 100;

        let segments = url
            .path_segments()
            .map(|s| s.filter(|p| !p.is_empty()).count())
            .unwrap_or(0);
        score -= segments as i32 * 10;

        if url.query().is_some() {
            score -= 15;
        }

        let path = url.path().to_ascii_lowercase();
        if ASSET_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
            score -= 40;
        }

        // Links found on substantial pages tend to matter more than links
        // found on thin navigation pages.
        if source.word_count >= 400 {
            score += 5;
        }

        score.max(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(word_count: usize) -> FetchedPage {
        FetchedPage {
            url: Url::parse("https://example.com/").unwrap(),
            title: None,
            description: None,
            body_text: String::new(),
            word_count,
            links: Vec::new(),
        }
    }

    fn score(url: &str) -> i32 {
        HeuristicScorer.priority(&Url::parse(url).unwrap(), &page(0))
    }

    #[test]
    fn test_shallow_paths_score_higher() {
        assert!(score("https://example.com/") > score("https://example.com/a/b/c"));
    }

    #[test]
    fn test_query_strings_are_penalized() {
        assert!(score("https://example.com/page") > score("https://example.com/page?sort=asc"));
    }

    #[test]
    fn test_asset_urls_are_penalized() {
        assert!(score("https://example.com/about") > score("https://example.com/logo.png"));
    }

    #[test]
    fn test_substantial_source_pages_boost() {
        let url = Url::parse("https://example.com/article").unwrap();
        let thin = HeuristicScorer.priority(&url, &page(10));
        let rich = HeuristicScorer.priority(&url, &page(800));
        assert!(rich > thin);
    }

    #[test]
    fn test_score_never_negative() {
        assert_eq!(score("https://example.com/a/b/c/d/e/f/g/h/i/j/k?x=1"), 0);
    }
}
