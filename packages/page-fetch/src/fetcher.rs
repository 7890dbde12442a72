//! HTTP page fetcher built on reqwest + scraper.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use url::Url;

use crate::types::{FetchError, FetchedPage};

/// Trait for fetching and parsing a single page (to allow mocking).
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError>;
}

/// Production fetcher: one GET per page, HTML only.
pub struct HttpPageFetcher {
    client: reqwest::Client,
}

impl HttpPageFetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let response = self.client.get(url.as_str()).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status(status.as_u16()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();
        if !content_type.contains("text/html") {
            return Err(FetchError::NotHtml(content_type));
        }

        // Redirects may have moved us to a different URL; resolve links
        // against the final address.
        let final_url = response.url().clone();
        let body = response.text().await?;

        tracing::debug!(url = %final_url, bytes = body.len(), "fetched page");

        // `Html` is not Send, so parsing happens in a sync helper that
        // returns owned data before the future suspends again.
        Ok(parse_page(&body, &final_url))
    }
}

/// True when the URL's host matches the given domain (case-insensitive).
pub fn same_domain(url: &Url, domain: &str) -> bool {
    url.host_str()
        .map(|h| h.eq_ignore_ascii_case(domain))
        .unwrap_or(false)
}

/// Parse an HTML document into title, description, body text and links.
fn parse_page(html: &str, base_url: &Url) -> FetchedPage {
    let document = Html::parse_document(html);

    let title = select_first_text(&document, "title");
    let description = select_meta_content(&document, "meta[name=\"description\"]")
        .or_else(|| select_meta_content(&document, "meta[property=\"og:description\"]"));

    let body_text = extract_text(&document);
    let word_count = body_text.split_whitespace().count();
    let links = extract_links(&document, base_url);

    FetchedPage {
        url: base_url.clone(),
        title,
        description,
        body_text,
        word_count,
        links,
    }
}

fn select_first_text(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let text: String = document
        .select(&selector)
        .next()?
        .text()
        .collect::<String>()
        .trim()
        .to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

fn select_meta_content(document: &Html, selector: &str) -> Option<String> {
    let selector = Selector::parse(selector).ok()?;
    let content = document
        .select(&selector)
        .next()?
        .value()
        .attr("content")?
        .trim()
        .to_string();
    if content.is_empty() {
        None
    } else {
        Some(content)
    }
}

/// Collect visible text content from `<body>`, whitespace-normalized.
///
/// Text inside `script`/`style` elements is not page content and is skipped.
fn extract_text(document: &Html) -> String {
    let root = Selector::parse("body")
        .ok()
        .and_then(|s| document.select(&s).next());
    let Some(root) = root else {
        return String::new();
    };

    let mut text = String::new();
    for node in root.descendants() {
        let Some(content) = node.value().as_text() else {
            continue;
        };
        let in_raw_element = node
            .parent()
            .and_then(|p| p.value().as_element().map(|e| e.name().to_string()))
            .map(|name| name == "script" || name == "style")
            .unwrap_or(false);
        if in_raw_element {
            continue;
        }
        let content = content.trim();
        if !content.is_empty() {
            if !text.is_empty() {
                text.push(' ');
            }
            text.push_str(content);
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Extract all `<a href>` targets, resolved against `base_url`.
///
/// Keeps http(s) URLs only, strips fragments, deduplicates.
fn extract_links(document: &Html, base_url: &Url) -> Vec<Url> {
    let Ok(selector) = Selector::parse("a[href]") else {
        return Vec::new();
    };

    let mut links: Vec<Url> = Vec::new();
    for element in document.select(&selector) {
        let Some(href) = element.value().attr("href") else {
            continue;
        };
        let href = href.trim();
        if href.is_empty() || href.starts_with('#') {
            continue;
        }

        let Ok(mut resolved) = base_url.join(href) else {
            continue;
        };
        if resolved.scheme() != "http" && resolved.scheme() != "https" {
            continue;
        }
        resolved.set_fragment(None);
        links.push(resolved);
    }

    links.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    links.dedup();
    links
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(html: &str, base: &str) -> FetchedPage {
        parse_page(html, &Url::parse(base).unwrap())
    }

    #[test]
    fn test_extracts_title_and_description() {
        let page = parse(
            r#"<html><head>
                <title>  My Page  </title>
                <meta name="description" content="A test page">
            </head><body>Hello World</body></html>"#,
            "https://example.com/",
        );
        assert_eq!(page.title.as_deref(), Some("My Page"));
        assert_eq!(page.description.as_deref(), Some("A test page"));
        assert_eq!(page.word_count, 2);
    }

    #[test]
    fn test_falls_back_to_og_description() {
        let page = parse(
            r#"<html><head>
                <meta property="og:description" content="From OGP">
            </head><body></body></html>"#,
            "https://example.com/",
        );
        assert_eq!(page.description.as_deref(), Some("From OGP"));
    }

    #[test]
    fn test_resolves_relative_links() {
        let page = parse(
            r#"<a href="/absolute">A</a>
               <a href="relative">B</a>"#,
            "https://example.com/base/",
        );
        let links: Vec<&str> = page.links.iter().map(|u| u.as_str()).collect();
        assert!(links.contains(&"https://example.com/absolute"));
        assert!(links.contains(&"https://example.com/base/relative"));
    }

    #[test]
    fn test_deduplicates_and_strips_fragments() {
        let page = parse(
            r#"<a href="https://example.com/page#top">1</a>
               <a href="https://example.com/page#bottom">2</a>
               <a href="https://example.com/page">3</a>"#,
            "https://example.com/",
        );
        assert_eq!(page.links.len(), 1);
        assert_eq!(page.links[0].as_str(), "https://example.com/page");
    }

    #[test]
    fn test_skips_non_http_schemes() {
        let page = parse(
            r#"<a href="mailto:a@example.com">mail</a>
               <a href="javascript:void(0)">js</a>
               <a href="https://example.com/ok">ok</a>"#,
            "https://example.com/",
        );
        assert_eq!(page.links.len(), 1);
    }

    #[test]
    fn test_same_domain_filter() {
        let page = parse(
            r#"<a href="https://example.com/in">in</a>
               <a href="https://other.org/out">out</a>"#,
            "https://example.com/",
        );
        let filtered = page.same_domain_links("example.com");
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].as_str(), "https://example.com/in");
    }

    #[test]
    fn test_same_domain_is_case_insensitive() {
        let url = Url::parse("https://Example.COM/page").unwrap();
        assert!(same_domain(&url, "example.com"));
        assert!(!same_domain(&url, "sub.example.com"));
    }

    #[test]
    fn test_body_text_is_whitespace_normalized() {
        let page = parse(
            "<p>Hello   <b>World</b></p>\n<p>again</p>",
            "https://example.com/",
        );
        assert_eq!(page.body_text, "Hello World again");
    }
}
