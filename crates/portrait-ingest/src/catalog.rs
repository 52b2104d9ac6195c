//! Remote catalog boundary: listing pages, detail pages and image bytes.
//!
//! `CatalogSource` is the seam the pipeline talks to. `HttpCatalog` is the
//! production implementation over blocking `reqwest` and `scraper`.

use scraper::{ElementRef, Html, Node, Selector};
use serde::Deserialize;
use std::io::Read;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Longest remote id kept, so `<remote_id>.jpg` fits a 255-byte file name.
pub const MAX_REMOTE_ID_LEN: usize = 251;

/// Path segment that starts the presentation suffix of a detail link.
const VIEW_SUFFIX_SEGMENT: &str = "view_as";

pub const DEFAULT_LISTING_URL: &str = "https://artuk.org/discover/artworks/view_as/grid/page/{page}";

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 6.1; WOW64) AppleWebKit/537.1 \
                          (KHTML, like Gecko) Chrome/22.0.1207.1 Safari/537.1";

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("request timed out: {url}")]
    NetworkTimeout { url: String },
    #[error("malformed source at {url}: {reason}")]
    MalformedSource { url: String, reason: String },
    #[error("HTTP {status} for {url}")]
    Http { url: String, status: u16 },
    #[error("transport error for {url}: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("cannot build HTTP client: {0}")]
    Client(#[source] reqwest::Error),
    #[error("image at {url} exceeds {limit} bytes")]
    TooLarge { url: String, limit: usize },
    #[error("cannot read body of {url}: {source}")]
    Body {
        url: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
}

impl FetchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::NetworkTimeout { .. })
    }

    /// Errors that will not go away on retry: broken pages and client errors.
    pub fn is_permanent(&self) -> bool {
        match self {
            FetchError::MalformedSource { .. } | FetchError::TooLarge { .. } => true,
            FetchError::Http { status, .. } => (400..500).contains(status) && *status != 429,
            _ => false,
        }
    }
}

/// One entry of a listing page, as found in the HTML.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub href: String,
    pub title: String,
}

#[derive(Debug, Clone)]
pub struct ListingPage {
    /// Address the page was fetched from; relative links resolve against it.
    pub url: String,
    pub entries: Vec<ListingEntry>,
}

/// A catalog item eligible for download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogItem {
    pub remote_id: String,
    pub detail_url: String,
    pub title: String,
    source_url: String,
}

impl CatalogItem {
    /// Resolve a listing entry against its page and derive the dedup key.
    pub fn from_entry(base: &Url, entry: &ListingEntry) -> Result<Self, FetchError> {
        let malformed = |reason: String| FetchError::MalformedSource {
            url: entry.href.clone(),
            reason,
        };
        let detail = base
            .join(entry.href.trim())
            .map_err(|e| malformed(format!("bad link: {e}")))?;
        let remote_id =
            remote_id_from_url(&detail).ok_or_else(|| malformed("no usable path segment".into()))?;
        Ok(Self {
            remote_id,
            source_url: strip_view_suffix(&detail),
            detail_url: detail.into(),
            title: entry.title.clone(),
        })
    }

    /// The detail link without its presentation suffix, as recorded in the store.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }
}

/// Drop the `view_as` path segment and everything after it.
fn strip_view_suffix(url: &Url) -> String {
    let Some(segments) = url.path_segments() else {
        return url.to_string();
    };
    let segments: Vec<&str> = segments.collect();
    let Some(end) = segments.iter().position(|s| *s == VIEW_SUFFIX_SEGMENT) else {
        return url.to_string();
    };
    let mut stripped = url.clone();
    stripped.set_path(&format!("/{}", segments[..end].join("/")));
    stripped.set_query(None);
    stripped.set_fragment(None);
    stripped.into()
}

/// Stable key of a detail link: its last path segment before `view_as`,
/// restricted to `[A-Za-z0-9._-]` and capped at `MAX_REMOTE_ID_LEN` bytes.
pub fn remote_id_from_url(url: &Url) -> Option<String> {
    let segments: Vec<&str> = url.path_segments()?.filter(|s| !s.is_empty()).collect();
    let end = segments
        .iter()
        .position(|s| *s == VIEW_SUFFIX_SEGMENT)
        .unwrap_or(segments.len());
    let raw = segments[..end].last()?;

    let mut id: String = raw
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') { c } else { '_' })
        .collect();
    id.truncate(MAX_REMOTE_ID_LEN);

    if id.chars().all(|c| matches!(c, '.' | '_')) {
        return None;
    }
    Some(id)
}

/// Source of listing pages, detail pages and image bytes.
pub trait CatalogSource: Send + Sync {
    fn fetch_listing(&self, page: u32) -> Result<ListingPage, FetchError>;

    /// Fetch a detail page and return the absolute URL of its painting image.
    fn fetch_image_url(&self, detail_url: &str) -> Result<String, FetchError>;

    /// Fetch image bytes, refusing bodies larger than `max_bytes`.
    fn fetch_image(&self, image_url: &str, max_bytes: usize) -> Result<Vec<u8>, FetchError>;
}

/// CSS selectors locating catalog data in the HTML.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub listing_item: String,
    pub listing_link: String,
    pub listing_title: String,
    pub detail_image: String,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            listing_item: "ul.listing-grid li".into(),
            listing_link: "a".into(),
            listing_title: "span.title".into(),
            detail_image: "div.artwork img".into(),
        }
    }
}

pub struct Selectors {
    listing_item: Selector,
    listing_link: Selector,
    listing_title: Selector,
    detail_image: Selector,
}

impl Selectors {
    pub fn compile(config: &SelectorConfig) -> Result<Self, FetchError> {
        let parse = |s: &str| {
            Selector::parse(s).map_err(|e| FetchError::Selector {
                selector: s.to_string(),
                reason: e.to_string(),
            })
        };
        Ok(Self {
            listing_item: parse(&config.listing_item)?,
            listing_link: parse(&config.listing_link)?,
            listing_title: parse(&config.listing_title)?,
            detail_image: parse(&config.detail_image)?,
        })
    }
}

/// Extract every `(href, title)` pair from a listing page.
pub fn parse_listing(html: &str, selectors: &Selectors) -> Vec<ListingEntry> {
    let document = Html::parse_document(html);
    document
        .select(&selectors.listing_item)
        .filter_map(|item| {
            let href = item
                .select(&selectors.listing_link)
                .find_map(|a| a.value().attr("href"))?;
            let title = item
                .select(&selectors.listing_title)
                .next()
                .map(title_text)
                .unwrap_or_default();
            Some(ListingEntry { href: href.to_string(), title })
        })
        .collect()
}

/// Title text with any nested `.date` element left out, whitespace collapsed.
fn title_text(el: ElementRef<'_>) -> String {
    let mut text = String::new();
    for child in el.children() {
        match child.value() {
            Node::Text(t) => text.push_str(t),
            Node::Element(e) if e.classes().any(|c| c == "date") => {}
            Node::Element(_) => {
                if let Some(inner) = ElementRef::wrap(child) {
                    text.extend(inner.text());
                }
            }
            _ => {}
        }
    }
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Find the painting image on a detail page, resolved against `page_url`.
pub fn parse_image_url(html: &str, page_url: &Url, selectors: &Selectors) -> Option<String> {
    let document = Html::parse_document(html);
    let img = document.select(&selectors.detail_image).next()?;
    let src = img.value().attr("src").or_else(|| img.value().attr("data-src"))?;
    page_url.join(src.trim()).ok().map(String::from)
}

pub struct HttpCatalog {
    client: reqwest::blocking::Client,
    listing_url: String,
    selectors: Selectors,
}

impl HttpCatalog {
    /// `listing_url` contains a `{page}` placeholder for the page number.
    pub fn new(
        listing_url: &str,
        timeout: Duration,
        selectors: &SelectorConfig,
    ) -> Result<Self, FetchError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(FetchError::Client)?;
        Ok(Self {
            client,
            listing_url: listing_url.to_string(),
            selectors: Selectors::compile(selectors)?,
        })
    }

    fn get(&self, url: &str) -> Result<reqwest::blocking::Response, FetchError> {
        let response = self.client.get(url).send().map_err(|e| transport(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Http { url: url.to_string(), status: status.as_u16() });
        }
        Ok(response)
    }

    fn get_text(&self, url: &str) -> Result<String, FetchError> {
        self.get(url)?.text().map_err(|e| transport(url, e))
    }
}

impl CatalogSource for HttpCatalog {
    fn fetch_listing(&self, page: u32) -> Result<ListingPage, FetchError> {
        let url = self.listing_url.replace("{page}", &page.to_string());
        let html = self.get_text(&url)?;
        let entries = parse_listing(&html, &self.selectors);
        if entries.is_empty() {
            return Err(FetchError::MalformedSource { url, reason: "no listing entries".into() });
        }
        tracing::debug!(page, entries = entries.len(), "listing page parsed");
        Ok(ListingPage { url, entries })
    }

    fn fetch_image_url(&self, detail_url: &str) -> Result<String, FetchError> {
        let page_url = Url::parse(detail_url).map_err(|e| FetchError::MalformedSource {
            url: detail_url.to_string(),
            reason: e.to_string(),
        })?;
        let html = self.get_text(detail_url)?;
        parse_image_url(&html, &page_url, &self.selectors).ok_or_else(|| {
            FetchError::MalformedSource {
                url: detail_url.to_string(),
                reason: "no artwork image".into(),
            }
        })
    }

    fn fetch_image(&self, image_url: &str, max_bytes: usize) -> Result<Vec<u8>, FetchError> {
        let response = self.get(image_url)?;
        let declared = response.content_length();
        read_limited(response, declared, image_url, max_bytes)
    }
}

/// Read a body of at most `limit` bytes. Never buffers more than `limit + 1`.
fn read_limited(
    body: impl Read,
    declared_len: Option<u64>,
    url: &str,
    limit: usize,
) -> Result<Vec<u8>, FetchError> {
    let too_large = || FetchError::TooLarge { url: url.to_string(), limit };
    if declared_len.is_some_and(|len| len > limit as u64) {
        return Err(too_large());
    }

    let mut bytes = Vec::new();
    body.take(limit as u64 + 1)
        .read_to_end(&mut bytes)
        .map_err(|source| match source.kind() {
            std::io::ErrorKind::TimedOut => FetchError::NetworkTimeout { url: url.to_string() },
            _ => FetchError::Body { url: url.to_string(), source },
        })?;
    if bytes.len() > limit {
        return Err(too_large());
    }
    Ok(bytes)
}

fn transport(url: &str, e: reqwest::Error) -> FetchError {
    if e.is_timeout() {
        FetchError::NetworkTimeout { url: url.to_string() }
    } else {
        FetchError::Transport { url: url.to_string(), source: e }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"
        <html><body>
        <ul class="listing-grid listing masonary-grid">
          <li><a href="/discover/artworks/the-blue-boy-1234/view_as/grid/search/page/2">
                <span class="title">The Blue
                   Boy <span class="date">(c.1770)</span></span></a></li>
          <li><a href="https://artuk.org/discover/artworks/portrait-of-a-lady-99">
                <span class="title">Portrait of a Lady</span></a></li>
          <li><span class="title">No link here</span></li>
        </ul>
        </body></html>
    "#;

    fn selectors() -> Selectors {
        Selectors::compile(&SelectorConfig::default()).unwrap()
    }

    #[test]
    fn test_parse_listing() {
        let entries = parse_listing(LISTING, &selectors());
        assert_eq!(
            entries,
            vec![
                ListingEntry {
                    href: "/discover/artworks/the-blue-boy-1234/view_as/grid/search/page/2".into(),
                    title: "The Blue Boy".into(),
                },
                ListingEntry {
                    href: "https://artuk.org/discover/artworks/portrait-of-a-lady-99".into(),
                    title: "Portrait of a Lady".into(),
                },
            ]
        );
    }

    #[test]
    fn test_parse_image_url_resolves_relative() {
        let html = r#"<div class="artwork"><img src="/img/blue-boy.jpg"></div>"#;
        let page = Url::parse("https://artuk.org/discover/artworks/the-blue-boy-1234").unwrap();
        assert_eq!(
            parse_image_url(html, &page, &selectors()).as_deref(),
            Some("https://artuk.org/img/blue-boy.jpg")
        );
        assert!(parse_image_url("<div></div>", &page, &selectors()).is_none());
    }

    #[test]
    fn test_remote_id_before_view_suffix() {
        let url =
            Url::parse("https://artuk.org/discover/artworks/the-blue-boy-1234/view_as/grid").unwrap();
        assert_eq!(remote_id_from_url(&url).as_deref(), Some("the-blue-boy-1234"));

        let url = Url::parse("https://artuk.org/discover/artworks/lady-99/").unwrap();
        assert_eq!(remote_id_from_url(&url).as_deref(), Some("lady-99"));
    }

    #[test]
    fn test_remote_id_sanitized_and_truncated() {
        let url = Url::parse("https://artuk.org/artworks/lady+child:1").unwrap();
        assert_eq!(remote_id_from_url(&url).as_deref(), Some("lady_child_1"));

        let long = "a".repeat(400);
        let url = Url::parse(&format!("https://artuk.org/artworks/{long}")).unwrap();
        assert_eq!(remote_id_from_url(&url).unwrap().len(), MAX_REMOTE_ID_LEN);

        assert!(remote_id_from_url(&Url::parse("https://artuk.org/").unwrap()).is_none());
        assert!(remote_id_from_url(&Url::parse("https://artuk.org/view_as/grid").unwrap()).is_none());
    }

    #[test]
    fn test_item_from_relative_entry() {
        let base = Url::parse("https://artuk.org/discover/artworks/view_as/grid/page/3").unwrap();
        let entry = ListingEntry {
            href: "/discover/artworks/the-blue-boy-1234/view_as/grid/search/page/2".into(),
            title: "The Blue Boy".into(),
        };
        let item = CatalogItem::from_entry(&base, &entry).unwrap();
        assert_eq!(item.remote_id, "the-blue-boy-1234");
        assert_eq!(
            item.detail_url,
            "https://artuk.org/discover/artworks/the-blue-boy-1234/view_as/grid/search/page/2"
        );
        assert_eq!(item.source_url(), "https://artuk.org/discover/artworks/the-blue-boy-1234");
    }

    #[test]
    fn test_source_url_matches_whole_segment() {
        let base = Url::parse("https://artuk.org/discover/artworks/view_as/grid/page/1").unwrap();
        let entry = ListingEntry {
            href: "/discover/artworks/view_assessment-77".into(),
            title: "Assessment".into(),
        };
        let item = CatalogItem::from_entry(&base, &entry).unwrap();
        assert_eq!(item.remote_id, "view_assessment-77");
        assert_eq!(item.source_url(), "https://artuk.org/discover/artworks/view_assessment-77");

        let entry = ListingEntry {
            href: "/discover/artworks/view_assessment-77/view_as/list?sort=date".into(),
            title: "Assessment".into(),
        };
        let item = CatalogItem::from_entry(&base, &entry).unwrap();
        assert_eq!(item.source_url(), "https://artuk.org/discover/artworks/view_assessment-77");
    }

    #[test]
    fn test_read_limited_bounds_the_body() {
        let body = vec![1u8; 100];
        assert_eq!(read_limited(&body[..], Some(100), "u", 100).unwrap().len(), 100);

        // an endless body is cut off one byte past the limit
        let err = read_limited(std::io::repeat(0), None, "u", 64).unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 64, .. }));
        assert!(err.is_permanent());

        let err = read_limited(&body[..], Some(1 << 40), "u", 1024).unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { .. }));
    }

    #[test]
    fn test_error_classification() {
        let timeout = FetchError::NetworkTimeout { url: "u".into() };
        assert!(timeout.is_timeout());
        assert!(!timeout.is_permanent());

        let missing = FetchError::Http { url: "u".into(), status: 404 };
        assert!(missing.is_permanent());
        let busy = FetchError::Http { url: "u".into(), status: 503 };
        assert!(!busy.is_permanent());
        let throttled = FetchError::Http { url: "u".into(), status: 429 };
        assert!(!throttled.is_permanent());

        let malformed = FetchError::MalformedSource { url: "u".into(), reason: "x".into() };
        assert!(malformed.is_permanent());
    }

    #[test]
    fn test_invalid_selector() {
        let config = SelectorConfig { listing_item: "ul[".into(), ..Default::default() };
        assert!(matches!(Selectors::compile(&config), Err(FetchError::Selector { .. })));
    }
}
