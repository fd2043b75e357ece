use anyhow::Result;
use async_trait::async_trait;
use base64::Engine;
use image::ImageFormat;
use log::{error, info, warn};
use rand::seq::SliceRandom;
use regex::Regex;
use std::collections::HashSet;
use std::time::Duration;
use url::Url;

const FETCH_TIMEOUT: Duration = Duration::from_secs(5);
const ROUND_SLEEP: Duration = Duration::from_secs(1);
const DEFAULT_MAX_ROUNDS: usize = 100;
const MIN_IMAGE_SIDE: u32 = 250;
const RESULT_LIMIT: usize = 10;
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/58.0.3029.110 Safari/537.3";
const DEFAULT_SEARCH_BASE: &str = "https://html.duckduckgo.com/html/";

/// Decides whether a fetched image fits the episode topic. Implemented by the
/// state machine; the scraper only drives candidates through it.
#[async_trait]
pub trait ImageJudge: Send + Sync {
    async fn accepts(&self, image_base64: &str) -> Result<bool>;
}

/// A source of topic-related images, keyed by a search term.
#[async_trait]
pub trait ImageSource: Send + Sync {
    async fn find_image(&mut self, search_term: &str, judge: &dyn ImageJudge)
        -> Result<Option<String>>;
}

/// Web scraper for fetching high quality images from search results.
///
/// URLs that fail once are blacklisted for the life of the scraper; URLs
/// visited during one `find_image` run are not fetched again within that run.
pub struct WebScraper {
    http: reqwest::Client,
    search_base: String,
    max_rounds: usize,
    urls: Vec<String>,
    processed: HashSet<String>,
    blacklist: HashSet<String>,
}

impl Default for WebScraper {
    fn default() -> Self {
        Self::new()
    }
}

impl WebScraper {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            search_base: DEFAULT_SEARCH_BASE.to_string(),
            max_rounds: DEFAULT_MAX_ROUNDS,
            urls: Vec::new(),
            processed: HashSet::new(),
            blacklist: HashSet::new(),
        }
    }

    #[cfg(test)]
    fn with_search_base(search_base: &str, max_rounds: usize) -> Self {
        let mut scraper = Self::new();
        scraper.search_base = search_base.to_string();
        scraper.max_rounds = max_rounds;
        scraper
    }

    /// Resolves a keyword to ranked result URLs. Failures degrade to an
    /// empty list; the round loop will query again.
    async fn search(&self, keyword: &str) -> Vec<String> {
        let request = self
            .http
            .get(&self.search_base)
            .query(&[("q", keyword)])
            .header("User-Agent", USER_AGENT)
            .timeout(FETCH_TIMEOUT);

        let page = match request.send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.unwrap_or_default(),
            Ok(resp) => {
                error!("Search failed: HTTP {}", resp.status());
                return Vec::new();
            }
            Err(e) => {
                error!("Search failed: {}", e);
                return Vec::new();
            }
        };

        let link = Regex::new(r#"<a[^>]*class="[^"]*result__a[^"]*"[^>]*href="([^"]+)""#).unwrap();
        link.captures_iter(&page)
            .map(|captures| resolve_search_redirect(&captures[1].replace("&amp;", "&")))
            .take(RESULT_LIMIT)
            .collect()
    }

    async fn fetch_page(&mut self, url: &str) -> Option<String> {
        let corrected = correct_url_scheme(url);
        if self.blacklist.contains(&corrected) || self.processed.contains(&corrected) {
            return None;
        }
        self.processed.insert(corrected.clone());

        let request = self
            .http
            .get(&corrected)
            .header("User-Agent", USER_AGENT)
            .timeout(FETCH_TIMEOUT);
        match request.send().await {
            Ok(resp) if resp.status().is_success() => resp.text().await.ok(),
            Ok(resp) => {
                self.blacklist.insert(corrected.clone());
                error!("Failed to fetch URL content: HTTP {} for URL: {}", resp.status(), corrected);
                None
            }
            Err(e) => {
                self.blacklist.insert(corrected.clone());
                error!("Failed to fetch URL content: {} for URL: {}", e, corrected);
                None
            }
        }
    }

    async fn fetch_image(&mut self, url: &str) -> Option<Vec<u8>> {
        let corrected = correct_url_scheme(url);
        if self.blacklist.contains(&corrected) || self.processed.contains(&corrected) {
            return None;
        }
        self.processed.insert(corrected.clone());

        let request = self
            .http
            .get(&corrected)
            .header("User-Agent", USER_AGENT)
            .timeout(FETCH_TIMEOUT);
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                info!("Downloaded image from: {}", corrected);
                resp.bytes().await.ok().map(|bytes| bytes.to_vec())
            }
            Ok(resp) => {
                self.blacklist.insert(corrected.clone());
                error!("Failed to fetch image: HTTP {} for URL: {}", resp.status(), corrected);
                None
            }
            Err(e) => {
                self.blacklist.insert(corrected.clone());
                error!("Failed to fetch image: {} for URL: {}", e, corrected);
                None
            }
        }
    }

    async fn process_page(
        &mut self,
        page_url: &str,
        page: &str,
        judge: &dyn ImageJudge,
    ) -> Option<String> {
        let mut candidates = extract_image_urls(page, page_url);
        {
            let mut rng = rand::rng();
            candidates.shuffle(&mut rng);
        }

        for candidate in candidates {
            let Some(bytes) = self.fetch_image(&candidate).await else {
                continue;
            };
            let encoded = base64::engine::general_purpose::STANDARD.encode(&bytes);
            if !validate_base64_image(&encoded) {
                continue;
            }
            match judge.accepts(&encoded).await {
                Ok(true) => return Some(encoded),
                Ok(false) => {}
                Err(e) => warn!("Image judgement failed: {}", e),
            }
        }
        None
    }
}

#[async_trait]
impl ImageSource for WebScraper {
    async fn find_image(
        &mut self,
        search_term: &str,
        judge: &dyn ImageJudge,
    ) -> Result<Option<String>> {
        self.processed.clear();
        self.urls.clear();

        for _ in 0..self.max_rounds {
            if self.urls.is_empty() {
                let mut found = self.search(search_term).await;
                found.retain(|url| !self.blacklist.contains(&correct_url_scheme(url)));
                {
                    let mut rng = rand::rng();
                    found.shuffle(&mut rng);
                }
                self.urls = found;
            }

            let urls = self.urls.clone();
            for url in urls {
                let Some(page) = self.fetch_page(&url).await else {
                    continue;
                };
                if let Some(image) = self.process_page(&url, &page, judge).await {
                    return Ok(Some(image));
                }
            }

            self.urls.clear();
            tokio::time::sleep(ROUND_SLEEP).await;
        }

        error!("Max retries reached without finding a suitable image.");
        Ok(None)
    }
}

/// Ensures the URL has a valid https scheme if it lacks one.
pub fn correct_url_scheme(url: &str) -> String {
    if url.starts_with("//") {
        return format!("https:{}", url);
    }
    match Url::parse(url) {
        Ok(_) => url.to_string(),
        Err(_) => format!("https://{}", url),
    }
}

/// Search results point at a redirect endpoint carrying the target in its
/// `uddg` parameter.
fn resolve_search_redirect(href: &str) -> String {
    if !href.contains("uddg=") {
        return href.to_string();
    }
    let corrected = correct_url_scheme(href);
    if let Ok(parsed) = Url::parse(&corrected) {
        if let Some((_, target)) = parsed.query_pairs().find(|(key, _)| key == "uddg") {
            return target.into_owned();
        }
    }
    href.to_string()
}

/// Collects candidate image URLs from a page, preferring the
/// highest-declared-resolution source of each tag.
fn extract_image_urls(page: &str, page_url: &str) -> Vec<String> {
    let tag_pattern = Regex::new(r"<img[^>]+>").unwrap();
    let base = Url::parse(&correct_url_scheme(page_url)).ok();

    let mut urls = Vec::new();
    for tag in tag_pattern.find_iter(page) {
        let Some(source) = best_source(tag.as_str()) else {
            continue;
        };
        let resolved = match &base {
            Some(base) => match base.join(&source) {
                Ok(joined) => joined.to_string(),
                Err(_) => correct_url_scheme(&source),
            },
            None => correct_url_scheme(&source),
        };
        if resolved.ends_with(".svg") {
            continue;
        }
        urls.push(resolved);
    }
    urls
}

/// First available source attribute, with candidate sets reduced to their
/// widest entry.
fn best_source(tag: &str) -> Option<String> {
    for attr in ["data-srcset", "data-src", "srcset", "src"] {
        let pattern = Regex::new(&format!(r#"{}\s*=\s*"([^"]+)""#, attr)).unwrap();
        if let Some(captures) = pattern.captures(tag) {
            let value = captures[1].trim().to_string();
            if value.is_empty() {
                continue;
            }
            if value.contains(',') {
                return widest_srcset_entry(&value);
            }
            return Some(value);
        }
    }
    None
}

fn widest_srcset_entry(srcset: &str) -> Option<String> {
    let mut best: Option<(u32, String)> = None;
    for entry in srcset.split(',') {
        let mut parts = entry.split_whitespace();
        let Some(url) = parts.next() else { continue };
        let width = parts
            .next()
            .and_then(|descriptor| descriptor.trim_end_matches('w').parse::<u32>().ok())
            .unwrap_or(0);
        if best.as_ref().map_or(true, |(best_width, _)| width > *best_width) {
            best = Some((width, url.to_string()));
        }
    }
    best.map(|(_, url)| url)
}

/// Validates that a base64 payload decodes to a non-animated image of at
/// least 250x250 pixels.
pub fn validate_base64_image(base64_string: &str) -> bool {
    let Ok(bytes) = base64::engine::general_purpose::STANDARD.decode(base64_string) else {
        return false;
    };
    match image::guess_format(&bytes) {
        Ok(ImageFormat::Gif) | Err(_) => return false,
        Ok(_) => {}
    }
    match image::load_from_memory(&bytes) {
        Ok(decoded) => decoded.width().min(decoded.height()) >= MIN_IMAGE_SIDE,
        Err(e) => {
            error!("Image validation failed: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::{Arc, Mutex};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[test]
    fn scheme_correction() {
        assert_eq!(correct_url_scheme("//cdn.example.com/a.png"), "https://cdn.example.com/a.png");
        assert_eq!(correct_url_scheme("example.com/a.png"), "https://example.com/a.png");
        assert_eq!(correct_url_scheme("http://example.com/a.png"), "http://example.com/a.png");
    }

    #[test]
    fn widest_srcset_entry_wins() {
        let srcset = "small.jpg 320w, medium.jpg 640w, large.jpg 1280w";
        assert_eq!(widest_srcset_entry(srcset), Some("large.jpg".to_string()));

        // Entries without descriptors lose against any sized entry.
        let srcset = "fallback.jpg, sized.jpg 480w";
        assert_eq!(widest_srcset_entry(srcset), Some("sized.jpg".to_string()));
    }

    #[test]
    fn extracts_and_resolves_image_sources() {
        let page = r#"
            <img src="/images/photo.jpg">
            <img data-src="lazy.png" src="placeholder.gif">
            <img src="vector.svg">
            <img srcset="a.jpg 100w, b.jpg 900w">
        "#;
        let urls = extract_image_urls(page, "https://example.com/article/");
        assert!(urls.contains(&"https://example.com/images/photo.jpg".to_string()));
        // data-src beats the placeholder src.
        assert!(urls.contains(&"https://example.com/article/lazy.png".to_string()));
        assert!(urls.contains(&"https://example.com/article/b.jpg".to_string()));
        assert!(!urls.iter().any(|url| url.ends_with(".svg")));
    }

    #[test]
    fn search_redirects_are_unwrapped() {
        let href = "//duckduckgo.com/l/?uddg=https%3A%2F%2Fexample.com%2Fpage&rut=abc";
        assert_eq!(resolve_search_redirect(href), "https://example.com/page");
        assert_eq!(resolve_search_redirect("https://direct.example.com"), "https://direct.example.com");
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = image::DynamicImage::ImageRgb8(image::RgbImage::new(width, height));
        let mut buffer = Cursor::new(Vec::new());
        img.write_to(&mut buffer, ImageFormat::Png).unwrap();
        buffer.into_inner()
    }

    #[test]
    fn image_validation_enforces_format_and_size() {
        let encode = |bytes: &[u8]| base64::engine::general_purpose::STANDARD.encode(bytes);

        assert!(validate_base64_image(&encode(&png_bytes(300, 300))));
        assert!(!validate_base64_image(&encode(&png_bytes(100, 300))));
        assert!(!validate_base64_image(&encode(b"not an image")));
        assert!(!validate_base64_image("%%% not base64 %%%"));

        let gif = {
            let img = image::DynamicImage::ImageRgba8(image::RgbaImage::new(300, 300));
            let mut buffer = Cursor::new(Vec::new());
            img.write_to(&mut buffer, ImageFormat::Gif).unwrap();
            buffer.into_inner()
        };
        assert!(!validate_base64_image(&encode(&gif)));
    }

    struct AcceptAll;

    #[async_trait]
    impl ImageJudge for AcceptAll {
        async fn accepts(&self, _image_base64: &str) -> Result<bool> {
            Ok(true)
        }
    }

    async fn read_headers(socket: &mut tokio::net::TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 2048];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if data.windows(4).any(|window| window == b"\r\n\r\n") {
                break;
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    async fn write_response(socket: &mut tokio::net::TcpStream, body: &[u8]) {
        let header = format!(
            "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let _ = socket.write_all(header.as_bytes()).await;
        let _ = socket.write_all(body).await;
        let _ = socket.shutdown().await;
    }

    /// Serves a search result page, an article page and a valid image from
    /// one listener, routing by path.
    async fn spawn_site(image: Vec<u8>, page_hits: Arc<Mutex<usize>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let image = image.clone();
                let page_hits = page_hits.clone();
                tokio::spawn(async move {
                    let request = read_headers(&mut socket).await;
                    if request.starts_with("GET /search") {
                        let body = format!(
                            r#"<a class="result__a" href="http://{addr}/article">result</a>"#,
                            addr = addr
                        );
                        write_response(&mut socket, body.as_bytes()).await;
                    } else if request.starts_with("GET /article") {
                        *page_hits.lock().unwrap() += 1;
                        let body = r#"<html><img src="/photo.png"></html>"#;
                        write_response(&mut socket, body.as_bytes()).await;
                    } else if request.starts_with("GET /photo.png") {
                        write_response(&mut socket, &image).await;
                    } else {
                        write_response(&mut socket, b"").await;
                    }
                });
            }
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn finds_validates_and_returns_an_acceptable_image() {
        let page_hits = Arc::new(Mutex::new(0));
        let site = spawn_site(png_bytes(300, 300), page_hits.clone()).await;

        let mut scraper = WebScraper::with_search_base(&format!("{}/search", site), 2);
        let found = scraper.find_image("fractals", &AcceptAll).await.unwrap();

        let image = found.expect("expected an accepted image");
        assert!(validate_base64_image(&image));
        assert_eq!(*page_hits.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn failed_urls_are_blacklisted_across_runs() {
        // A listener that accepts and immediately closes: every fetch errors.
        let broken = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broken_addr = broken.local_addr().unwrap();
        let broken_hits = Arc::new(Mutex::new(0));
        {
            let broken_hits = broken_hits.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = broken.accept().await else { break };
                    *broken_hits.lock().unwrap() += 1;
                    drop(socket);
                }
            });
        }

        // The search stub advertises only the broken URL.
        let search = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let search_addr = search.local_addr().unwrap();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = search.accept().await else { break };
                tokio::spawn(async move {
                    let _ = read_headers(&mut socket).await;
                    let body = format!(
                        r#"<a class="result__a" href="http://{}/page">broken</a>"#,
                        broken_addr
                    );
                    write_response(&mut socket, body.as_bytes()).await;
                });
            }
        });

        let mut scraper =
            WebScraper::with_search_base(&format!("http://{}/search", search_addr), 1);

        let first = scraper.find_image("anything", &AcceptAll).await.unwrap();
        assert!(first.is_none());
        let hits_after_first = *broken_hits.lock().unwrap();
        assert!(hits_after_first >= 1);

        // Second run: the broken URL is filtered out before any fetch.
        let second = scraper.find_image("anything", &AcceptAll).await.unwrap();
        assert!(second.is_none());
        assert_eq!(*broken_hits.lock().unwrap(), hits_after_first);
    }
}
