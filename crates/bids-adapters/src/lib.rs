//! Raw-item providers: HTML clients, the samosval.info listing parser and a stub
//! provider for wiring checks.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use bids_core::{ProviderError, RawItem, RawItemProvider, Source};
use chrono::Utc;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "bids-adapters";

pub const SAMOSVAL_SOURCE_CODE: &str = "SAMOSVAL";
pub const DEFAULT_SAMOSVAL_LISTINGS_URL: &str = "https://samosval.info/";
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/123.0.0.0 Safari/537.36";
const DEFAULT_ACCEPT: &str = "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8";
const DEFAULT_ACCEPT_LANGUAGE: &str = "ru-RU,ru;q=0.9,en-US;q=0.8,en;q=0.7";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderConfig {
    /// Overrides the browser-like default user agent.
    pub user_agent: Option<String>,
    pub http_timeout_secs: u64,
    pub samosval_listings_url: String,
    /// When set, HTML providers read `<dir>/<source>/listing.html` instead of the network.
    pub fixture_dir: Option<PathBuf>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            user_agent: None,
            http_timeout_secs: 10,
            samosval_listings_url: DEFAULT_SAMOSVAL_LISTINGS_URL.to_string(),
            fixture_dir: None,
        }
    }
}

/// Fetched HTML document. `url` is the final URL after redirects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HtmlPage {
    pub url: String,
    pub content: String,
}

#[derive(Debug, Error)]
pub enum HtmlClientError {
    #[error("http request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    Status { status: u16, url: String },
}

#[async_trait]
pub trait HtmlClient: Send + Sync {
    async fn get(&self, url: &str) -> Result<HtmlPage, HtmlClientError>;
}

/// Single-attempt HTTP client with browser-like default headers.
#[derive(Debug, Clone)]
pub struct HttpHtmlClient {
    client: reqwest::Client,
}

impl HttpHtmlClient {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(DEFAULT_ACCEPT));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static(DEFAULT_ACCEPT_LANGUAGE));

        let user_agent = config
            .user_agent
            .clone()
            .unwrap_or_else(|| DEFAULT_USER_AGENT.to_string());
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(config.http_timeout_secs.max(1)))
            .user_agent(user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HtmlClient for HttpHtmlClient {
    async fn get(&self, url: &str) -> Result<HtmlPage, HtmlClientError> {
        let resp = self.client.get(url).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if status.as_u16() >= 400 {
            return Err(HtmlClientError::Status {
                status: status.as_u16(),
                url: final_url,
            });
        }
        let content = resp.text().await?;
        Ok(HtmlPage {
            url: final_url,
            content,
        })
    }
}

/// Serves one stored document for every request, reported under a fixed URL.
#[derive(Debug, Clone)]
pub struct FixtureHtmlClient {
    page: HtmlPage,
}

impl FixtureHtmlClient {
    pub fn new(url: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            page: HtmlPage {
                url: url.into(),
                content: content.into(),
            },
        }
    }

    pub fn from_file(url: impl Into<String>, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading html fixture {}", path.display()))?;
        Ok(Self::new(url, content))
    }
}

#[async_trait]
impl HtmlClient for FixtureHtmlClient {
    async fn get(&self, _url: &str) -> Result<HtmlPage, HtmlClientError> {
        Ok(self.page.clone())
    }
}

/// One order card from a samosval.info listing page, kept as display strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SamosvalListing {
    pub external_id: Option<String>,
    pub title: String,
    pub route_from: Option<String>,
    pub route_to: Option<String>,
    pub weight: Option<String>,
    pub price: Option<String>,
    pub meta_raw: Option<String>,
    pub url: String,
}

fn selector(css: &str) -> Result<Selector, ProviderError> {
    Selector::parse(css).map_err(|e| ProviderError::Message(e.to_string()))
}

/// Stripped text pieces of the first match, joined. A present but empty
/// element yields `Some("")`; only a missing element yields `None`.
fn select_first_text(scope: ElementRef<'_>, sel: &Selector) -> Option<String> {
    scope
        .select(sel)
        .next()
        .map(|n| n.text().map(str::trim).collect::<String>())
}

/// Parses `div.order-card` blocks. Cards without `a.order-card__link` are
/// skipped; links resolve against `base_url` or, if absent, the page URL.
pub fn parse_samosval_list_page(
    page: &HtmlPage,
    base_url: Option<&str>,
) -> Result<Vec<SamosvalListing>, ProviderError> {
    let base = base_url.unwrap_or(&page.url);
    let base = Url::parse(base)
        .map_err(|e| ProviderError::Message(format!("invalid base url {base}: {e}")))?;

    let card_sel = selector("div.order-card")?;
    let link_sel = selector("a.order-card__link")?;
    let route_sel = selector(".order-card__route")?;
    let from_sel = selector(".from")?;
    let to_sel = selector(".to")?;
    let meta_sel = selector(".order-card__meta")?;
    let weight_sel = selector(".weight")?;
    let price_sel = selector(".price")?;
    let extra_sel = selector(".extra")?;

    let document = Html::parse_document(&page.content);
    let mut listings = Vec::new();
    for card in document.select(&card_sel) {
        let Some(link) = card.select(&link_sel).next() else {
            continue;
        };
        let href = link.value().attr("href").unwrap_or_default();
        let url = base
            .join(href)
            .map_err(|e| ProviderError::Message(format!("invalid listing link {href}: {e}")))?;

        let route = card.select(&route_sel).next();
        let meta = card.select(&meta_sel).next();

        listings.push(SamosvalListing {
            external_id: card.value().attr("data-id").map(str::to_string),
            title: link.text().collect::<String>().trim().to_string(),
            route_from: route.and_then(|r| select_first_text(r, &from_sel)),
            route_to: route.and_then(|r| select_first_text(r, &to_sel)),
            weight: meta.and_then(|m| select_first_text(m, &weight_sel)),
            price: meta.and_then(|m| select_first_text(m, &price_sel)),
            meta_raw: meta.and_then(|m| select_first_text(m, &extra_sel)),
            url: url.to_string(),
        });
    }
    Ok(listings)
}

impl SamosvalListing {
    /// Raw item carrying this listing as a JSON payload. `source_id` stays
    /// unset; the harvesting run fills it in.
    pub fn into_raw_item(self) -> Result<RawItem, ProviderError> {
        let payload = serde_json::to_string(&self).context("serializing samosval listing")?;
        let mut item = RawItem::new(payload);
        item.external_id = self.external_id;
        item.url = Some(self.url);
        Ok(item)
    }
}

pub struct SamosvalProvider<C> {
    client: C,
    listings_url: String,
    base_url_override: Option<String>,
}

impl<C: HtmlClient> SamosvalProvider<C> {
    pub fn new(client: C, listings_url: impl Into<String>) -> Self {
        Self {
            client,
            listings_url: listings_url.into(),
            base_url_override: None,
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url_override = Some(base_url.into());
        self
    }

    pub async fn fetch_listings(&self) -> Result<Vec<SamosvalListing>, ProviderError> {
        let page = self
            .client
            .get(&self.listings_url)
            .await
            .with_context(|| format!("fetching samosval listings from {}", self.listings_url))?;
        let listings = parse_samosval_list_page(&page, self.base_url_override.as_deref())?;
        debug!(count = listings.len(), url = %page.url, "parsed samosval listing page");
        Ok(listings)
    }
}

#[async_trait]
impl<C: HtmlClient> RawItemProvider for SamosvalProvider<C> {
    async fn fetch_raw_items(&self, source: &Source) -> Result<Vec<RawItem>, ProviderError> {
        let span = info_span!("samosval_fetch", source_code = %source.code, url = %self.listings_url);
        let listings = self.fetch_listings().instrument(span).await?;
        listings
            .into_iter()
            .map(SamosvalListing::into_raw_item)
            .collect()
    }
}

/// Emits one synthetic raw item per call.
#[derive(Debug, Clone, Copy, Default)]
pub struct StubRawItemProvider;

#[async_trait]
impl RawItemProvider for StubRawItemProvider {
    async fn fetch_raw_items(&self, source: &Source) -> Result<Vec<RawItem>, ProviderError> {
        let now = Utc::now();
        let mut item = RawItem::new(format!(
            "Stub payload for source {} at {}",
            source.code,
            now.format("%Y-%m-%dT%H:%M:%S")
        ));
        item.source_id = source.id.persisted();
        item.external_id = Some(format!("stub-{}-{}", source.code, now.format("%Y%m%d%H%M%S")));
        item.created_at = now;
        item.received_at = now;
        Ok(vec![item])
    }
}

/// Provider for a source code. Sources without a dedicated parser get the stub.
pub fn provider_for_source(code: &str, config: &ProviderConfig) -> Result<Box<dyn RawItemProvider>> {
    if !code.eq_ignore_ascii_case(SAMOSVAL_SOURCE_CODE) {
        debug!(source_code = code, "no dedicated provider, using stub");
        return Ok(Box::new(StubRawItemProvider));
    }

    match &config.fixture_dir {
        Some(dir) => {
            let path = dir.join("samosval").join("listing.html");
            let client = FixtureHtmlClient::from_file(&config.samosval_listings_url, path)?;
            Ok(Box::new(SamosvalProvider::new(client, &config.samosval_listings_url)))
        }
        None => {
            let client = HttpHtmlClient::new(config)?;
            Ok(Box::new(SamosvalProvider::new(client, &config.samosval_listings_url)))
        }
    }
}
