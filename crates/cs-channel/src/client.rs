use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::NaiveDate;
use cs_core::config::{Config, CredentialProvider, DateType, MAX_PAGE_SIZE};
use cs_harness::pacing::{Pacer, PacingPolicy};
use cs_harness::shutdown::CancelFlag;
use reqwest::StatusCode;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{ChannelError, Result};
use crate::raw::{extract_items, Resource};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Reservation date filter sent as `from`, `to` and `dateType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateFilter {
    pub from: NaiveDate,
    pub to: NaiveDate,
    pub date_type: DateType,
}

impl DateFilter {
    /// Stable identifier used to key resumable cursors.
    pub fn key(&self) -> String {
        format!("{}:{}:{}", self.date_type.as_str(), self.from, self.to)
    }
}

/// One page of a paginated collection. The cursor is a `skip` offset.
#[derive(Debug, Clone, Default)]
pub struct Page {
    pub items: Vec<Value>,
    pub skip: u64,
    /// `Some(offset)` when a full page came back and more may follow.
    pub next_cursor: Option<u64>,
}

impl Page {
    pub fn has_more(&self) -> bool {
        self.next_cursor.is_some()
    }
}

/// A page that could not be fetched after retries.
#[derive(Debug, Clone)]
pub struct PageFailure {
    pub resource: Resource,
    pub skip: u64,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct CollectionResult {
    pub items: Vec<Value>,
    pub failures: Vec<PageFailure>,
    /// True only when the walk reached the last page without losing one.
    pub complete: bool,
    /// Where an interrupted walk should resume.
    pub next_cursor: Option<u64>,
    /// Page requests made, failed ones included.
    pub pages: u32,
}

// ---------------------------------------------------------------------------
// ChannelApi
// ---------------------------------------------------------------------------

#[async_trait]
pub trait ChannelApi: Send + Sync {
    fn page_size(&self) -> u32;

    fn max_pages(&self) -> u32;

    async fn fetch_page(
        &self,
        resource: Resource,
        filter: Option<&DateFilter>,
        skip: u64,
    ) -> Result<Page>;

    /// Direct lookup. A missing record is `Err(ChannelError::NotFound)`.
    async fn fetch_by_id(&self, resource: Resource, external_id: &str) -> Result<Value>;

    /// Walk pages from `start` until exhaustion, `max_pages` or
    /// cancellation.
    ///
    /// Only authentication failures are returned as `Err`. A page that fails
    /// after retries is recorded in `failures` and skipped by one page size;
    /// the walk carries on but `complete` stays false, so the caller can tell
    /// a gapped snapshot from a full one.
    async fn fetch_collection(
        &self,
        resource: Resource,
        filter: Option<&DateFilter>,
        start: u64,
        cancel: &CancelFlag,
    ) -> Result<CollectionResult> {
        let mut out = CollectionResult::default();
        let mut skip = start;
        loop {
            if cancel.is_cancelled() {
                out.next_cursor = Some(skip);
                break;
            }
            if out.pages >= self.max_pages() {
                warn!(%resource, pages = out.pages, "max_pages reached, walk incomplete");
                out.next_cursor = Some(skip);
                break;
            }
            out.pages += 1;
            match self.fetch_page(resource, filter, skip).await {
                Ok(page) => {
                    out.items.extend(page.items);
                    match page.next_cursor {
                        Some(next) => skip = next,
                        None => {
                            out.complete = out.failures.is_empty();
                            out.next_cursor = None;
                            break;
                        }
                    }
                }
                Err(e) if e.is_auth() => return Err(e),
                Err(e) => {
                    warn!(%resource, skip, error = %e, "page fetch failed, skipping it");
                    out.failures.push(PageFailure {
                        resource,
                        skip,
                        error: e.to_string(),
                    });
                    skip += u64::from(self.page_size());
                }
            }
        }
        Ok(out)
    }
}

// ---------------------------------------------------------------------------
// ChannelClient
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ChannelClient {
    pub base_url: String,
    api_key: String,
    api_secret: String,
    pub client: reqwest::Client,
    page_size: u32,
    max_pages: u32,
    pacer: Arc<Pacer>,
}

impl ChannelClient {
    pub fn new_with_url(base_url: &str, api_key: &str, api_secret: &str) -> Result<Self> {
        if api_key.is_empty() || api_secret.is_empty() {
            return Err(ChannelError::MissingCredentials);
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            api_secret: api_secret.to_string(),
            client: reqwest::Client::new(),
            page_size: MAX_PAGE_SIZE,
            max_pages: 100,
            pacer: Arc::new(Pacer::new(PacingPolicy::default())),
        })
    }

    /// Build from config, resolving credentials from the environment.
    pub fn from_config(cfg: &Config) -> Result<Self> {
        let (key, secret) = CredentialProvider::channel_credentials(&cfg.channel)
            .ok_or(ChannelError::MissingCredentials)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.channel.request_timeout_secs))
            .build()?;
        Ok(Self {
            client,
            page_size: cfg.channel.page_size.clamp(1, MAX_PAGE_SIZE),
            max_pages: cfg.channel.max_pages.max(1),
            pacer: Arc::new(Pacer::new(PacingPolicy::from_config(&cfg.pacing))),
            ..Self::new_with_url(&cfg.channel.base_url, &key, &secret)?
        })
    }

    pub fn with_pacer(mut self, pacer: Arc<Pacer>) -> Self {
        self.pacer = pacer;
        self
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    pub fn with_max_pages(mut self, max_pages: u32) -> Self {
        self.max_pages = max_pages.max(1);
        self
    }

    pub fn pacer(&self) -> &Arc<Pacer> {
        &self.pacer
    }

    // -- request helpers ----------------------------------------------------

    /// Paced GET with retries, returning the decoded JSON body.
    async fn api_get(
        &self,
        resource: Resource,
        path: &str,
        query: &[(&str, String)],
        lookup_id: Option<&str>,
    ) -> Result<Value> {
        let started = Instant::now();
        let result = self
            .pacer
            .run(resource.as_str(), || self.get_once(resource, path, query, lookup_id))
            .await;
        let outcome = match &result {
            Ok(_) => "ok",
            Err(e) => e.outcome(),
        };
        cs_telemetry::metrics::record_channel_request(
            resource.as_str(),
            outcome,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn get_once(
        &self,
        resource: Resource,
        path: &str,
        query: &[(&str, String)],
        lookup_id: Option<&str>,
    ) -> Result<Value> {
        let url = format!("{}{}", self.base_url, path);
        let resp = self
            .client
            .get(&url)
            .basic_auth(&self.api_key, Some(&self.api_secret))
            .query(query)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, body, retry_after, resource, lookup_id));
        }

        let text = resp.text().await.map_err(classify_transport)?;
        serde_json::from_str(&text).map_err(|e| ChannelError::Decode(format!("{url}: {e}")))
    }
}

fn classify_transport(e: reqwest::Error) -> ChannelError {
    if e.is_timeout() || e.is_connect() || e.is_request() || e.is_body() {
        ChannelError::Transient(e.to_string())
    } else {
        ChannelError::Http(e)
    }
}

fn classify_status(
    status: StatusCode,
    body: String,
    retry_after: Option<Duration>,
    resource: Resource,
    lookup_id: Option<&str>,
) -> ChannelError {
    let described = || {
        format!(
            "{} {}: {}",
            status.as_u16(),
            status.canonical_reason().unwrap_or(""),
            body
        )
    };
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChannelError::Auth(described()),
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited { retry_after },
        StatusCode::NOT_FOUND if lookup_id.is_some() => ChannelError::NotFound {
            resource: resource.as_str(),
            external_id: lookup_id.unwrap_or_default().to_string(),
        },
        s if s.is_server_error() => ChannelError::Transient(described()),
        s => ChannelError::Client {
            status: s.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl ChannelApi for ChannelClient {
    fn page_size(&self) -> u32 {
        self.page_size
    }

    fn max_pages(&self) -> u32 {
        self.max_pages
    }

    async fn fetch_page(
        &self,
        resource: Resource,
        filter: Option<&DateFilter>,
        skip: u64,
    ) -> Result<Page> {
        let limit = self.page_size;
        let mut query = vec![("skip", skip.to_string()), ("limit", limit.to_string())];
        if let Some(f) = filter {
            query.push(("from", f.from.format("%Y-%m-%d").to_string()));
            query.push(("to", f.to.format("%Y-%m-%d").to_string()));
            query.push(("dateType", f.date_type.as_str().to_string()));
        }

        let body = self.api_get(resource, resource.path(), &query, None).await?;
        let items = extract_items(body).ok_or_else(|| {
            ChannelError::Decode(format!("{}: response is not a record list", resource.path()))
        })?;
        let n = items.len() as u64;
        debug!(%resource, skip, count = n, "fetched page");
        Ok(Page {
            items,
            skip,
            next_cursor: (n >= u64::from(limit)).then_some(skip + n),
        })
    }

    async fn fetch_by_id(&self, resource: Resource, external_id: &str) -> Result<Value> {
        let path = format!("{}/{}", resource.path(), urlencoding::encode(external_id));
        self.api_get(resource, &path, &[], Some(external_id)).await
    }
}
