use crate::core::catalog_filter::{apply_filters, dedupe_and_order};
use crate::scheduler::CancelToken;
use crate::types::{
    AreaOfInterest, AssetHandle, BandRole, BoundingBox, CatalogEntry, KanopiError, KanopiResult,
    SearchFilters,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;

/// One raw page from the upstream imagery catalog
#[derive(Debug, Clone)]
pub struct CatalogPage {
    pub entries: Vec<CatalogEntry>,
    pub next_cursor: Option<String>,
}

/// External catalog collaborator. The engine consumes raw pages and owns
/// filtering, deduplication, and ordering.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &SearchFilters,
    ) -> KanopiResult<CatalogPage>;
}

/// Result of a catalog search task.
///
/// A partial failure mid-pagination keeps the pages fetched so far and
/// records the upstream error instead of discarding everything; a failure
/// before any page arrived fails the task outright.
#[derive(Debug, Clone)]
pub struct SearchOutcome {
    pub entries: Vec<CatalogEntry>,
    pub upstream_failure: Option<KanopiError>,
}

impl SearchOutcome {
    pub fn is_partial(&self) -> bool {
        self.upstream_failure.is_some()
    }
}

/// Paging behavior for catalog searches
#[derive(Debug, Clone)]
pub struct PagingPolicy {
    /// Timeout for a single page fetch
    pub page_timeout: Duration,
    /// Delay before the single automatic retry of a transient failure
    pub retry_delay: Duration,
    /// Upper bound on pages walked per search
    pub max_pages: usize,
}

impl Default for PagingPolicy {
    fn default() -> Self {
        Self {
            page_timeout: Duration::from_secs(30),
            retry_delay: Duration::from_secs(2),
            max_pages: 64,
        }
    }
}

/// Walk the upstream catalog page by page, applying filters as pages arrive.
///
/// Transient network/timeout failures are retried once after a fixed delay,
/// then surface as the paging failure. The cancellation token is polled
/// after every page. Entries are deduplicated and ordered newest-first once
/// pagination ends.
pub async fn run_search(
    client: &dyn CatalogClient,
    filters: &SearchFilters,
    aoi: Option<&AreaOfInterest>,
    policy: &PagingPolicy,
    token: &CancelToken,
    progress: impl Fn(f64),
) -> KanopiResult<SearchOutcome> {
    log::info!(
        "Catalog search: {} to {}, cloud <= {:.1}%{}",
        filters.date_range.start,
        filters.date_range.end,
        filters.cloud_cover_max,
        if aoi.is_some() { ", AOI set" } else { "" }
    );

    let mut collected: Vec<CatalogEntry> = Vec::new();
    let mut cursor: Option<String> = None;
    let mut pages = 0usize;
    let mut upstream_failure: Option<KanopiError> = None;

    loop {
        token.checkpoint()?;

        let page = match fetch_page_once(client, cursor.as_deref(), filters, policy).await {
            Ok(page) => page,
            Err(error) if is_transient(&error) => {
                log::warn!("Page fetch failed ({}), retrying once: {}", error.kind(), error);
                tokio::time::sleep(policy.retry_delay).await;
                token.checkpoint()?;
                match fetch_page_once(client, cursor.as_deref(), filters, policy).await {
                    Ok(page) => page,
                    Err(second) => {
                        let failure = KanopiError::UpstreamError(format!(
                            "Catalog paging failed after retry: {}",
                            second
                        ));
                        if collected.is_empty() {
                            return Err(failure);
                        }
                        upstream_failure = Some(failure);
                        break;
                    }
                }
            }
            Err(KanopiError::Cancelled) => return Err(KanopiError::Cancelled),
            Err(error) => {
                if collected.is_empty() {
                    return Err(error);
                }
                upstream_failure = Some(error);
                break;
            }
        };

        pages += 1;
        let next_cursor = page.next_cursor.clone();
        let kept = apply_filters(page.entries, filters, aoi);
        collected.extend(kept);

        // Page count is unknown upstream; approach 0.95 asymptotically
        progress(0.95 * pages as f64 / (pages as f64 + 1.0));

        cursor = match next_cursor {
            Some(next) => Some(next),
            None => break,
        };
        if pages >= policy.max_pages {
            log::warn!("Stopping search after page bound ({})", policy.max_pages);
            break;
        }
    }

    token.checkpoint()?;
    let entries = dedupe_and_order(collected);
    log::info!(
        "Catalog search done: {} entries over {} pages{}",
        entries.len(),
        pages,
        if upstream_failure.is_some() {
            " (partial)"
        } else {
            ""
        }
    );
    Ok(SearchOutcome {
        entries,
        upstream_failure,
    })
}

async fn fetch_page_once(
    client: &dyn CatalogClient,
    cursor: Option<&str>,
    filters: &SearchFilters,
    policy: &PagingPolicy,
) -> KanopiResult<CatalogPage> {
    match tokio::time::timeout(policy.page_timeout, client.fetch_page(cursor, filters)).await {
        Ok(result) => result,
        Err(_) => Err(KanopiError::Timeout(format!(
            "Catalog page fetch exceeded {}s",
            policy.page_timeout.as_secs()
        ))),
    }
}

fn is_transient(error: &KanopiError) -> bool {
    matches!(
        error,
        KanopiError::NetworkError(_) | KanopiError::Timeout(_)
    )
}

/// HTTP client against the GeoPortal-style imagery catalog API.
///
/// Credentials arrive already resolved from the session collaborator; this
/// client never reads configuration itself.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    base_url: String,
    auth_token: String,
}

impl HttpCatalogClient {
    pub fn new(base_url: impl Into<String>, auth_token: impl Into<String>) -> KanopiResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent("kanopi/0.2 (Spectral Analysis Engine)")
            .build()
            .map_err(|e| KanopiError::NetworkError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            auth_token: auth_token.into(),
        })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn fetch_page(
        &self,
        cursor: Option<&str>,
        filters: &SearchFilters,
    ) -> KanopiResult<CatalogPage> {
        let url = format!("{}/imagery/search", self.base_url);
        let mut query: Vec<(&str, String)> = vec![
            ("start", filters.date_range.start.to_rfc3339()),
            ("end", filters.date_range.end.to_rfc3339()),
            ("cloud_max", format!("{:.2}", filters.cloud_cover_max)),
        ];
        if let Some(cursor) = cursor {
            query.push(("page", cursor.to_string()));
        }

        log::debug!("Fetching catalog page from {} (cursor {:?})", url, cursor);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.auth_token)
            .query(&query)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        if !response.status().is_success() {
            return Err(KanopiError::UpstreamError(format!(
                "Catalog returned HTTP {}",
                response.status().as_u16()
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| KanopiError::UpstreamError(format!("Malformed catalog response: {}", e)))?;

        parse_page(&body)
    }
}

fn map_reqwest_error(error: reqwest::Error) -> KanopiError {
    if error.is_timeout() {
        KanopiError::Timeout(format!("Catalog request timed out: {}", error))
    } else {
        KanopiError::NetworkError(format!("Catalog request failed: {}", error))
    }
}

fn parse_page(body: &Value) -> KanopiResult<CatalogPage> {
    let features = body
        .get("features")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            KanopiError::UpstreamError("Catalog response is missing 'features'".to_string())
        })?;

    let mut entries = Vec::with_capacity(features.len());
    for feature in features {
        match parse_entry(feature) {
            Some(entry) => entries.push(entry),
            None => log::warn!("Skipping malformed catalog feature: {}", feature),
        }
    }

    let next_cursor = body
        .get("next")
        .and_then(Value::as_str)
        .map(|s| s.to_string());

    Ok(CatalogPage {
        entries,
        next_cursor,
    })
}

/// Map one catalog feature onto a `CatalogEntry`. Properties follow the
/// GeoPortal schema: `stac_id`, `tanggal` (RFC 3339 acquisition date),
/// `cloud`, per-band `asset_*` links, `visual`, `thumb`, and a `bbox`
/// footprint.
fn parse_entry(feature: &Value) -> Option<CatalogEntry> {
    let properties = feature.get("properties").unwrap_or(feature);

    let scene_id = properties.get("stac_id")?.as_str()?.to_string();
    let acquired = parse_acquired(properties.get("tanggal")?.as_str()?)?;
    let cloud_cover = properties.get("cloud").and_then(Value::as_f64).unwrap_or(0.0) as f32;

    let bbox = feature.get("bbox").and_then(Value::as_array)?;
    if bbox.len() != 4 {
        return None;
    }
    let footprint = BoundingBox::new(
        bbox[0].as_f64()?,
        bbox[1].as_f64()?,
        bbox[2].as_f64()?,
        bbox[3].as_f64()?,
    )
    .to_polygon();

    let mut bands = HashMap::new();
    for (key, role) in [
        ("asset_blue", BandRole::Blue),
        ("asset_green", BandRole::Green),
        ("asset_red", BandRole::Red),
        ("asset_nir", BandRole::Nir),
        ("asset_swir", BandRole::Swir),
    ] {
        if let Some(url) = properties.get(key).and_then(Value::as_str) {
            bands.insert(role, AssetHandle::new(url));
        }
    }

    let visual = properties
        .get("visual")
        .and_then(Value::as_str)
        .map(AssetHandle::new);
    let thumbnail = properties
        .get("thumb")
        .and_then(Value::as_str)
        .map(AssetHandle::new);

    Some(CatalogEntry {
        scene_id,
        acquired,
        cloud_cover,
        footprint,
        bands,
        visual,
        thumbnail,
    })
}

fn parse_acquired(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
