use crate::scheduler::CancelToken;
use crate::types::{BandRole, CatalogEntry, KanopiError, KanopiResult, RasterGrid};
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

/// External asset provider: fetches one band of a scene and decodes it into
/// an opaque 2-D numeric grid with extent/resolution metadata. Raster format
/// handling lives entirely behind this boundary.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch_band(&self, entry: &CatalogEntry, role: BandRole) -> KanopiResult<RasterGrid>;
}

/// Network behavior for band fetches
#[derive(Debug, Clone)]
pub struct FetchPolicy {
    /// Timeout for a single band download
    pub band_timeout: Duration,
}

impl Default for FetchPolicy {
    fn default() -> Self {
        Self {
            band_timeout: Duration::from_secs(120),
        }
    }
}

/// Fetch every required band of a scene, one at a time, with a cancellation
/// checkpoint and a progress report after each.
///
/// Refused with `band-mismatch` before any download when a required role has
/// no asset on the scene. A band download that exceeds the timeout fails the
/// whole fetch with `timeout`; there is no per-band retry.
pub async fn fetch_bands(
    fetcher: &dyn AssetFetcher,
    entry: &CatalogEntry,
    roles: &[BandRole],
    policy: &FetchPolicy,
    token: &CancelToken,
    progress: impl Fn(f64),
) -> KanopiResult<HashMap<BandRole, RasterGrid>> {
    // Every role must be resolvable before the first download starts
    for role in roles {
        if entry.band(*role).is_none() {
            return Err(KanopiError::BandMismatch(format!(
                "Scene '{}' has no asset for band '{}'",
                entry.scene_id, role
            )));
        }
    }

    let mut bands = HashMap::with_capacity(roles.len());
    for (index, role) in roles.iter().enumerate() {
        token.checkpoint()?;

        log::debug!("Fetching band '{}' of scene '{}'", role, entry.scene_id);
        let grid = match tokio::time::timeout(policy.band_timeout, fetcher.fetch_band(entry, *role))
            .await
        {
            Ok(result) => result?,
            Err(_) => {
                return Err(KanopiError::Timeout(format!(
                    "Band '{}' of scene '{}' exceeded {}s",
                    role,
                    entry.scene_id,
                    policy.band_timeout.as_secs()
                )))
            }
        };

        bands.insert(*role, grid);
        progress((index + 1) as f64 / roles.len() as f64);
    }

    log::info!(
        "Fetched {} bands for scene '{}'",
        bands.len(),
        entry.scene_id
    );
    Ok(bands)
}
