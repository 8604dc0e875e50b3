//! Thin coordinator composing the task scheduler with the analysis engines
//! and the external collaborators.

use crate::core::band_math::{AnalysisRaster, BandMathEngine, IndexSpec};
use crate::core::qc_diff::{self, HighlightFlag, QcRecord, VectorFeature};
use crate::core::render::StretchParams;
use crate::io::assets::{fetch_bands, AssetFetcher, FetchPolicy};
use crate::io::catalog::{run_search, CatalogClient, PagingPolicy, SearchOutcome};
use crate::scheduler::{TaskId, TaskKind, TaskScheduler, TaskTermination};
use crate::types::{AreaOfInterest, BandRole, CatalogEntry, SearchFilters};
use std::sync::Arc;

/// Output of any engine task, delivered through the done callback
#[derive(Debug, Clone)]
pub enum TaskOutput {
    Search(SearchOutcome),
    Raster(AnalysisRaster),
    QcFlags(Vec<HighlightFlag>),
}

/// Terminal notification for engine tasks
pub type EngineTermination = TaskTermination<TaskOutput>;

/// Composition root of the analysis engine.
///
/// Owns the scheduler and the collaborator handles; every operation submits
/// a unit of background work and returns its task id. Presentation attaches
/// subscribers through `subscribe` and never blocks on a task.
pub struct AnalysisEngine {
    scheduler: TaskScheduler<TaskOutput>,
    catalog: Arc<dyn CatalogClient>,
    assets: Arc<dyn AssetFetcher>,
    paging: PagingPolicy,
    fetch: FetchPolicy,
    stretch: StretchParams,
}

impl AnalysisEngine {
    /// Create an engine on the current tokio runtime with default policies.
    pub fn new(catalog: Arc<dyn CatalogClient>, assets: Arc<dyn AssetFetcher>) -> Self {
        Self::with_policies(
            catalog,
            assets,
            PagingPolicy::default(),
            FetchPolicy::default(),
            StretchParams::default(),
        )
    }

    pub fn with_policies(
        catalog: Arc<dyn CatalogClient>,
        assets: Arc<dyn AssetFetcher>,
        paging: PagingPolicy,
        fetch: FetchPolicy,
        stretch: StretchParams,
    ) -> Self {
        Self {
            scheduler: TaskScheduler::new(),
            catalog,
            assets,
            paging,
            fetch,
            stretch,
        }
    }

    pub fn scheduler(&self) -> &TaskScheduler<TaskOutput> {
        &self.scheduler
    }

    /// Replace the session's active area of interest. The previous AOI, if
    /// any, is discarded.
    pub fn set_aoi(&self, aoi: AreaOfInterest) {
        self.scheduler.set_active_aoi(Some(aoi));
    }

    pub fn clear_aoi(&self) {
        self.scheduler.set_active_aoi(None);
    }

    pub fn active_aoi(&self) -> Option<AreaOfInterest> {
        self.scheduler.active_aoi()
    }

    /// Submit a catalog search with the given filters and the session's
    /// active AOI. Identical in-flight searches coalesce onto one task.
    pub fn search_catalog(&self, filters: SearchFilters) -> TaskId {
        let aoi = self.scheduler.active_aoi();
        let key = match &aoi {
            Some(aoi) => format!(
                "catalog-search:{}:aoi{:016x}",
                filters.resource_key(),
                aoi.fingerprint()
            ),
            None => format!("catalog-search:{}", filters.resource_key()),
        };

        let client = Arc::clone(&self.catalog);
        let policy = self.paging.clone();
        self.scheduler
            .submit(TaskKind::CatalogSearch, &key, move |ctx| async move {
                let outcome = run_search(
                    client.as_ref(),
                    &filters,
                    aoi.as_ref(),
                    &policy,
                    &ctx.token,
                    |fraction| ctx.report_progress(fraction),
                )
                .await?;
                Ok(TaskOutput::Search(outcome))
            })
    }

    /// Submit a band-math computation for one scene: fetch the required
    /// bands, then evaluate the index. Coalesced per scene and index name.
    pub fn compute_index(&self, spec: IndexSpec, entry: CatalogEntry) -> TaskId {
        let key = format!("band-math:{}:{}", entry.scene_id, spec.name);
        let fetcher = Arc::clone(&self.assets);
        let policy = self.fetch.clone();
        let stretch = self.stretch;

        self.scheduler
            .submit(TaskKind::BandMath, &key, move |ctx| async move {
                // Fetch phase carries progress to 0.7, compute to 0.95
                let roles: Vec<BandRole> = spec.required_roles().to_vec();
                let bands = fetch_bands(
                    fetcher.as_ref(),
                    &entry,
                    &roles,
                    &policy,
                    &ctx.token,
                    |fraction| ctx.report_progress(0.7 * fraction),
                )
                .await?;

                ctx.token.checkpoint()?;
                let raster = BandMathEngine::with_stretch(stretch).compute(&spec, &bands)?;
                ctx.report_progress(0.95);
                Ok(TaskOutput::Raster(raster))
            })
    }

    /// Submit a QC comparison of a layer's features against its parallel
    /// record set. Lookup flags come first, undersized flags after.
    pub fn run_qc_diff(
        &self,
        layer_label: &str,
        features: Vec<VectorFeature>,
        records: Vec<QcRecord>,
    ) -> TaskId {
        let key = format!("qc-diff:{}", layer_label);
        self.scheduler
            .submit(TaskKind::QcDiff, &key, move |ctx| async move {
                ctx.token.checkpoint()?;
                let mut flags = qc_diff::diff(&features, &records);
                ctx.report_progress(0.6);

                ctx.token.checkpoint()?;
                flags.extend(qc_diff::minimum_area_flags(&features));
                ctx.report_progress(0.95);
                Ok(TaskOutput::QcFlags(flags))
            })
    }

    /// Attach progress and completion subscribers to a task.
    pub fn subscribe<P, D>(&self, id: TaskId, on_progress: P, on_done: D) -> bool
    where
        P: Fn(f64) + Send + Sync + 'static,
        D: FnOnce(EngineTermination) + Send + 'static,
    {
        self.scheduler.subscribe(id, on_progress, on_done)
    }

    /// Request cooperative cancellation of a task.
    pub fn cancel(&self, id: TaskId) -> bool {
        self.scheduler.cancel(id)
    }

    /// Destroy a work item after its terminal state has been consumed.
    pub fn acknowledge(&self, id: TaskId) -> bool {
        self.scheduler.acknowledge(id)
    }
}
