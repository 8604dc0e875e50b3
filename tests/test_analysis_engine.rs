use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use kanopi::core::qc_diff::{QcRecord, VectorFeature};
use kanopi::core::render::{RampKind, StretchParams};
use kanopi::engine::{AnalysisEngine, TaskOutput};
use kanopi::io::assets::{AssetFetcher, FetchPolicy};
use kanopi::io::catalog::{CatalogClient, CatalogPage, PagingPolicy};
use kanopi::scheduler::TaskTermination;
use kanopi::types::{
    AreaOfInterest, AssetHandle, BandRole, BoundingBox, CatalogEntry, DateRange, GridProfile,
    KanopiError, KanopiResult, RasterGrid, SearchFilters, NO_DATA,
};
use ndarray::Array2;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn profile() -> GridProfile {
    GridProfile {
        width: 2,
        height: 1,
        bounds: BoundingBox::new(500_000.0, 9_100_000.0, 500_020.0, 9_100_010.0),
        pixel_width: 10.0,
        pixel_height: 10.0,
        epsg: 32748,
    }
}

fn grid(values: Vec<f32>) -> RasterGrid {
    let len = values.len();
    RasterGrid::new(Array2::from_shape_vec((1, len), values).unwrap(), profile()).unwrap()
}

fn scene(scene_id: &str, roles: &[BandRole]) -> CatalogEntry {
    let mut bands = HashMap::new();
    for role in roles {
        bands.insert(*role, AssetHandle::new(format!("https://portal/{}.tif", role)));
    }
    CatalogEntry {
        scene_id: scene_id.to_string(),
        acquired: Utc.with_ymd_and_hms(2024, 6, 7, 2, 51, 31).unwrap(),
        cloud_cover: 8.0,
        footprint: BoundingBox::new(110.0, -8.0, 111.0, -7.0).to_polygon(),
        bands,
        visual: None,
        thumbnail: None,
    }
}

fn filters() -> SearchFilters {
    SearchFilters {
        date_range: DateRange::new(
            Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 6, 30, 23, 59, 59).unwrap(),
        )
        .unwrap(),
        cloud_cover_max: 20.0,
    }
}

/// Serves bands from an in-memory map
struct MapFetcher {
    grids: HashMap<BandRole, RasterGrid>,
    calls: AtomicUsize,
}

impl MapFetcher {
    fn new(grids: HashMap<BandRole, RasterGrid>) -> Self {
        Self {
            grids,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AssetFetcher for MapFetcher {
    async fn fetch_band(&self, _entry: &CatalogEntry, role: BandRole) -> KanopiResult<RasterGrid> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.grids
            .get(&role)
            .cloned()
            .ok_or_else(|| KanopiError::UpstreamError(format!("No asset for '{}'", role)))
    }
}

/// Never delivers a band; used for cancellation and timeout paths
struct StalledFetcher;

#[async_trait]
impl AssetFetcher for StalledFetcher {
    async fn fetch_band(&self, _entry: &CatalogEntry, _role: BandRole) -> KanopiResult<RasterGrid> {
        std::future::pending().await
    }
}

/// Catalog stub for engines that never search
struct EmptyCatalog;

#[async_trait]
impl CatalogClient for EmptyCatalog {
    async fn fetch_page(
        &self,
        _cursor: Option<&str>,
        _filters: &SearchFilters,
    ) -> KanopiResult<CatalogPage> {
        Ok(CatalogPage {
            entries: vec![],
            next_cursor: None,
        })
    }
}

fn ndvi_fetcher() -> MapFetcher {
    let mut grids = HashMap::new();
    grids.insert(BandRole::Nir, grid(vec![0.5, 0.0]));
    grids.insert(BandRole::Red, grid(vec![0.1, 0.0]));
    MapFetcher::new(grids)
}

#[tokio::test]
async fn test_ndvi_end_to_end() {
    init_logging();
    let engine = AnalysisEngine::new(Arc::new(EmptyCatalog), Arc::new(ndvi_fetcher()));
    let (tx, rx) = tokio::sync::oneshot::channel();
    let progress_log: Arc<Mutex<Vec<f64>>> = Arc::new(Mutex::new(Vec::new()));

    let id = engine.compute_index(
        kanopi::IndexSpec::ndvi(),
        scene("S2A_T49MCT", &[BandRole::Nir, BandRole::Red]),
    );
    let log = Arc::clone(&progress_log);
    engine.subscribe(
        id,
        move |fraction| log.lock().unwrap().push(fraction),
        move |termination| {
            let _ = tx.send(termination);
        },
    );

    let raster = match rx.await.unwrap() {
        TaskTermination::Succeeded(TaskOutput::Raster(raster)) => raster,
        other => panic!("Expected raster output, got {:?}", other.status()),
    };

    assert_eq!(raster.index_name, "NDVI");
    assert!((raster.data[[0, 0]] - 0.6667).abs() < 1e-4);
    // nir = red = 0 pixel carries the sentinel, not NaN or infinity
    assert_eq!(raster.data[[0, 1]], NO_DATA);
    assert_eq!(raster.style.ramp.kind, RampKind::Diverging);
    assert_eq!(raster.style.no_data, NO_DATA);

    let observed = progress_log.lock().unwrap().clone();
    assert_eq!(observed.last(), Some(&1.0));
    for pair in observed.windows(2) {
        assert!(pair[0] <= pair[1], "Progress regressed: {:?}", observed);
    }

    assert!(engine.acknowledge(id));
}

#[tokio::test]
async fn test_missing_asset_refused_before_any_fetch() {
    init_logging();
    let fetcher = Arc::new(ndvi_fetcher());
    let engine = AnalysisEngine::new(Arc::new(EmptyCatalog), Arc::clone(&fetcher) as Arc<dyn AssetFetcher>);
    let (tx, rx) = tokio::sync::oneshot::channel();

    // Scene exposes only the red band; NDVI needs nir as well
    let id = engine.compute_index(kanopi::IndexSpec::ndvi(), scene("S2A_NO_NIR", &[BandRole::Red]));
    engine.subscribe(id, |_| {}, move |t| {
        let _ = tx.send(t);
    });

    match rx.await.unwrap() {
        TaskTermination::Failed(error) => assert_eq!(error.kind(), "band-mismatch"),
        other => panic!("Expected band-mismatch, got {:?}", other.status()),
    }
    assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0, "No band may be fetched");
}

#[tokio::test]
async fn test_band_fetch_timeout_fails_the_task() {
    init_logging();
    let engine = AnalysisEngine::with_policies(
        Arc::new(EmptyCatalog),
        Arc::new(StalledFetcher),
        PagingPolicy::default(),
        FetchPolicy {
            band_timeout: Duration::from_millis(20),
        },
        StretchParams::default(),
    );
    let (tx, rx) = tokio::sync::oneshot::channel();

    let id = engine.compute_index(
        kanopi::IndexSpec::ndvi(),
        scene("S2A_SLOW", &[BandRole::Nir, BandRole::Red]),
    );
    engine.subscribe(id, |_| {}, move |t| {
        let _ = tx.send(t);
    });

    match rx.await.unwrap() {
        TaskTermination::Failed(error) => assert_eq!(error.kind(), "timeout"),
        other => panic!("Expected timeout, got {:?}", other.status()),
    }
}

#[tokio::test]
async fn test_cancel_during_band_fetch() {
    init_logging();
    let engine = AnalysisEngine::new(Arc::new(EmptyCatalog), Arc::new(StalledFetcher));
    let (tx, rx) = tokio::sync::oneshot::channel();

    let id = engine.compute_index(
        kanopi::IndexSpec::ndvi(),
        scene("S2A_STUCK", &[BandRole::Nir, BandRole::Red]),
    );
    engine.subscribe(id, |_| {}, move |t| {
        let _ = tx.send(t);
    });

    tokio::task::yield_now().await;
    assert!(engine.cancel(id));
    assert!(matches!(rx.await.unwrap(), TaskTermination::Cancelled));
}

#[tokio::test]
async fn test_qc_diff_flag_order_and_determinism() {
    init_logging();
    let engine = AnalysisEngine::new(Arc::new(EmptyCatalog), Arc::new(StalledFetcher));

    let features = vec![
        VectorFeature {
            feature_id: "101".to_string(),
            geometry: None,
            attributes: BTreeMap::new(),
        },
        VectorFeature {
            feature_id: "102".to_string(),
            // 24 x 25 m = 0.06 ha, below the minimum mapping unit
            geometry: Some(BoundingBox::new(0.0, 0.0, 24.0, 25.0).to_polygon()),
            attributes: BTreeMap::new(),
        },
    ];
    let records = vec![QcRecord {
        feature_id: "102".to_string(),
        flagged_fields: BTreeMap::new(),
        diagnostics: serde_json::json!({"kttj": "needs review"}),
    }];

    let mut runs = Vec::new();
    for _ in 0..2 {
        let (tx, rx) = tokio::sync::oneshot::channel();
        let id = engine.run_qc_diff("existing_2024", features.clone(), records.clone());
        engine.subscribe(id, |_| {}, move |t| {
            let _ = tx.send(t);
        });
        match rx.await.unwrap() {
            TaskTermination::Succeeded(TaskOutput::QcFlags(flags)) => runs.push(flags),
            other => panic!("Expected QC flags, got {:?}", other.status()),
        }
        engine.acknowledge(id);
    }

    let flags = &runs[0];
    assert_eq!(flags.len(), 3);
    // Lookup flags in feature order, then the undersized flag
    assert_eq!(flags[0].feature_id, "101");
    assert_eq!(flags[0].category(), "missing-qc");
    assert_eq!(flags[1].feature_id, "102");
    assert_eq!(flags[1].category(), "has-issues");
    assert_eq!(flags[2].feature_id, "102");
    assert_eq!(flags[2].category(), "undersized");

    // Same inputs, identical flag sequence
    assert_eq!(runs[0], runs[1]);
}

#[tokio::test]
async fn test_search_resource_key_includes_aoi() {
    init_logging();
    let engine = AnalysisEngine::new(Arc::new(EmptyCatalog), Arc::new(StalledFetcher));

    // Identical filters while the first search is still pending coalesce
    let first = engine.search_catalog(filters());
    let coalesced = engine.search_catalog(filters());
    assert_eq!(first, coalesced);

    // A different AOI is a different logical resource
    engine.set_aoi(AreaOfInterest::new(
        BoundingBox::new(110.2, -7.8, 110.5, -7.5).to_polygon(),
        4326,
    ));
    let with_aoi = engine.search_catalog(filters());
    assert_ne!(first, with_aoi);

    engine.clear_aoi();
    assert!(engine.active_aoi().is_none());
}

#[tokio::test]
async fn test_search_through_engine_succeeds() {
    init_logging();
    let engine = AnalysisEngine::new(Arc::new(EmptyCatalog), Arc::new(StalledFetcher));
    let (tx, rx) = tokio::sync::oneshot::channel();

    let id = engine.search_catalog(filters());
    engine.subscribe(id, |_| {}, move |t| {
        let _ = tx.send(t);
    });

    match rx.await.unwrap() {
        TaskTermination::Succeeded(TaskOutput::Search(outcome)) => {
            assert!(outcome.entries.is_empty());
            assert!(!outcome.is_partial());
        }
        other => panic!("Expected search outcome, got {:?}", other.status()),
    }
}
