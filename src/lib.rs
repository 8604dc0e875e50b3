//! Kanopi: A Fast, Modular Spectral-Analysis and Background-Processing
//! Engine for Forestry Imagery
//!
//! This library runs the heavy lifting of a forestry land-management mapping
//! tool off the interactive thread: imagery catalog searches, spectral-index
//! band math over fetched raster bands, and quality-control comparisons of
//! vector layers, all as cancellable background tasks with progress
//! reporting. It never renders, persists results, or touches configuration
//! itself; those concerns belong to the host application.

pub mod core;
pub mod engine;
pub mod io;
pub mod scheduler;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    AreaOfInterest, AssetHandle, BandRole, BoundingBox, CatalogEntry, DateRange, GridProfile,
    KanopiError, KanopiResult, PixelBuffer, RasterGrid, SearchFilters, NO_DATA,
};

pub use crate::core::{
    AnalysisRaster, BandMathEngine, ColorRamp, HighlightFlag, IndexSpec, LayerKind, QcRecord,
    RenderStyle, StretchParams, VectorFeature,
};

pub use engine::{AnalysisEngine, EngineTermination, TaskOutput};
pub use io::{AssetFetcher, CatalogClient, HttpCatalogClient, SearchOutcome};
pub use scheduler::{CancelToken, TaskId, TaskKind, TaskScheduler, TaskStatus, TaskTermination};
