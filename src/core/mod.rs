//! Core analysis engines: band math, catalog filtering, QC diff, rendering

pub mod band_math;
pub mod catalog_filter;
pub mod qc_diff;
pub mod render;

// Re-export main types
pub use band_math::{AnalysisRaster, BandMathEngine, IndexSpec};
pub use catalog_filter::{apply_filters, dedupe_and_order, strictly_intersects};
pub use qc_diff::{
    diff, highlight_style, minimum_area_flags, FlagKind, HighlightFlag, HighlightStyle, LayerKind,
    QcRecord, VectorFeature, MIN_MAPPING_AREA_HA,
};
pub use render::{ColorRamp, RampKind, RenderStyle, StretchParams, StretchRange};
