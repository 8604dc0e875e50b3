use chrono::{DateTime, Utc};
use geo::{Coord, LineString, Polygon};
use ndarray::Array2;
use num_traits::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// Real-valued raster pixel data
pub type PixelValue = f32;

/// 2D raster pixel array (row x column)
pub type PixelBuffer = Array2<PixelValue>;

/// Sentinel written into derived rasters where a pixel has no defined value
/// (zero denominator, non-finite result, value outside the index range).
/// Excluded from stretch statistics.
pub const NO_DATA: PixelValue = -9999.0;

/// Spectral band roles exposed by the imagery catalog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandRole {
    Blue,
    Green,
    Red,
    Nir,
    Swir,
}

impl BandRole {
    /// All roles a formula identifier may resolve to
    pub const ALL: [BandRole; 5] = [
        BandRole::Blue,
        BandRole::Green,
        BandRole::Red,
        BandRole::Nir,
        BandRole::Swir,
    ];

    /// Lower-case name used in formulas and asset keys
    pub fn name(&self) -> &'static str {
        match self {
            BandRole::Blue => "blue",
            BandRole::Green => "green",
            BandRole::Red => "red",
            BandRole::Nir => "nir",
            BandRole::Swir => "swir",
        }
    }

    pub fn from_name(name: &str) -> Option<BandRole> {
        match name.to_lowercase().as_str() {
            "blue" => Some(BandRole::Blue),
            "green" => Some(BandRole::Green),
            "red" => Some(BandRole::Red),
            "nir" => Some(BandRole::Nir),
            "swir" => Some(BandRole::Swir),
            _ => None,
        }
    }
}

impl std::fmt::Display for BandRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Geospatial bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Closed rectangle polygon for intersection tests
    pub fn to_polygon(&self) -> Polygon<f64> {
        Polygon::new(
            LineString::from(vec![
                Coord {
                    x: self.min_x,
                    y: self.min_y,
                },
                Coord {
                    x: self.max_x,
                    y: self.min_y,
                },
                Coord {
                    x: self.max_x,
                    y: self.max_y,
                },
                Coord {
                    x: self.min_x,
                    y: self.max_y,
                },
                Coord {
                    x: self.min_x,
                    y: self.min_y,
                },
            ]),
            vec![],
        )
    }

    fn approx_eq(&self, other: &BoundingBox, eps: f64) -> bool {
        (self.min_x - other.min_x).abs() <= eps
            && (self.min_y - other.min_y).abs() <= eps
            && (self.max_x - other.max_x).abs() <= eps
            && (self.max_y - other.max_y).abs() <= eps
    }
}

/// Spatial layout of a raster band: dimensions, extent, resolution, CRS
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GridProfile {
    pub width: usize,
    pub height: usize,
    pub bounds: BoundingBox,
    pub pixel_width: f64,
    pub pixel_height: f64,
    pub epsg: u32,
}

impl GridProfile {
    /// Whether two bands share the same pixel grid: identical dimensions,
    /// identical CRS, extent and resolution equal within a small tolerance.
    pub fn matches(&self, other: &GridProfile) -> bool {
        let eps = 1e-6;
        self.width == other.width
            && self.height == other.height
            && self.epsg == other.epsg
            && self.bounds.approx_eq(&other.bounds, eps)
            && (self.pixel_width - other.pixel_width).abs() <= eps
            && (self.pixel_height - other.pixel_height).abs() <= eps
    }
}

/// A fetched raster band: pixel buffer plus its spatial profile.
///
/// The engine treats the buffer as an opaque 2-D numeric grid; decoding from
/// whatever on-the-wire format the asset provider uses happens behind the
/// `AssetFetcher` boundary.
#[derive(Debug, Clone)]
pub struct RasterGrid {
    pub data: PixelBuffer,
    pub profile: GridProfile,
}

impl RasterGrid {
    /// Build a grid from an f32 buffer, enforcing shape consistency.
    pub fn new(data: PixelBuffer, profile: GridProfile) -> KanopiResult<Self> {
        let (rows, cols) = data.dim();
        if rows != profile.height || cols != profile.width {
            return Err(KanopiError::InvalidInput(format!(
                "Buffer shape {}x{} does not match profile {}x{}",
                rows, cols, profile.height, profile.width
            )));
        }
        Ok(Self { data, profile })
    }

    /// Build a grid from a row-major scalar buffer of any integer or float
    /// encoding. All computation downstream is floating point.
    pub fn from_scalars<T>(values: &[T], profile: GridProfile) -> KanopiResult<Self>
    where
        T: ToPrimitive + Copy,
    {
        if values.len() != profile.width * profile.height {
            return Err(KanopiError::InvalidInput(format!(
                "Buffer length {} does not match profile {}x{}",
                values.len(),
                profile.height,
                profile.width
            )));
        }
        let floats: Vec<f32> = values
            .iter()
            .map(|v| v.to_f32().unwrap_or(NO_DATA))
            .collect();
        let data = Array2::from_shape_vec((profile.height, profile.width), floats)
            .map_err(|e| KanopiError::InvalidInput(format!("Failed to shape buffer: {}", e)))?;
        Ok(Self { data, profile })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }
}

/// Fetch handle for a single catalog asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssetHandle {
    pub url: String,
}

impl AssetHandle {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

/// One satellite scene from the imagery catalog.
///
/// Immutable once retrieved; a query result is an ordered sequence of these,
/// newest first, and lives only for the search session.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub scene_id: String,
    pub acquired: DateTime<Utc>,
    pub cloud_cover: f32,
    pub footprint: Polygon<f64>,
    pub bands: HashMap<BandRole, AssetHandle>,
    pub visual: Option<AssetHandle>,
    pub thumbnail: Option<AssetHandle>,
}

impl CatalogEntry {
    pub fn band(&self, role: BandRole) -> Option<&AssetHandle> {
        self.bands.get(&role)
    }
}

/// A user-drawn polygon narrowing catalog queries to intersecting footprints.
/// At most one is active per session; replacing it discards the previous one.
#[derive(Debug, Clone)]
pub struct AreaOfInterest {
    pub polygon: Polygon<f64>,
    pub epsg: u32,
}

impl AreaOfInterest {
    pub fn new(polygon: Polygon<f64>, epsg: u32) -> Self {
        Self { polygon, epsg }
    }

    /// Stable fingerprint used in task resource keys so identical AOIs
    /// coalesce onto the same in-flight search.
    pub fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.epsg.hash(&mut hasher);
        for coord in self.polygon.exterior().coords() {
            coord.x.to_bits().hash(&mut hasher);
            coord.y.to_bits().hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Inclusive acquisition-date range
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl DateRange {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> KanopiResult<Self> {
        if end < start {
            return Err(KanopiError::InvalidInput(format!(
                "Date range end {} precedes start {}",
                end, start
            )));
        }
        Ok(Self { start, end })
    }

    /// Inclusive on both ends
    pub fn contains(&self, when: DateTime<Utc>) -> bool {
        when >= self.start && when <= self.end
    }
}

/// Attribute filters for a catalog search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    pub date_range: DateRange,
    pub cloud_cover_max: f32,
}

impl SearchFilters {
    /// Stable key fragment for the in-flight registry: two searches with the
    /// same filters (and AOI) share one underlying task.
    pub fn resource_key(&self) -> String {
        format!(
            "{}..{}@cc{:.2}",
            self.date_range.start.timestamp(),
            self.date_range.end.timestamp(),
            self.cloud_cover_max
        )
    }
}

/// Error taxonomy for the analysis engine.
///
/// Every terminal failure carries a machine-readable kind (`kind()`) and a
/// human-readable message. Cancellation is reported as a distinct terminal
/// task state, never through the failure channel.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KanopiError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Cancelled")]
    Cancelled,

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Upstream error: {0}")]
    UpstreamError(String),

    #[error("Band mismatch: {0}")]
    BandMismatch(String),

    #[error("Invalid formula: {0}")]
    InvalidFormula(String),
}

impl KanopiError {
    /// Stable kind identifier for presentation and logging
    pub fn kind(&self) -> &'static str {
        match self {
            KanopiError::NetworkError(_) => "network-error",
            KanopiError::Timeout(_) => "timeout",
            KanopiError::Cancelled => "cancelled",
            KanopiError::InvalidInput(_) => "invalid-input",
            KanopiError::UpstreamError(_) => "upstream-error",
            KanopiError::BandMismatch(_) => "band-mismatch",
            KanopiError::InvalidFormula(_) => "invalid-formula",
        }
    }
}

/// Result type for engine operations
pub type KanopiResult<T> = Result<T, KanopiError>;
