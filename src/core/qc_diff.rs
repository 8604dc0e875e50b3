use geo::{Area, Polygon};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};

/// Minimum mapping unit for polygon features, in hectares. Features at or
/// above the threshold pass; smaller ones are flagged `undersized`.
pub const MIN_MAPPING_AREA_HA: f64 = 0.0625;

/// Kind of vector layer the QC workflow operates on. One record of naming
/// rules per kind; no free-form layer-type strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LayerKind {
    /// Established canopy cover, maintained with a parallel QC record set
    Existing,
    /// Candidate rehabilitation areas
    Potensi,
}

impl LayerKind {
    pub fn label(&self) -> &'static str {
        match self {
            LayerKind::Existing => "existing",
            LayerKind::Potensi => "potensi",
        }
    }

    /// Backing table for the feature data of a given survey year,
    /// e.g. `existing_2024`.
    pub fn data_table(&self, year: i32) -> String {
        format!("{}_{}", self.label(), year)
    }

    /// Backing table for the parallel QC record set, e.g. `existing_2024_qc`.
    /// Only the existing layer carries QC records.
    pub fn qc_table(&self, year: i32) -> Option<String> {
        match self {
            LayerKind::Existing => Some(format!("{}_{}_qc", self.label(), year)),
            LayerKind::Potensi => None,
        }
    }
}

impl std::fmt::Display for LayerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// One feature of a loaded vector layer, as handed over by the host
/// application's data provider.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorFeature {
    pub feature_id: String,
    pub geometry: Option<Polygon<f64>>,
    pub attributes: BTreeMap<String, String>,
}

/// One quality-control entry, associated by feature id with a feature from
/// the corresponding data layer. A lookup relation, not ownership.
#[derive(Debug, Clone, PartialEq)]
pub struct QcRecord {
    pub feature_id: String,
    /// Field name mapped to its flagged value or status
    pub flagged_fields: BTreeMap<String, String>,
    /// Free-form diagnostic payload, treated as opaque structured data
    pub diagnostics: Value,
}

/// Why a feature was flagged
#[derive(Debug, Clone, PartialEq)]
pub enum FlagKind {
    /// No QC record matches the feature id
    MissingQc,
    /// The QC record carries a non-empty diagnostic payload (verbatim;
    /// interpretation is a presentation concern)
    HasIssues { diagnostics: Value },
    /// Polygon area below the minimum mapping unit
    Undersized { area_ha: f64 },
}

/// A derived highlight for one feature. Never written back into the QC
/// record or the source feature.
#[derive(Debug, Clone, PartialEq)]
pub struct HighlightFlag {
    pub feature_id: String,
    pub kind: FlagKind,
}

impl HighlightFlag {
    /// Stable category identifier for presentation and logging
    pub fn category(&self) -> &'static str {
        match self.kind {
            FlagKind::MissingQc => "missing-qc",
            FlagKind::HasIssues { .. } => "has-issues",
            FlagKind::Undersized { .. } => "undersized",
        }
    }
}

/// Fill and outline recipe the presentation layer applies to a flagged
/// feature
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HighlightStyle {
    pub fill_rgba: [u8; 4],
    pub outline_rgb: [u8; 3],
}

/// Styling recipe per flag category
pub fn highlight_style(flag: &HighlightFlag) -> HighlightStyle {
    match flag.kind {
        FlagKind::MissingQc => HighlightStyle {
            fill_rgba: [255, 235, 175, 160],
            outline_rgb: [230, 150, 0],
        },
        FlagKind::HasIssues { .. } => HighlightStyle {
            fill_rgba: [255, 200, 200, 160],
            outline_rgb: [200, 0, 0],
        },
        FlagKind::Undersized { .. } => HighlightStyle {
            fill_rgba: [255, 255, 180, 160],
            outline_rgb: [180, 120, 0],
        },
    }
}

/// A diagnostic payload counts as empty when it is null, an empty string,
/// an empty array, or an empty object.
fn diagnostics_empty(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Compare a layer's features against its parallel QC record set.
///
/// Pure function of its two inputs: same inputs always yield the same flag
/// sequence, in input feature order. Features with a matching record and
/// empty diagnostics are not flagged.
pub fn diff(features: &[VectorFeature], records: &[QcRecord]) -> Vec<HighlightFlag> {
    let mut by_id: HashMap<&str, &QcRecord> = HashMap::new();
    for record in records {
        if by_id.insert(record.feature_id.as_str(), record).is_some() {
            log::warn!(
                "Duplicate QC record for feature '{}'; keeping the later one",
                record.feature_id
            );
        }
    }

    let mut flags = Vec::new();
    for feature in features {
        match by_id.get(feature.feature_id.as_str()) {
            None => flags.push(HighlightFlag {
                feature_id: feature.feature_id.clone(),
                kind: FlagKind::MissingQc,
            }),
            Some(record) if !diagnostics_empty(&record.diagnostics) => {
                flags.push(HighlightFlag {
                    feature_id: feature.feature_id.clone(),
                    kind: FlagKind::HasIssues {
                        diagnostics: record.diagnostics.clone(),
                    },
                });
            }
            Some(_) => {}
        }
    }

    log::info!(
        "QC diff: {} features, {} records, {} flagged",
        features.len(),
        records.len(),
        flags.len()
    );
    flags
}

/// Minimum-area pre-filter, available to callers independently of `diff`.
///
/// Flags polygon features whose planar area falls below the minimum mapping
/// unit (boundary inclusive: exactly 0.0625 ha passes). Coordinates are
/// assumed to be in a projected, metre-based CRS. Features without geometry
/// are skipped.
pub fn minimum_area_flags(features: &[VectorFeature]) -> Vec<HighlightFlag> {
    let mut flags = Vec::new();
    for feature in features {
        let polygon: &Polygon<f64> = match &feature.geometry {
            Some(geom) => geom,
            None => continue,
        };
        let area_ha = polygon.unsigned_area() / 10_000.0;
        if area_ha < MIN_MAPPING_AREA_HA {
            log::debug!(
                "Feature '{}' below minimum mapping unit: {:.4} ha",
                feature.feature_id,
                area_ha
            );
            flags.push(HighlightFlag {
                feature_id: feature.feature_id.clone(),
                kind: FlagKind::Undersized { area_ha },
            });
        }
    }
    flags
}
