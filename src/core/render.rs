use crate::types::{PixelBuffer, PixelValue};
use serde::{Deserialize, Serialize};

/// Percentile clip bounds for automatic stretch computation
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StretchParams {
    /// Lower percentile clip
    pub lower_pct: f32,
    /// Upper percentile clip
    pub upper_pct: f32,
}

impl Default for StretchParams {
    fn default() -> Self {
        Self {
            lower_pct: 2.0,
            upper_pct: 98.0,
        }
    }
}

/// Resolved min/max stretch applied when rendering a derived raster
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StretchRange {
    pub min: f32,
    pub max: f32,
}

/// Ramp family: diverging for normalized-difference indices, sequential for
/// single-direction ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RampKind {
    Diverging,
    Sequential,
}

/// One classification break in a color ramp
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RampStop {
    /// Upper value of the class
    pub value: f32,
    pub color: [u8; 3],
    pub label: String,
}

impl RampStop {
    fn new(value: f32, color: [u8; 3], label: &str) -> Self {
        Self {
            value,
            color,
            label: label.to_string(),
        }
    }
}

/// Named color ramp with optional classification breaks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorRamp {
    pub name: String,
    pub kind: RampKind,
    pub stops: Vec<RampStop>,
}

impl ColorRamp {
    pub fn diverging(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RampKind::Diverging,
            stops: Vec::new(),
        }
    }

    pub fn sequential(name: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: RampKind::Sequential,
            stops: Vec::new(),
        }
    }

    /// Default NDVI classification: water/non-vegetation below zero, then
    /// sparse, medium, and dense canopy classes.
    pub fn ndvi_classification() -> Self {
        Self {
            name: "RdYlGn".to_string(),
            kind: RampKind::Diverging,
            stops: vec![
                RampStop::new(0.0, [0, 0, 255], "Water/Non-Vegetation"),
                RampStop::new(0.2, [255, 255, 0], "Jarang (Sparse)"),
                RampStop::new(0.5, [0, 255, 0], "Sedang (Medium)"),
                RampStop::new(1.0, [0, 100, 0], "Rapat (Dense)"),
            ],
        }
    }
}

/// Rendering recipe handed to the presentation layer together with the
/// derived raster. The engine never renders anything itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderStyle {
    pub ramp: ColorRamp,
    pub stretch: StretchRange,
    pub no_data: f32,
}

/// Compute a percentile stretch over the valid pixels of a buffer.
///
/// Pixels equal to `no_data` are excluded. Returns `None` when no valid pixel
/// remains (the caller falls back to the index's valid range).
pub fn percentile_stretch(
    data: &PixelBuffer,
    params: StretchParams,
    no_data: PixelValue,
) -> Option<StretchRange> {
    let mut valid: Vec<f32> = data.iter().copied().filter(|v| *v != no_data).collect();
    if valid.is_empty() {
        log::warn!("Stretch requested on a raster with no valid pixels");
        return None;
    }
    valid.sort_by(f32::total_cmp);

    let rank = |pct: f32| -> f32 {
        let pos = (valid.len() - 1) as f32 * (pct / 100.0).clamp(0.0, 1.0);
        valid[pos.round() as usize]
    };

    let min = rank(params.lower_pct);
    let max = rank(params.upper_pct);
    log::debug!(
        "Percentile stretch [{:.1}%, {:.1}%] over {} valid pixels: [{:.4}, {:.4}]",
        params.lower_pct,
        params.upper_pct,
        valid.len(),
        min,
        max
    );
    Some(StretchRange { min, max })
}
