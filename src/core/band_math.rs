use crate::core::render::{
    percentile_stretch, ColorRamp, RenderStyle, StretchParams, StretchRange,
};
use crate::types::{
    BandRole, GridProfile, KanopiError, KanopiResult, PixelBuffer, RasterGrid, NO_DATA,
};
use ndarray::{Array2, Zip};
use regex::Regex;
use std::collections::HashMap;

/// Parsed arithmetic expression over band roles
#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Num(f32),
    Band(BandRole),
    Neg(Box<Expr>),
    Add(Box<Expr>, Box<Expr>),
    Sub(Box<Expr>, Box<Expr>),
    Mul(Box<Expr>, Box<Expr>),
    Div(Box<Expr>, Box<Expr>),
}

impl Expr {
    fn collect_bands(&self, out: &mut Vec<BandRole>) {
        match self {
            Expr::Num(_) => {}
            Expr::Band(role) => {
                if !out.contains(role) {
                    out.push(*role);
                }
            }
            Expr::Neg(inner) => inner.collect_bands(out),
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) | Expr::Div(l, r) => {
                l.collect_bands(out);
                r.collect_bands(out);
            }
        }
    }

    /// Constant-fold a band-free subtree. `None` when the value depends on
    /// pixel data.
    fn const_fold(&self) -> Option<f32> {
        match self {
            Expr::Num(v) => Some(*v),
            Expr::Band(_) => None,
            Expr::Neg(inner) => inner.const_fold().map(|v| -v),
            Expr::Add(l, r) => Some(l.const_fold()? + r.const_fold()?),
            Expr::Sub(l, r) => Some(l.const_fold()? - r.const_fold()?),
            Expr::Mul(l, r) => Some(l.const_fold()? * r.const_fold()?),
            Expr::Div(l, r) => {
                let denom = r.const_fold()?;
                if denom == 0.0 {
                    None
                } else {
                    Some(l.const_fold()? / denom)
                }
            }
        }
    }

    /// Reject divisions whose denominator is structurally always zero.
    /// Runs at parse time, before any pixel is touched.
    fn validate_divisors(&self) -> KanopiResult<()> {
        match self {
            Expr::Num(_) | Expr::Band(_) => Ok(()),
            Expr::Neg(inner) => inner.validate_divisors(),
            Expr::Add(l, r) | Expr::Sub(l, r) | Expr::Mul(l, r) => {
                l.validate_divisors()?;
                r.validate_divisors()
            }
            Expr::Div(l, r) => {
                if r.const_fold() == Some(0.0) {
                    return Err(KanopiError::InvalidFormula(
                        "Denominator is always zero".to_string(),
                    ));
                }
                l.validate_divisors()?;
                r.validate_divisors()
            }
        }
    }

    /// Evaluate for one pixel. `None` marks an undefined value (division by
    /// zero at this pixel).
    fn eval(&self, px: &PixelBands) -> Option<f32> {
        match self {
            Expr::Num(v) => Some(*v),
            Expr::Band(role) => Some(px.get(*role)),
            Expr::Neg(inner) => inner.eval(px).map(|v| -v),
            Expr::Add(l, r) => Some(l.eval(px)? + r.eval(px)?),
            Expr::Sub(l, r) => Some(l.eval(px)? - r.eval(px)?),
            Expr::Mul(l, r) => Some(l.eval(px)? * r.eval(px)?),
            Expr::Div(l, r) => {
                let denom = r.eval(px)?;
                if denom == 0.0 {
                    None
                } else {
                    Some(l.eval(px)? / denom)
                }
            }
        }
    }
}

/// Band values for a single pixel position
#[derive(Debug, Clone, Copy, Default)]
struct PixelBands {
    blue: f32,
    green: f32,
    red: f32,
    nir: f32,
    swir: f32,
}

impl PixelBands {
    fn get(&self, role: BandRole) -> f32 {
        match role {
            BandRole::Blue => self.blue,
            BandRole::Green => self.green,
            BandRole::Red => self.red,
            BandRole::Nir => self.nir,
            BandRole::Swir => self.swir,
        }
    }

    fn set(&mut self, role: BandRole, value: f32) {
        match role {
            BandRole::Blue => self.blue = value,
            BandRole::Green => self.green = value,
            BandRole::Red => self.red = value,
            BandRole::Nir => self.nir = value,
            BandRole::Swir => self.swir = value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f32),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
}

fn tokenize(formula: &str) -> KanopiResult<Vec<Token>> {
    let pattern = Regex::new(r"\s*(?:(\d+\.?\d*(?:[eE][+-]?\d+)?)|([A-Za-z_][A-Za-z0-9_]*)|([+\-*/()]))")
        .map_err(|e| KanopiError::InvalidFormula(format!("Tokenizer setup failed: {}", e)))?;

    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < formula.len() {
        let rest = &formula[pos..];
        if rest.trim().is_empty() {
            break;
        }
        let caps = pattern.captures(rest).filter(|c| c.get(0).map(|m| m.start()) == Some(0));
        let caps = match caps {
            Some(c) => c,
            None => {
                return Err(KanopiError::InvalidFormula(format!(
                    "Unexpected character at position {}: '{}'",
                    pos,
                    rest.chars().next().unwrap_or(' ')
                )))
            }
        };
        if let Some(num) = caps.get(1) {
            let value: f32 = num.as_str().parse().map_err(|_| {
                KanopiError::InvalidFormula(format!("Malformed number '{}'", num.as_str()))
            })?;
            tokens.push(Token::Num(value));
        } else if let Some(ident) = caps.get(2) {
            tokens.push(Token::Ident(ident.as_str().to_string()));
        } else if let Some(op) = caps.get(3) {
            tokens.push(match op.as_str() {
                "+" => Token::Plus,
                "-" => Token::Minus,
                "*" => Token::Star,
                "/" => Token::Slash,
                "(" => Token::LParen,
                _ => Token::RParen,
            });
        }
        pos += caps.get(0).map(|m| m.end()).unwrap_or(1);
    }
    if tokens.is_empty() {
        return Err(KanopiError::InvalidFormula("Empty formula".to_string()));
    }
    Ok(tokens)
}

/// Recursive-descent parser for index formulas.
///
/// Grammar: expr := term (('+'|'-') term)*
///          term := factor (('*'|'/') factor)*
///          factor := '-' factor | '(' expr ')' | number | identifier
///
/// Identifiers resolve to a user coefficient first, then to a band role;
/// anything else fails with `invalid-formula`.
struct FormulaParser<'a> {
    tokens: &'a [Token],
    pos: usize,
    coefficients: &'a HashMap<String, f32>,
}

impl<'a> FormulaParser<'a> {
    fn parse(tokens: &'a [Token], coefficients: &'a HashMap<String, f32>) -> KanopiResult<Expr> {
        let mut parser = FormulaParser {
            tokens,
            pos: 0,
            coefficients,
        };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(KanopiError::InvalidFormula(format!(
                "Trailing tokens after position {}",
                parser.pos
            )));
        }
        Ok(expr)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<&Token> {
        let token = self.tokens.get(self.pos);
        self.pos += 1;
        token
    }

    fn expr(&mut self) -> KanopiResult<Expr> {
        let mut left = self.term()?;
        loop {
            match self.peek() {
                Some(Token::Plus) => {
                    self.pos += 1;
                    left = Expr::Add(Box::new(left), Box::new(self.term()?));
                }
                Some(Token::Minus) => {
                    self.pos += 1;
                    left = Expr::Sub(Box::new(left), Box::new(self.term()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn term(&mut self) -> KanopiResult<Expr> {
        let mut left = self.factor()?;
        loop {
            match self.peek() {
                Some(Token::Star) => {
                    self.pos += 1;
                    left = Expr::Mul(Box::new(left), Box::new(self.factor()?));
                }
                Some(Token::Slash) => {
                    self.pos += 1;
                    left = Expr::Div(Box::new(left), Box::new(self.factor()?));
                }
                _ => return Ok(left),
            }
        }
    }

    fn factor(&mut self) -> KanopiResult<Expr> {
        match self.advance().cloned() {
            Some(Token::Minus) => Ok(Expr::Neg(Box::new(self.factor()?))),
            Some(Token::Num(value)) => Ok(Expr::Num(value)),
            Some(Token::Ident(name)) => {
                if let Some(value) = self.coefficients.get(&name) {
                    return Ok(Expr::Num(*value));
                }
                match BandRole::from_name(&name) {
                    Some(role) => Ok(Expr::Band(role)),
                    None => Err(KanopiError::InvalidFormula(format!(
                        "Unknown band role or coefficient '{}'",
                        name
                    ))),
                }
            }
            Some(Token::LParen) => {
                let inner = self.expr()?;
                match self.advance() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err(KanopiError::InvalidFormula(
                        "Unbalanced parentheses".to_string(),
                    )),
                }
            }
            other => Err(KanopiError::InvalidFormula(format!(
                "Unexpected token: {:?}",
                other
            ))),
        }
    }
}

/// A spectral-index definition: name, formula over band roles, valid output
/// range, and a default rendering recipe.
///
/// Built-ins are fixed-coefficient constants; custom instances are parsed per
/// invocation and discarded after use.
#[derive(Debug, Clone)]
pub struct IndexSpec {
    pub name: String,
    formula: Expr,
    required: Vec<BandRole>,
    pub valid_range: (f32, f32),
    pub ramp: ColorRamp,
}

impl IndexSpec {
    /// Normalized Difference Vegetation Index: (nir - red) / (nir + red)
    pub fn ndvi() -> Self {
        Self::builtin(
            "NDVI",
            "(nir - red) / (nir + red)",
            &[],
            (-1.0, 1.0),
            ColorRamp::ndvi_classification(),
        )
    }

    /// Green NDVI: (nir - green) / (nir + green)
    pub fn gndvi() -> Self {
        Self::builtin(
            "GNDVI",
            "(nir - green) / (nir + green)",
            &[],
            (-1.0, 1.0),
            ColorRamp::diverging("RdYlGn"),
        )
    }

    /// Normalized Difference Water Index: (green - nir) / (green + nir)
    pub fn ndwi() -> Self {
        Self::builtin(
            "NDWI",
            "(green - nir) / (green + nir)",
            &[],
            (-1.0, 1.0),
            ColorRamp::diverging("RdBu"),
        )
    }

    /// Soil Adjusted Vegetation Index with L = 0.5:
    /// ((nir - red) / (nir + red + L)) * (1 + L)
    pub fn savi() -> Self {
        Self::builtin(
            "SAVI",
            "((nir - red) / (nir + red + L)) * (1 + L)",
            &[("L", 0.5)],
            (-1.5, 1.5),
            ColorRamp::diverging("RdYlGn"),
        )
    }

    /// Enhanced Vegetation Index:
    /// 2.5 * (nir - red) / (nir + 6*red - 7.5*blue + 1)
    pub fn evi() -> Self {
        Self::builtin(
            "EVI",
            "G * (nir - red) / (nir + C1 * red - C2 * blue + L)",
            &[("G", 2.5), ("C1", 6.0), ("C2", 7.5), ("L", 1.0)],
            (-1.0, 1.0),
            ColorRamp::diverging("RdYlGn"),
        )
    }

    fn builtin(
        name: &str,
        template: &str,
        coefficients: &[(&str, f32)],
        valid_range: (f32, f32),
        ramp: ColorRamp,
    ) -> Self {
        let coeffs: HashMap<String, f32> = coefficients
            .iter()
            .map(|(k, v)| (k.to_string(), *v))
            .collect();
        Self::from_template(name, template, &coeffs, valid_range, ramp)
            .expect("built-in index template parses")
    }

    /// Build a user-defined index from a formula template and coefficient
    /// map. Fails with `invalid-formula` before any pixel is touched when an
    /// identifier resolves to neither a coefficient nor a band role, or a
    /// denominator is structurally always zero.
    pub fn custom(
        name: &str,
        template: &str,
        coefficients: &HashMap<String, f32>,
        valid_range: Option<(f32, f32)>,
    ) -> KanopiResult<Self> {
        let range = valid_range.unwrap_or((f32::NEG_INFINITY, f32::INFINITY));
        Self::from_template(name, template, coefficients, range, ColorRamp::sequential("Viridis"))
    }

    fn from_template(
        name: &str,
        template: &str,
        coefficients: &HashMap<String, f32>,
        valid_range: (f32, f32),
        ramp: ColorRamp,
    ) -> KanopiResult<Self> {
        let tokens = tokenize(template)?;
        let formula = FormulaParser::parse(&tokens, coefficients)?;
        formula.validate_divisors()?;

        let mut required = Vec::new();
        formula.collect_bands(&mut required);
        if required.is_empty() {
            return Err(KanopiError::InvalidFormula(
                "Formula references no band".to_string(),
            ));
        }

        log::debug!(
            "Parsed index '{}' over bands [{}]",
            name,
            required
                .iter()
                .map(|r| r.name())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            name: name.to_string(),
            formula,
            required,
            valid_range,
            ramp,
        })
    }

    /// Band roles that must be resolvable to fetched assets before
    /// computation proceeds
    pub fn required_roles(&self) -> &[BandRole] {
        &self.required
    }
}

/// A derived analysis raster with its rendering recipe. Ephemeral: the engine
/// never persists these.
#[derive(Debug, Clone)]
pub struct AnalysisRaster {
    pub index_name: String,
    pub data: PixelBuffer,
    pub profile: GridProfile,
    pub style: RenderStyle,
}

/// Spectral-index computation over fetched raster bands
pub struct BandMathEngine {
    stretch: StretchParams,
}

impl Default for BandMathEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl BandMathEngine {
    pub fn new() -> Self {
        Self {
            stretch: StretchParams::default(),
        }
    }

    pub fn with_stretch(stretch: StretchParams) -> Self {
        Self { stretch }
    }

    /// Evaluate `spec` over the supplied bands.
    ///
    /// Preconditions are checked before any computation: every required role
    /// must be present and all bands must share one pixel grid, otherwise
    /// `band-mismatch` with no partial output. Division by zero, non-finite
    /// results and values outside the index's valid range become the no-data
    /// sentinel and are excluded from the automatic stretch.
    pub fn compute(
        &self,
        spec: &IndexSpec,
        bands: &HashMap<BandRole, RasterGrid>,
    ) -> KanopiResult<AnalysisRaster> {
        log::info!("Computing index '{}'", spec.name);

        // Validate input before touching pixels
        let mut resolved: Vec<(BandRole, &RasterGrid)> = Vec::new();
        for role in spec.required_roles() {
            match bands.get(role) {
                Some(grid) => resolved.push((*role, grid)),
                None => {
                    return Err(KanopiError::BandMismatch(format!(
                        "Band '{}' required by {} is not available",
                        role, spec.name
                    )))
                }
            }
        }

        let reference = resolved[0].1.profile.clone();
        for (role, grid) in &resolved {
            if !grid.profile.matches(&reference) {
                return Err(KanopiError::BandMismatch(format!(
                    "Band '{}' does not share the reference grid ({}x{})",
                    role, reference.height, reference.width
                )));
            }
        }

        let dim = resolved[0].1.data.dim();
        let (lo, hi) = spec.valid_range;
        let formula = &spec.formula;
        let views: Vec<(BandRole, &PixelBuffer)> =
            resolved.iter().map(|(role, grid)| (*role, &grid.data)).collect();

        let mut out: PixelBuffer = Array2::from_elem(dim, NO_DATA);
        Zip::indexed(&mut out).par_for_each(|(row, col), out_px| {
            let mut px = PixelBands::default();
            for (role, data) in &views {
                px.set(*role, data[[row, col]]);
            }
            *out_px = match formula.eval(&px) {
                Some(v) if v.is_finite() && v >= lo && v <= hi => v,
                _ => NO_DATA,
            };
        });

        let stretch = percentile_stretch(&out, self.stretch, NO_DATA)
            .unwrap_or_else(|| fallback_stretch(spec.valid_range));

        log::info!(
            "Index '{}' computed over {}x{} pixels, stretch [{:.4}, {:.4}]",
            spec.name,
            dim.0,
            dim.1,
            stretch.min,
            stretch.max
        );

        Ok(AnalysisRaster {
            index_name: spec.name.clone(),
            data: out,
            profile: reference,
            style: RenderStyle {
                ramp: spec.ramp.clone(),
                stretch,
                no_data: NO_DATA,
            },
        })
    }
}

/// Stretch fallback when every output pixel is no-data
fn fallback_stretch(valid_range: (f32, f32)) -> StretchRange {
    let (lo, hi) = valid_range;
    if lo.is_finite() && hi.is_finite() {
        StretchRange { min: lo, max: hi }
    } else {
        StretchRange { min: 0.0, max: 1.0 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use approx::assert_abs_diff_eq;

    fn profile(width: usize, height: usize) -> GridProfile {
        GridProfile {
            width,
            height,
            bounds: BoundingBox::new(500_000.0, 9_100_000.0, 500_100.0, 9_100_100.0),
            pixel_width: 10.0,
            pixel_height: 10.0,
            epsg: 32748,
        }
    }

    fn grid(values: Vec<f32>, width: usize, height: usize) -> RasterGrid {
        RasterGrid::new(
            Array2::from_shape_vec((height, width), values).unwrap(),
            profile(width, height),
        )
        .unwrap()
    }

    fn one_band(role: BandRole, values: Vec<f32>) -> HashMap<BandRole, RasterGrid> {
        let mut bands = HashMap::new();
        let len = values.len();
        bands.insert(role, grid(values, len, 1));
        bands
    }

    #[test]
    fn test_ndvi_reference_value() {
        let mut bands = one_band(BandRole::Nir, vec![0.5]);
        bands.insert(BandRole::Red, grid(vec![0.1], 1, 1));

        let result = BandMathEngine::new().compute(&IndexSpec::ndvi(), &bands).unwrap();
        assert_abs_diff_eq!(result.data[[0, 0]], 0.6667, epsilon = 1e-4);
    }

    #[test]
    fn test_ndvi_zero_denominator_yields_sentinel() {
        let mut bands = one_band(BandRole::Nir, vec![0.0, 0.5]);
        bands.insert(BandRole::Red, grid(vec![0.0, 0.1], 2, 1));

        let result = BandMathEngine::new().compute(&IndexSpec::ndvi(), &bands).unwrap();
        assert_eq!(result.data[[0, 0]], NO_DATA);
        assert!(result.data[[0, 1]].is_finite());
        assert_ne!(result.data[[0, 1]], NO_DATA);
    }

    #[test]
    fn test_savi_reference_value() {
        let mut bands = one_band(BandRole::Nir, vec![0.5]);
        bands.insert(BandRole::Red, grid(vec![0.1], 1, 1));

        let result = BandMathEngine::new().compute(&IndexSpec::savi(), &bands).unwrap();
        // ((0.5 - 0.1) / (0.5 + 0.1 + 0.5)) * 1.5
        assert_abs_diff_eq!(result.data[[0, 0]], 0.545455, epsilon = 1e-5);
    }

    #[test]
    fn test_evi_reference_value() {
        let mut bands = one_band(BandRole::Nir, vec![0.5]);
        bands.insert(BandRole::Red, grid(vec![0.1], 1, 1));
        bands.insert(BandRole::Blue, grid(vec![0.05], 1, 1));

        let result = BandMathEngine::new().compute(&IndexSpec::evi(), &bands).unwrap();
        // 2.5 * 0.4 / (0.5 + 0.6 - 0.375 + 1.0)
        assert_abs_diff_eq!(result.data[[0, 0]], 0.579710, epsilon = 1e-5);
    }

    #[test]
    fn test_ndwi_is_negated_gndvi() {
        let mut bands = one_band(BandRole::Nir, vec![0.4]);
        bands.insert(BandRole::Green, grid(vec![0.2], 1, 1));

        let engine = BandMathEngine::new();
        let gndvi = engine.compute(&IndexSpec::gndvi(), &bands).unwrap();
        let ndwi = engine.compute(&IndexSpec::ndwi(), &bands).unwrap();
        assert_abs_diff_eq!(gndvi.data[[0, 0]], -ndwi.data[[0, 0]], epsilon = 1e-6);
    }

    #[test]
    fn test_missing_band_is_mismatch() {
        let bands = one_band(BandRole::Nir, vec![0.5]);
        let err = BandMathEngine::new().compute(&IndexSpec::ndvi(), &bands).unwrap_err();
        assert_eq!(err.kind(), "band-mismatch");
    }

    #[test]
    fn test_profile_mismatch_refused() {
        let mut bands = one_band(BandRole::Nir, vec![0.5, 0.4]);
        // Different dimensions than the nir band
        bands.insert(BandRole::Red, grid(vec![0.1], 1, 1));

        let err = BandMathEngine::new().compute(&IndexSpec::ndvi(), &bands).unwrap_err();
        assert_eq!(err.kind(), "band-mismatch");
    }

    #[test]
    fn test_unknown_identifier_rejected_at_parse() {
        let err = IndexSpec::custom("bogus", "(nir - tir) / 2", &HashMap::new(), None).unwrap_err();
        assert_eq!(err.kind(), "invalid-formula");
    }

    #[test]
    fn test_structurally_zero_divisor_rejected_at_parse() {
        let mut coeffs = HashMap::new();
        coeffs.insert("L".to_string(), 0.5);
        let err =
            IndexSpec::custom("bogus", "(nir - red) / (L - L)", &coeffs, None).unwrap_err();
        assert_eq!(err.kind(), "invalid-formula");
    }

    #[test]
    fn test_custom_with_coefficients_matches_preset() {
        let mut coeffs = HashMap::new();
        coeffs.insert("L".to_string(), 0.0);
        let spec =
            IndexSpec::custom("ndvi-like", "((nir - red) / (nir + red + L)) * (1 + L)", &coeffs, None)
                .unwrap();

        let mut bands = one_band(BandRole::Nir, vec![0.5]);
        bands.insert(BandRole::Red, grid(vec![0.1], 1, 1));

        let engine = BandMathEngine::new();
        let custom = engine.compute(&spec, &bands).unwrap();
        let preset = engine.compute(&IndexSpec::ndvi(), &bands).unwrap();
        assert_abs_diff_eq!(custom.data[[0, 0]], preset.data[[0, 0]], epsilon = 1e-6);
    }

    #[test]
    fn test_out_of_range_value_becomes_sentinel() {
        // EVI denominator near zero produces a huge value at the first pixel
        let mut bands = one_band(BandRole::Nir, vec![0.5, 0.5]);
        bands.insert(BandRole::Red, grid(vec![0.1, 0.1], 2, 1));
        bands.insert(BandRole::Blue, grid(vec![0.2799, 0.05], 2, 1));

        let result = BandMathEngine::new().compute(&IndexSpec::evi(), &bands).unwrap();
        assert_eq!(result.data[[0, 0]], NO_DATA);
        assert_ne!(result.data[[0, 1]], NO_DATA);
    }

    #[test]
    fn test_required_roles_derived_from_formula() {
        let spec = IndexSpec::evi();
        let roles = spec.required_roles();
        assert!(roles.contains(&BandRole::Nir));
        assert!(roles.contains(&BandRole::Red));
        assert!(roles.contains(&BandRole::Blue));
        assert_eq!(roles.len(), 3);
    }
}
