use gdal::raster::GdalType;
use ndarray::Array2;
use num_traits::{Bounded, NumCast, Zero};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;

/// Usability mask: `true` marks a cloudy/unusable pixel
pub type UsabilityMask = Array2<bool>;

/// Sentinel-2 MSI spectral bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BandCode {
    B01,
    B02,
    B03,
    B04,
    B05,
    B06,
    B07,
    B08,
    B8A,
    B09,
    B10,
    B11,
    B12,
}

impl BandCode {
    /// Positional band order expected by the cloud classifier
    pub const CLASSIFIER_ORDER: [BandCode; 13] = [
        BandCode::B01,
        BandCode::B02,
        BandCode::B03,
        BandCode::B04,
        BandCode::B05,
        BandCode::B06,
        BandCode::B07,
        BandCode::B08,
        BandCode::B8A,
        BandCode::B09,
        BandCode::B10,
        BandCode::B11,
        BandCode::B12,
    ];

    /// Surface bands that are masked and mosaicked (atmospheric bands excluded)
    pub const OUTPUT_BANDS: [BandCode; 10] = [
        BandCode::B02,
        BandCode::B03,
        BandCode::B04,
        BandCode::B05,
        BandCode::B06,
        BandCode::B07,
        BandCode::B08,
        BandCode::B8A,
        BandCode::B11,
        BandCode::B12,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BandCode::B01 => "B01",
            BandCode::B02 => "B02",
            BandCode::B03 => "B03",
            BandCode::B04 => "B04",
            BandCode::B05 => "B05",
            BandCode::B06 => "B06",
            BandCode::B07 => "B07",
            BandCode::B08 => "B08",
            BandCode::B8A => "B8A",
            BandCode::B09 => "B09",
            BandCode::B10 => "B10",
            BandCode::B11 => "B11",
            BandCode::B12 => "B12",
        }
    }

    /// Native ground sampling distance in meters
    pub fn native_resolution(&self) -> f64 {
        match self {
            BandCode::B02 | BandCode::B03 | BandCode::B04 | BandCode::B08 => 10.0,
            BandCode::B05
            | BandCode::B06
            | BandCode::B07
            | BandCode::B8A
            | BandCode::B11
            | BandCode::B12 => 20.0,
            BandCode::B01 | BandCode::B09 | BandCode::B10 => 60.0,
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            BandCode::B01 => "Coastal aerosol",
            BandCode::B02 => "Blue",
            BandCode::B03 => "Green",
            BandCode::B04 => "Red",
            BandCode::B05 => "Red Edge 1",
            BandCode::B06 => "Red Edge 2",
            BandCode::B07 => "Red Edge 3",
            BandCode::B08 => "NIR",
            BandCode::B8A => "Narrow NIR",
            BandCode::B09 => "Water vapour",
            BandCode::B10 => "Cirrus",
            BandCode::B11 => "SWIR 1",
            BandCode::B12 => "SWIR 2",
        }
    }

    /// Index of the band in the MTD radiometric offset list (`band_id`)
    pub fn metadata_index(&self) -> usize {
        Self::CLASSIFIER_ORDER
            .iter()
            .position(|b| b == self)
            .unwrap_or_default()
    }
}

// Composite bands are stacked in ascending code order, so B8A sorts after B12
impl Ord for BandCode {
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_str().cmp(other.as_str())
    }
}

impl PartialOrd for BandCode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for BandCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BandCode {
    type Err = S2Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_uppercase();
        BandCode::CLASSIFIER_ORDER
            .iter()
            .copied()
            .find(|band| band.as_str() == code)
            .ok_or_else(|| S2Error::InvalidInput(format!("Unknown band code: {}", s)))
    }
}

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64,
}

impl GeoTransform {
    /// North-up transform anchored at the top-left corner
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }

    /// Ground coordinate of a fractional pixel position (col, row)
    pub fn pixel_to_geo(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    /// Fractional pixel position (col, row) of a ground coordinate
    pub fn geo_to_pixel(&self, x: f64, y: f64) -> (f64, f64) {
        let det = self.pixel_width * self.pixel_height - self.rotation_x * self.rotation_y;
        let dx = x - self.top_left_x;
        let dy = y - self.top_left_y;
        let col = (dx * self.pixel_height - dy * self.rotation_x) / det;
        let row = (dy * self.pixel_width - dx * self.rotation_y) / det;
        (col, row)
    }
}

/// Projected bounding box
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y }
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox {
            min_x: self.min_x.min(other.min_x),
            min_y: self.min_y.min(other.min_y),
            max_x: self.max_x.max(other.max_x),
            max_y: self.max_y.max(other.max_y),
        }
    }

    /// Overlap of two boxes, `None` when they do not intersect
    pub fn intersection(&self, other: &BoundingBox) -> Option<BoundingBox> {
        let result = BoundingBox {
            min_x: self.min_x.max(other.min_x),
            min_y: self.min_y.max(other.min_y),
            max_x: self.max_x.min(other.max_x),
            max_y: self.max_y.min(other.max_y),
        };
        if result.min_x < result.max_x && result.min_y < result.max_y {
            Some(result)
        } else {
            None
        }
    }

    /// Snap outward to whole multiples of `pixel_size`. Coordinates within
    /// floating-point noise of a multiple stay on it.
    pub fn snap_outward(&self, pixel_size: f64) -> BoundingBox {
        const EPS: f64 = 1e-9;
        BoundingBox {
            min_x: (self.min_x / pixel_size + EPS).floor() * pixel_size,
            min_y: (self.min_y / pixel_size + EPS).floor() * pixel_size,
            max_x: (self.max_x / pixel_size - EPS).ceil() * pixel_size,
            max_y: (self.max_y / pixel_size - EPS).ceil() * pixel_size,
        }
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }
}

/// Common pixel geometry shared by co-registered rasters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RasterGrid {
    pub width: usize,
    pub height: usize,
    pub geo_transform: GeoTransform,
    /// Projection as WKT (or any definition GDAL understands)
    pub projection: String,
    pub bounds: BoundingBox,
}

impl RasterGrid {
    /// Build a north-up grid covering `bounds` at a square pixel size
    pub fn from_bounds(bounds: BoundingBox, pixel_size: f64, projection: impl Into<String>) -> Self {
        let width = (bounds.width() / pixel_size).round().max(0.0) as usize;
        let height = (bounds.height() / pixel_size).round().max(0.0) as usize;
        Self {
            width,
            height,
            geo_transform: GeoTransform::north_up(bounds.min_x, bounds.max_y, pixel_size, pixel_size),
            projection: projection.into(),
            bounds,
        }
    }

    /// Grid described by a native geotransform and raster size
    pub fn from_geo_transform(
        geo_transform: GeoTransform,
        width: usize,
        height: usize,
        projection: impl Into<String>,
    ) -> Self {
        let corners = [
            geo_transform.pixel_to_geo(0.0, 0.0),
            geo_transform.pixel_to_geo(width as f64, 0.0),
            geo_transform.pixel_to_geo(0.0, height as f64),
            geo_transform.pixel_to_geo(width as f64, height as f64),
        ];
        let mut bounds = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
        for (x, y) in corners {
            bounds.min_x = bounds.min_x.min(x);
            bounds.min_y = bounds.min_y.min(y);
            bounds.max_x = bounds.max_x.max(x);
            bounds.max_y = bounds.max_y.max(y);
        }
        Self {
            width,
            height,
            geo_transform,
            projection: projection.into(),
            bounds,
        }
    }

    pub fn pixel_size_x(&self) -> f64 {
        self.geo_transform.pixel_width
    }

    pub fn pixel_size_y(&self) -> f64 {
        self.geo_transform.pixel_height
    }

    /// Array shape as (rows, cols)
    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }

    /// Integer (row, col) offset of this grid's origin inside `outer`, if both
    /// grids share the same pixel lattice
    pub fn offset_within(&self, outer: &RasterGrid) -> Option<(usize, usize)> {
        let tolerance = 1e-6 * self.pixel_size_x().abs().max(1.0);
        if (self.pixel_size_x() - outer.pixel_size_x()).abs() > tolerance
            || (self.pixel_size_y() - outer.pixel_size_y()).abs() > tolerance
        {
            return None;
        }
        let (col, row) = outer
            .geo_transform
            .geo_to_pixel(self.geo_transform.top_left_x, self.geo_transform.top_left_y);
        let (col_r, row_r) = (col.round(), row.round());
        if (col - col_r).abs() > 1e-6 || (row - row_r).abs() > 1e-6 || col_r < 0.0 || row_r < 0.0 {
            return None;
        }
        let (row_off, col_off) = (row_r as usize, col_r as usize);
        if row_off + self.height > outer.height || col_off + self.width > outer.width {
            return None;
        }
        Some((row_off, col_off))
    }
}

/// Numeric raster element
pub trait Pixel:
    Copy + Send + Sync + PartialOrd + Zero + NumCast + Bounded + GdalType + std::fmt::Debug + 'static
{
    /// Integer types round and clamp when narrowing from f64
    const INTEGRAL: bool;

    fn as_f64(self) -> f64 {
        <f64 as NumCast>::from(self).unwrap_or(f64::NAN)
    }

    fn from_f64_lossy(value: f64) -> Self {
        let value = if Self::INTEGRAL { value.round() } else { value };
        let clamped = value.clamp(Self::min_value().as_f64(), Self::max_value().as_f64());
        <Self as NumCast>::from(clamped).unwrap_or_else(Self::zero)
    }
}

macro_rules! impl_pixel {
    ($($t:ty => $integral:expr),* $(,)?) => {
        $(impl Pixel for $t {
            const INTEGRAL: bool = $integral;
        })*
    };
}

impl_pixel!(
    u8 => true,
    u16 => true,
    i16 => true,
    u32 => true,
    i32 => true,
    f32 => false,
    f64 => false,
);

/// Single-band in-memory raster
#[derive(Debug, Clone)]
pub struct Raster<T> {
    pub grid: RasterGrid,
    pub data: Array2<T>,
    pub nodata: Option<f64>,
}

impl<T: Pixel> Raster<T> {
    pub fn new(grid: RasterGrid, data: Array2<T>, nodata: Option<f64>) -> S2Result<Self> {
        if data.dim() != grid.shape() {
            return Err(S2Error::InvalidInput(format!(
                "Raster data shape {:?} does not match grid shape {:?}",
                data.dim(),
                grid.shape()
            )));
        }
        Ok(Self { grid, data, nodata })
    }
}

/// Band arrays keyed by band code, all sharing one grid
#[derive(Debug, Clone)]
pub struct BandStack<T> {
    grid: RasterGrid,
    bands: BTreeMap<BandCode, Array2<T>>,
}

/// Calibrated top-of-atmosphere reflectance in [0, 1]
pub type ReflectanceStack = BandStack<f32>;

impl<T> BandStack<T> {
    pub fn new(grid: RasterGrid) -> Self {
        Self {
            grid,
            bands: BTreeMap::new(),
        }
    }

    /// Add a band; its shape must match the stack grid
    pub fn insert(&mut self, band: BandCode, data: Array2<T>) -> S2Result<()> {
        if data.dim() != self.grid.shape() {
            return Err(S2Error::InvalidInput(format!(
                "Band {} has shape {:?}, expected {:?}",
                band,
                data.dim(),
                self.grid.shape()
            )));
        }
        self.bands.insert(band, data);
        Ok(())
    }

    pub fn with_band(mut self, band: BandCode, data: Array2<T>) -> S2Result<Self> {
        self.insert(band, data)?;
        Ok(self)
    }

    pub fn grid(&self) -> &RasterGrid {
        &self.grid
    }

    pub fn shape(&self) -> (usize, usize) {
        self.grid.shape()
    }

    pub fn get(&self, band: BandCode) -> Option<&Array2<T>> {
        self.bands.get(&band)
    }

    pub fn contains(&self, band: BandCode) -> bool {
        self.bands.contains_key(&band)
    }

    pub fn band_codes(&self) -> Vec<BandCode> {
        self.bands.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BandCode, &Array2<T>)> {
        self.bands.iter()
    }

    pub fn len(&self) -> usize {
        self.bands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bands.is_empty()
    }
}

/// One Sentinel-2 acquisition and the files holding its bands
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scene {
    pub id: String,
    pub band_files: BTreeMap<BandCode, PathBuf>,
    pub crs: String,
}

/// Masked single-scene rasters of one band, to be combined
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicInput {
    pub band: BandCode,
    pub paths: Vec<PathBuf>,
}

/// Multi-band median composite written by a mosaic run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompositeProduct {
    pub path: PathBuf,
    pub bands: Vec<BandCode>,
    pub grid: RasterGrid,
}

/// Outcome of one unit of work in a best-effort batch
#[derive(Debug, Clone)]
pub enum ItemOutcome<T> {
    Success(T),
    Skipped { reason: String },
    Failed { error: String },
}

impl<T> ItemOutcome<T> {
    pub fn is_success(&self) -> bool {
        matches!(self, ItemOutcome::Success(_))
    }

    pub fn success(&self) -> Option<&T> {
        match self {
            ItemOutcome::Success(value) => Some(value),
            _ => None,
        }
    }
}

/// Per-item outcomes of a batch keyed by scene id or band code
#[derive(Debug, Clone)]
pub struct BatchReport<K: Ord, T> {
    pub outcomes: BTreeMap<K, ItemOutcome<T>>,
}

impl<K: Ord, T> BatchReport<K, T> {
    pub fn new() -> Self {
        Self {
            outcomes: BTreeMap::new(),
        }
    }

    pub fn record(&mut self, key: K, outcome: ItemOutcome<T>) {
        self.outcomes.insert(key, outcome);
    }

    pub fn successes(&self) -> impl Iterator<Item = (&K, &T)> {
        self.outcomes
            .iter()
            .filter_map(|(key, outcome)| outcome.success().map(|value| (key, value)))
    }

    pub fn success_count(&self) -> usize {
        self.outcomes.values().filter(|o| o.is_success()).count()
    }

    pub fn skipped_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, ItemOutcome::Skipped { .. }))
            .count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .values()
            .filter(|o| matches!(o, ItemOutcome::Failed { .. }))
            .count()
    }

    /// A batch succeeds when at least one item succeeded
    pub fn is_success(&self) -> bool {
        self.success_count() > 0
    }
}

impl<K: Ord, T> Default for BatchReport<K, T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Error types for cloud masking and mosaicking
#[derive(Debug, thiserror::Error)]
pub enum S2Error {
    #[error("Reference raster unavailable: {path}: {reason}")]
    ReferenceUnavailable { path: PathBuf, reason: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("Classifier error: {0}")]
    Classifier(String),

    #[error("No valid scenes: {0}")]
    NoValidScenes(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("Metadata error: {0}")]
    Metadata(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for cloud masking operations
pub type S2Result<T> = Result<T, S2Error>;
