use ndarray::{Array2, Array3};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Real-valued band data, one raster plane
pub type BandArray = Array2<f32>;

/// Stacked multi-band data (band x row x col)
pub type StackArray = Array3<f32>;

/// Internal nodata sentinel shared by every stacked band.
/// Integer encodings are an output-only concern at serialization time.
pub const NODATA: f32 = -9999.0;

/// Rough meters-per-degree at the equator, used to derive the degree
/// pixel size injected into processing graphs for geographic outputs.
pub const METERS_PER_DEGREE: f64 = 111_320.0;

/// Supported constellations (one descriptor table each)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Constellation {
    Sentinel1,
    Sentinel2,
    Landsat8,
    Landsat9,
}

impl std::fmt::Display for Constellation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Constellation::Sentinel1 => write!(f, "Sentinel-1"),
            Constellation::Sentinel2 => write!(f, "Sentinel-2"),
            Constellation::Landsat8 => write!(f, "Landsat-8"),
            Constellation::Landsat9 => write!(f, "Landsat-9"),
        }
    }
}

/// Sensor category, fixing the pipeline shape for a band
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SensorCategory {
    Optical,
    Sar,
    DemDerived,
    CloudMask,
}

impl std::fmt::Display for SensorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorCategory::Optical => write!(f, "optical"),
            SensorCategory::Sar => write!(f, "SAR"),
            SensorCategory::DemDerived => write!(f, "DEM-derived"),
            SensorCategory::CloudMask => write!(f, "cloud-mask"),
        }
    }
}

/// SAR polarization modes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Polarization {
    VV,
    VH,
    HV,
    HH,
}

impl std::fmt::Display for Polarization {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Polarization::VV => write!(f, "VV"),
            Polarization::VH => write!(f, "VH"),
            Polarization::HV => write!(f, "HV"),
            Polarization::HH => write!(f, "HH"),
        }
    }
}

/// Abstract spectral band names shared across optical constellations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpectralBand {
    CoastalAerosol,
    Blue,
    Green,
    Red,
    RedEdge1,
    RedEdge2,
    RedEdge3,
    Nir,
    NarrowNir,
    WaterVapour,
    Cirrus,
    Swir1,
    Swir2,
    Pan,
    Tir1,
    Tir2,
}

impl std::fmt::Display for SpectralBand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SpectralBand::CoastalAerosol => "COASTAL_AEROSOL",
            SpectralBand::Blue => "BLUE",
            SpectralBand::Green => "GREEN",
            SpectralBand::Red => "RED",
            SpectralBand::RedEdge1 => "VRE_1",
            SpectralBand::RedEdge2 => "VRE_2",
            SpectralBand::RedEdge3 => "VRE_3",
            SpectralBand::Nir => "NIR",
            SpectralBand::NarrowNir => "NARROW_NIR",
            SpectralBand::WaterVapour => "WV",
            SpectralBand::Cirrus => "CIRRUS",
            SpectralBand::Swir1 => "SWIR_1",
            SpectralBand::Swir2 => "SWIR_2",
            SpectralBand::Pan => "PAN",
            SpectralBand::Tir1 => "TIR_1",
            SpectralBand::Tir2 => "TIR_2",
        };
        write!(f, "{}", name)
    }
}

/// Cloud/defect mask kinds exposed as requestable bands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MaskKind {
    Clouds,
    Shadows,
    Cirrus,
    AllClouds,
}

impl std::fmt::Display for MaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MaskKind::Clouds => "CLOUDS",
            MaskKind::Shadows => "SHADOWS",
            MaskKind::Cirrus => "CIRRUS_CLOUDS",
            MaskKind::AllClouds => "ALL_CLOUDS",
        };
        write!(f, "{}", name)
    }
}

/// Rasters computed from a DEM rather than read from sensor data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DemDerivative {
    Slope,
    Aspect,
    Hillshade,
}

impl std::fmt::Display for DemDerivative {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DemDerivative::Slope => "SLOPE",
            DemDerivative::Aspect => "ASPECT",
            DemDerivative::Hillshade => "HILLSHADE",
        };
        write!(f, "{}", name)
    }
}

/// How aggressively invalid optical pixels are masked.
/// Each level is a distinct cache key; `Full` is never computed to
/// satisfy a `NodataOnly` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CleaningLevel {
    /// No masking at all, pixels as delivered
    Raw,
    /// Only detector-footprint / out-of-swath pixels set to nodata
    NodataOnly,
    /// Every provider defect/saturation/cloud flag masked as well
    Full,
}

impl Default for CleaningLevel {
    fn default() -> Self {
        CleaningLevel::NodataOnly
    }
}

impl CleaningLevel {
    /// Stable token for fingerprinting and artifact names
    pub fn token(&self) -> &'static str {
        match self {
            CleaningLevel::Raw => "raw",
            CleaningLevel::NodataOnly => "nodata",
            CleaningLevel::Full => "full",
        }
    }
}

/// Despeckle filters supported by the external graph tool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SpeckleFilterKind {
    Lee,
    RefinedLee,
    GammaMap,
}

impl SpeckleFilterKind {
    pub fn token(&self) -> &'static str {
        match self {
            SpeckleFilterKind::Lee => "lee",
            SpeckleFilterKind::RefinedLee => "refined_lee",
            SpeckleFilterKind::GammaMap => "gamma_map",
        }
    }
}

/// Resampling method applied when a band is collocated onto a foreign
/// grid. Fixed per band descriptor, never user-configurable per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resampling {
    Nearest,
    Bilinear,
}

/// Reference to a digital elevation model
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DemReference {
    /// Local raster file
    Path(PathBuf),
    /// Remote raster, downloaded once into the cache directory
    Url(String),
    /// A DEM known to the external tool by name (e.g. "SRTM 3Sec").
    /// Not readable in-process, so unusable for DEM derivatives.
    Named(String),
}

impl DemReference {
    /// Stable token for fingerprinting
    pub fn token(&self) -> String {
        match self {
            DemReference::Path(p) => format!("path:{}", p.display()),
            DemReference::Url(u) => format!("url:{}", u),
            DemReference::Named(n) => format!("named:{}", n),
        }
    }
}

/// Geospatial transformation parameters (GDAL-style affine)
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
    /// North-up transform from an origin and pixel sizes
    pub fn from_origin(
        top_left_x: f64,
        top_left_y: f64,
        pixel_width: f64,
        pixel_height: f64,
    ) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    /// Map pixel indices to the coordinate of the pixel's top-left corner
    pub fn apply(&self, col: f64, row: f64) -> (f64, f64) {
        (
            self.top_left_x + col * self.pixel_width + row * self.rotation_x,
            self.top_left_y + col * self.rotation_y + row * self.pixel_height,
        )
    }

    pub fn from_gdal(gt: &[f64; 6]) -> Self {
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
}

/// A complete raster grid: affine transform, shape and CRS
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GridSpec {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    pub epsg: u32,
}

impl GridSpec {
    pub fn new(transform: GeoTransform, width: usize, height: usize, epsg: u32) -> Self {
        Self {
            transform,
            width,
            height,
            epsg,
        }
    }

    /// Pixel size as (x, y), both positive
    pub fn pixel_size(&self) -> (f64, f64) {
        (
            self.transform.pixel_width.abs(),
            self.transform.pixel_height.abs(),
        )
    }

    /// Same extent and CRS, resampled to a new pixel size
    pub fn with_pixel_size(&self, pixel_size: f64) -> Self {
        let extent_x = self.width as f64 * self.transform.pixel_width.abs();
        let extent_y = self.height as f64 * self.transform.pixel_height.abs();
        let width = (extent_x / pixel_size).round().max(1.0) as usize;
        let height = (extent_y / pixel_size).round().max(1.0) as usize;
        Self {
            transform: GeoTransform::from_origin(
                self.transform.top_left_x,
                self.transform.top_left_y,
                pixel_size,
                pixel_size,
            ),
            width,
            height,
            epsg: self.epsg,
        }
    }

    /// True when two grids are pixel-for-pixel identical (within
    /// floating point tolerance on the transform)
    pub fn matches(&self, other: &GridSpec) -> bool {
        const EPS: f64 = 1e-6;
        self.width == other.width
            && self.height == other.height
            && self.epsg == other.epsg
            && (self.transform.top_left_x - other.transform.top_left_x).abs() < EPS
            && (self.transform.top_left_y - other.transform.top_left_y).abs() < EPS
            && (self.transform.pixel_width - other.transform.pixel_width).abs() < EPS
            && (self.transform.pixel_height - other.transform.pixel_height).abs() < EPS
    }
}

/// Pixel window into a native-resolution raster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub width: usize,
    pub height: usize,
}

/// One processing step of a band's chain, with everything the external
/// tool or the in-process implementation needs to execute it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ProcessingStep {
    /// Radiometric calibration (SAR, external tool)
    Calibrate { polarization: Polarization },
    /// Terrain/geometry correction onto a map projection (external tool)
    Orthorectify {
        pixel_size_m: f64,
        epsg: u32,
        dem: DemReference,
    },
    /// SAR noise filtering, applied after orthorectification (external tool)
    Despeckle { filter: SpeckleFilterKind },
    /// Set invalid pixels to the nodata sentinel
    MaskInvalidPixels { level: CleaningLevel },
    /// Compute slope/aspect/hillshade from a DEM
    ComputeDemDerivative {
        kind: DemDerivative,
        dem: DemReference,
    },
}

impl ProcessingStep {
    /// Short lower-case name used in logs, artifact files and errors
    pub fn name(&self) -> &'static str {
        match self {
            ProcessingStep::Calibrate { .. } => "calibrate",
            ProcessingStep::Orthorectify { .. } => "orthorectify",
            ProcessingStep::Despeckle { .. } => "despeckle",
            ProcessingStep::MaskInvalidPixels { .. } => "mask",
            ProcessingStep::ComputeDemDerivative { .. } => "dem_derivative",
        }
    }

    /// Append a stable token stream covering every parameter that can
    /// change output pixel values. Floats are encoded via `to_bits` so
    /// the fingerprint is bit-stable across platforms.
    pub fn fingerprint_tokens(&self, out: &mut Vec<String>) {
        match self {
            ProcessingStep::Calibrate { polarization } => {
                out.push(format!("calibrate:{}", polarization));
            }
            ProcessingStep::Orthorectify {
                pixel_size_m,
                epsg,
                dem,
            } => {
                out.push(format!(
                    "orthorectify:{:016x}:{}:{}",
                    pixel_size_m.to_bits(),
                    epsg,
                    dem.token()
                ));
            }
            ProcessingStep::Despeckle { filter } => {
                out.push(format!("despeckle:{}", filter.token()));
            }
            ProcessingStep::MaskInvalidPixels { level } => {
                out.push(format!("mask:{}", level.token()));
            }
            ProcessingStep::ComputeDemDerivative { kind, dem } => {
                out.push(format!("dem_derivative:{}:{}", kind, dem.token()));
            }
        }
    }
}

/// Resolved, product-specific description of one band: what to read and
/// the ordered steps turning it into an analysis-ready raster.
/// Built by the registry, never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BandDescriptor {
    /// Canonical label in the output stack ("GREEN", "VV_DSPK", "SLOPE")
    pub label: String,
    /// Native identifier within the product ("B03", "VV", "DEM")
    pub native_id: String,
    pub category: SensorCategory,
    /// Native pixel size in meters
    pub native_resolution_m: f64,
    pub resampling: Resampling,
    /// Ordered chain; the order is a total order fixed per category
    pub steps: Vec<ProcessingStep>,
}

/// Provider flag rasters a product may carry, consumed by masking and
/// cloud-mask band requests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlagKind {
    /// Detector footprint / out-of-swath
    Nodata,
    Defect,
    Saturation,
    Cloud,
    Shadow,
    Cirrus,
}

/// Caller-supplied description of one on-disk product. Produced by the
/// per-format metadata layer, which lives outside this crate.
#[derive(Debug, Clone)]
pub struct Product {
    pub id: String,
    pub constellation: Constellation,
    /// Native band id -> raster path
    pub band_paths: HashMap<String, PathBuf>,
    /// Provider flag rasters, when the format ships them
    pub flag_paths: HashMap<FlagKind, PathBuf>,
}

impl Product {
    pub fn band_path(&self, native_id: &str) -> PipelineResult<&PathBuf> {
        self.band_paths.get(native_id).ok_or_else(|| {
            PipelineError::InvalidFormat(format!(
                "product '{}' carries no raster for native band '{}'",
                self.id, native_id
            ))
        })
    }
}

/// One raster plane with its georeferencing and nodata convention
#[derive(Debug, Clone, PartialEq)]
pub struct RasterData {
    pub data: BandArray,
    pub grid: GridSpec,
    pub nodata: f32,
    /// Unit note carried along for callers ("reflectance", "m2/m2", "deg")
    pub unit: String,
}

impl RasterData {
    pub fn new(data: BandArray, grid: GridSpec, nodata: f32, unit: impl Into<String>) -> Self {
        Self {
            data,
            grid,
            nodata,
            unit: unit.into(),
        }
    }
}

/// An analysis-ready band as handed back to the caller. The pipeline
/// keeps no reference once this is returned.
#[derive(Debug, Clone)]
pub struct ResolvedBand {
    pub name: String,
    pub category: SensorCategory,
    pub resampling: Resampling,
    pub raster: RasterData,
}

/// Final stacked result: bands in request order on one shared grid
#[derive(Debug, Clone)]
pub struct MultiBandArray {
    pub names: Vec<String>,
    pub data: StackArray,
    pub grid: GridSpec,
    pub nodata: f32,
}

impl MultiBandArray {
    /// Index of a band by its canonical label
    pub fn band_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// Error types for the band pipeline
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("unsupported band '{band}' for {constellation} products (accepted: {accepted})")]
    UnsupportedBand {
        band: String,
        constellation: String,
        accepted: String,
    },

    #[error("missing dependency for {what}: {hint}")]
    MissingDependency { what: String, hint: String },

    #[error("external tool failed during {step} of band '{band}' (product '{product}'): {message}")]
    ToolExecution {
        step: String,
        band: String,
        product: String,
        message: String,
    },

    #[error("external tool timed out after {seconds}s during {step} of band '{band}' (product '{product}')")]
    ToolTimeout {
        step: String,
        band: String,
        product: String,
        seconds: u64,
    },

    #[error("cache write failed: {0}")]
    CacheWrite(String),

    #[error("grid mismatch: {0}")]
    GridMismatch(String),

    #[error("invalid data format: {0}")]
    InvalidFormat(String),

    #[error("processing error: {0}")]
    Processing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),
}

/// Result type for pipeline operations
pub type PipelineResult<T> = Result<T, PipelineError>;
