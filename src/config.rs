use crate::types::{CleaningLevel, DemReference, SensorCategory, SpeckleFilterKind};
use std::path::PathBuf;
use std::time::Duration;

/// Processing-graph templates for the external tool, one per step.
/// Templates carry named placeholders (`{{input}}`, `{{output}}`,
/// `{{pixel_size_m}}`, `{{pixel_size_deg}}`, `{{crs}}`,
/// `{{polarization}}`, `{{dem}}`) rendered by the adapter.
#[derive(Debug, Clone)]
pub struct GraphTemplates {
    pub calibrate: PathBuf,
    /// Alternate calibration graph without the radiometric step, used
    /// for the one bounded retry on products where calibration is
    /// known to fail
    pub calibrate_fallback: Option<PathBuf>,
    pub orthorectify: PathBuf,
    pub despeckle: PathBuf,
}

/// Default output pixel size per sensor category, in meters
#[derive(Debug, Clone, Copy)]
pub struct DefaultResolutions {
    pub optical_m: f64,
    pub sar_m: f64,
    pub dem_m: f64,
}

impl Default for DefaultResolutions {
    fn default() -> Self {
        Self {
            optical_m: 10.0, // Sentinel-2 visible/NIR native
            sar_m: 10.0,     // Sentinel-1 GRD native
            dem_m: 30.0,     // Copernicus GLO-30
        }
    }
}

impl DefaultResolutions {
    pub fn for_category(&self, category: SensorCategory) -> f64 {
        match category {
            SensorCategory::Optical | SensorCategory::CloudMask => self.optical_m,
            SensorCategory::Sar => self.sar_m,
            SensorCategory::DemDerived => self.dem_m,
        }
    }
}

/// Everything the pipeline is allowed to know about its environment.
/// Threaded explicitly through constructors; no component reads
/// ambient global state.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Root of the artifact cache (one sub-directory per product)
    pub cache_dir: PathBuf,
    /// Keep cached artifacts across product disposal
    pub persist_cache: bool,
    /// External graph-processing tool executable
    pub tool_path: PathBuf,
    /// Graph templates; required for SAR processing
    pub graph_templates: Option<GraphTemplates>,
    /// Hard ceiling on one external tool invocation
    pub tool_timeout: Duration,
    pub default_resolutions: DefaultResolutions,
    /// DEM used for orthorectification and DEM-derived bands
    pub dem: Option<DemReference>,
    /// Masking level applied when a request does not override it
    pub cleaning_level: CleaningLevel,
    /// CRS the external tool warps SAR outputs into
    pub target_epsg: u32,
    /// Despeckle filter injected into the despeckle graph
    pub speckle_filter: SpeckleFilterKind,
    /// Allow the one bounded no-calibration retry after a calibration
    /// failure (logged at warn, never silent)
    pub calibration_fallback: bool,
    /// Resolve independent bands of one request across worker threads
    pub parallel: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("eoband");
        Self {
            cache_dir,
            persist_cache: false,
            tool_path: PathBuf::from("gpt"), // SNAP graph processing tool
            graph_templates: None,
            tool_timeout: Duration::from_secs(1800),
            default_resolutions: DefaultResolutions::default(),
            dem: None,
            cleaning_level: CleaningLevel::default(),
            target_epsg: 4326,
            speckle_filter: SpeckleFilterKind::Lee,
            calibration_fallback: false,
            parallel: cfg!(feature = "parallel"),
        }
    }
}

impl PipelineConfig {
    /// Config rooted at an explicit cache directory
    pub fn with_cache_dir(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            ..Self::default()
        }
    }
}
