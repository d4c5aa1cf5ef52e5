//! Band descriptor registry: static per-constellation tables mapping
//! abstract band identifiers to native identifiers, resolutions and
//! processing chains.
//!
//! Resolution is pure table lookup with no side effects. Per-sensor
//! specifics live in the tables (data, not code) so the orchestrator's
//! state machine stays sensor-agnostic.

use crate::config::PipelineConfig;
use crate::types::*;
use regex::Regex;

/// Abstract band identifier as supplied by a caller
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BandSelector {
    /// Named spectral band ("GREEN", "SWIR_1")
    Spectral(SpectralBand),
    /// SAR backscatter, optionally despeckled ("VV", "VV_DSPK")
    Sar {
        polarization: Polarization,
        despeckled: bool,
    },
    /// Cloud/defect mask band ("CLOUDS", "ALL_CLOUDS")
    Mask(MaskKind),
    /// DEM derivative ("SLOPE", "ASPECT", "HILLSHADE")
    Derivative(DemDerivative),
    /// Raw native identifier ("B04", "B8A"); resolved against the
    /// constellation table
    Native(String),
}

impl std::fmt::Display for BandSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BandSelector::Spectral(b) => write!(f, "{}", b),
            BandSelector::Sar {
                polarization,
                despeckled,
            } => {
                if *despeckled {
                    write!(f, "{}_DSPK", polarization)
                } else {
                    write!(f, "{}", polarization)
                }
            }
            BandSelector::Mask(m) => write!(f, "{}", m),
            BandSelector::Derivative(d) => write!(f, "{}", d),
            BandSelector::Native(s) => write!(f, "{}", s),
        }
    }
}

impl std::str::FromStr for BandSelector {
    type Err = PipelineError;

    /// Parse the string form of a band identifier. Unknown identifiers
    /// become `Native` and are validated against the constellation
    /// table at resolution time.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.trim().to_uppercase();

        let spectral = match upper.as_str() {
            "COASTAL_AEROSOL" | "CA" => Some(SpectralBand::CoastalAerosol),
            "BLUE" => Some(SpectralBand::Blue),
            "GREEN" => Some(SpectralBand::Green),
            "RED" => Some(SpectralBand::Red),
            "VRE_1" | "RED_EDGE_1" => Some(SpectralBand::RedEdge1),
            "VRE_2" | "RED_EDGE_2" => Some(SpectralBand::RedEdge2),
            "VRE_3" | "RED_EDGE_3" => Some(SpectralBand::RedEdge3),
            "NIR" => Some(SpectralBand::Nir),
            "NARROW_NIR" => Some(SpectralBand::NarrowNir),
            "WV" | "WATER_VAPOUR" => Some(SpectralBand::WaterVapour),
            "CIRRUS" => Some(SpectralBand::Cirrus),
            "SWIR_1" => Some(SpectralBand::Swir1),
            "SWIR_2" => Some(SpectralBand::Swir2),
            "PAN" => Some(SpectralBand::Pan),
            "TIR_1" => Some(SpectralBand::Tir1),
            "TIR_2" => Some(SpectralBand::Tir2),
            _ => None,
        };
        if let Some(b) = spectral {
            return Ok(BandSelector::Spectral(b));
        }

        match upper.as_str() {
            "CLOUDS" => return Ok(BandSelector::Mask(MaskKind::Clouds)),
            "SHADOWS" => return Ok(BandSelector::Mask(MaskKind::Shadows)),
            "CIRRUS_CLOUDS" => return Ok(BandSelector::Mask(MaskKind::Cirrus)),
            "ALL_CLOUDS" => return Ok(BandSelector::Mask(MaskKind::AllClouds)),
            "SLOPE" => return Ok(BandSelector::Derivative(DemDerivative::Slope)),
            "ASPECT" => return Ok(BandSelector::Derivative(DemDerivative::Aspect)),
            "HILLSHADE" => return Ok(BandSelector::Derivative(DemDerivative::Hillshade)),
            _ => {}
        }

        let (pol_str, despeckled) = match upper.strip_suffix("_DSPK") {
            Some(p) => (p, true),
            None => (upper.as_str(), false),
        };
        let pol = match pol_str {
            "VV" => Some(Polarization::VV),
            "VH" => Some(Polarization::VH),
            "HV" => Some(Polarization::HV),
            "HH" => Some(Polarization::HH),
            _ => None,
        };
        if let Some(polarization) = pol {
            return Ok(BandSelector::Sar {
                polarization,
                despeckled,
            });
        }

        Ok(BandSelector::Native(upper))
    }
}

/// One band request: abstract identifier plus optional per-request
/// parameters. Immutable value.
#[derive(Debug, Clone, PartialEq)]
pub struct BandRequest {
    pub selector: BandSelector,
    /// Target pixel size in meters; category default when absent
    pub resolution_m: Option<f64>,
    /// Pixel window into the native raster; full extent when absent
    pub window: Option<PixelWindow>,
    /// Cleaning level override for optical bands
    pub cleaning: Option<CleaningLevel>,
}

impl BandRequest {
    pub fn new(selector: BandSelector) -> Self {
        Self {
            selector,
            resolution_m: None,
            window: None,
            cleaning: None,
        }
    }

    /// Parse from the string form ("GREEN", "B04", "VV_DSPK", "SLOPE")
    pub fn parse(s: &str) -> PipelineResult<Self> {
        Ok(Self::new(s.parse()?))
    }

    pub fn with_resolution(mut self, resolution_m: f64) -> Self {
        self.resolution_m = Some(resolution_m);
        self
    }

    pub fn with_window(mut self, window: PixelWindow) -> Self {
        self.window = Some(window);
        self
    }

    pub fn with_cleaning(mut self, level: CleaningLevel) -> Self {
        self.cleaning = Some(level);
        self
    }
}

/// One row of an optical constellation table
struct OpticalEntry {
    band: SpectralBand,
    native_id: &'static str,
    resolution_m: f64,
}

const SENTINEL2_BANDS: &[OpticalEntry] = &[
    OpticalEntry { band: SpectralBand::CoastalAerosol, native_id: "B01", resolution_m: 60.0 },
    OpticalEntry { band: SpectralBand::Blue, native_id: "B02", resolution_m: 10.0 },
    OpticalEntry { band: SpectralBand::Green, native_id: "B03", resolution_m: 10.0 },
    OpticalEntry { band: SpectralBand::Red, native_id: "B04", resolution_m: 10.0 },
    OpticalEntry { band: SpectralBand::RedEdge1, native_id: "B05", resolution_m: 20.0 },
    OpticalEntry { band: SpectralBand::RedEdge2, native_id: "B06", resolution_m: 20.0 },
    OpticalEntry { band: SpectralBand::RedEdge3, native_id: "B07", resolution_m: 20.0 },
    OpticalEntry { band: SpectralBand::Nir, native_id: "B08", resolution_m: 10.0 },
    OpticalEntry { band: SpectralBand::NarrowNir, native_id: "B8A", resolution_m: 20.0 },
    OpticalEntry { band: SpectralBand::WaterVapour, native_id: "B09", resolution_m: 60.0 },
    OpticalEntry { band: SpectralBand::Cirrus, native_id: "B10", resolution_m: 60.0 },
    OpticalEntry { band: SpectralBand::Swir1, native_id: "B11", resolution_m: 20.0 },
    OpticalEntry { band: SpectralBand::Swir2, native_id: "B12", resolution_m: 20.0 },
];

const LANDSAT8_BANDS: &[OpticalEntry] = &[
    OpticalEntry { band: SpectralBand::CoastalAerosol, native_id: "B1", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Blue, native_id: "B2", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Green, native_id: "B3", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Red, native_id: "B4", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Nir, native_id: "B5", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Swir1, native_id: "B6", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Swir2, native_id: "B7", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Pan, native_id: "B8", resolution_m: 15.0 },
    OpticalEntry { band: SpectralBand::Cirrus, native_id: "B9", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Tir1, native_id: "B10", resolution_m: 30.0 },
    OpticalEntry { band: SpectralBand::Tir2, native_id: "B11", resolution_m: 30.0 },
];

/// Native SAR pixel spacing for Sentinel-1 GRD
const SENTINEL1_RESOLUTION_M: f64 = 10.0;

/// Native resolution of provider cloud masks per constellation
fn mask_resolution_m(constellation: Constellation) -> f64 {
    match constellation {
        Constellation::Sentinel2 => 20.0,
        Constellation::Landsat8 | Constellation::Landsat9 => 30.0,
        Constellation::Sentinel1 => SENTINEL1_RESOLUTION_M,
    }
}

fn optical_table(constellation: Constellation) -> Option<&'static [OpticalEntry]> {
    match constellation {
        Constellation::Sentinel2 => Some(SENTINEL2_BANDS),
        // Landsat-9 carries the OLI-2/TIRS-2 copies of the same bands
        Constellation::Landsat8 | Constellation::Landsat9 => Some(LANDSAT8_BANDS),
        Constellation::Sentinel1 => None,
    }
}

/// The band descriptor registry. Stateless; all tables are static.
pub struct BandRegistry;

impl BandRegistry {
    /// Resolve one abstract band request against a constellation table.
    ///
    /// Fails fast with `UnsupportedBand` for identifiers that are not a
    /// mapped alias, a native id, or a common name for this
    /// constellation. Pure: no side effects.
    pub fn resolve(
        constellation: Constellation,
        request: &BandRequest,
        config: &PipelineConfig,
    ) -> PipelineResult<BandDescriptor> {
        match &request.selector {
            BandSelector::Spectral(band) => {
                Self::resolve_optical(constellation, *band, request, config)
            }
            BandSelector::Sar {
                polarization,
                despeckled,
            } => Self::resolve_sar(constellation, *polarization, *despeckled, request, config),
            BandSelector::Mask(kind) => Self::resolve_mask(constellation, *kind),
            BandSelector::Derivative(kind) => Self::resolve_derivative(constellation, *kind, config),
            BandSelector::Native(id) => Self::resolve_native(constellation, id, request, config),
        }
    }

    /// Batch resolution: request order preserved, duplicates (the same
    /// concrete band reached via different aliases) collapsed so the
    /// pipeline never computes one band twice.
    pub fn resolve_all(
        constellation: Constellation,
        requests: &[BandRequest],
        config: &PipelineConfig,
    ) -> PipelineResult<Vec<BandDescriptor>> {
        let mut out: Vec<BandDescriptor> = Vec::with_capacity(requests.len());
        for request in requests {
            let descriptor = Self::resolve(constellation, request, config)?;
            if !out.iter().any(|d| *d == descriptor) {
                out.push(descriptor);
            }
        }
        Ok(out)
    }

    fn resolve_optical(
        constellation: Constellation,
        band: SpectralBand,
        request: &BandRequest,
        config: &PipelineConfig,
    ) -> PipelineResult<BandDescriptor> {
        let table = optical_table(constellation).ok_or_else(|| {
            Self::unsupported(constellation, &band.to_string())
        })?;
        let entry = table
            .iter()
            .find(|e| e.band == band)
            .ok_or_else(|| Self::unsupported(constellation, &band.to_string()))?;

        let level = request.cleaning.unwrap_or(config.cleaning_level);
        Ok(BandDescriptor {
            label: band.to_string(),
            native_id: entry.native_id.to_string(),
            category: SensorCategory::Optical,
            native_resolution_m: entry.resolution_m,
            resampling: Resampling::Bilinear,
            steps: vec![ProcessingStep::MaskInvalidPixels { level }],
        })
    }

    fn resolve_sar(
        constellation: Constellation,
        polarization: Polarization,
        despeckled: bool,
        request: &BandRequest,
        config: &PipelineConfig,
    ) -> PipelineResult<BandDescriptor> {
        if constellation != Constellation::Sentinel1 {
            let label = if despeckled {
                format!("{}_DSPK", polarization)
            } else {
                polarization.to_string()
            };
            return Err(Self::unsupported(constellation, &label));
        }

        let pixel_size_m = request
            .resolution_m
            .unwrap_or(config.default_resolutions.sar_m);
        // The external tool falls back to its own named DEM when the
        // configuration does not pin one.
        let dem = config
            .dem
            .clone()
            .unwrap_or_else(|| DemReference::Named("SRTM 3Sec".to_string()));

        // Orthorectification always precedes despeckling. The warp is
        // the expensive step; running it on raw calibrated data and
        // caching the result lets every later despeckle variant reuse
        // it. The output is not spectrally identical to
        // despeckle-then-orthorectify; that trade-off is intentional.
        let mut steps = vec![
            ProcessingStep::Calibrate { polarization },
            ProcessingStep::Orthorectify {
                pixel_size_m,
                epsg: config.target_epsg,
                dem,
            },
        ];
        if despeckled {
            steps.push(ProcessingStep::Despeckle {
                filter: config.speckle_filter,
            });
        }
        steps.push(ProcessingStep::MaskInvalidPixels {
            level: CleaningLevel::NodataOnly,
        });

        let label = if despeckled {
            format!("{}_DSPK", polarization)
        } else {
            polarization.to_string()
        };
        Ok(BandDescriptor {
            label,
            native_id: polarization.to_string(),
            category: SensorCategory::Sar,
            native_resolution_m: SENTINEL1_RESOLUTION_M,
            resampling: Resampling::Bilinear,
            steps,
        })
    }

    fn resolve_mask(
        constellation: Constellation,
        kind: MaskKind,
    ) -> PipelineResult<BandDescriptor> {
        if optical_table(constellation).is_none() {
            return Err(Self::unsupported(constellation, &kind.to_string()));
        }
        Ok(BandDescriptor {
            label: kind.to_string(),
            native_id: kind.to_string(),
            category: SensorCategory::CloudMask,
            native_resolution_m: mask_resolution_m(constellation),
            resampling: Resampling::Nearest,
            steps: Vec::new(),
        })
    }

    fn resolve_derivative(
        constellation: Constellation,
        kind: DemDerivative,
        config: &PipelineConfig,
    ) -> PipelineResult<BandDescriptor> {
        let _ = constellation; // derivatives are constellation-independent
        let dem = config.dem.clone().ok_or_else(|| PipelineError::MissingDependency {
            what: format!("DEM-derived band '{}'", kind),
            hint: "set PipelineConfig.dem to a DEM path or URL".to_string(),
        })?;
        if let DemReference::Named(name) = &dem {
            return Err(PipelineError::MissingDependency {
                what: format!("DEM-derived band '{}'", kind),
                hint: format!(
                    "tool-side DEM '{}' is not readable in-process; provide a path or URL",
                    name
                ),
            });
        }
        Ok(BandDescriptor {
            label: kind.to_string(),
            native_id: "DEM".to_string(),
            category: SensorCategory::DemDerived,
            native_resolution_m: config.default_resolutions.dem_m,
            resampling: Resampling::Bilinear,
            steps: vec![ProcessingStep::ComputeDemDerivative { kind, dem }],
        })
    }

    fn resolve_native(
        constellation: Constellation,
        id: &str,
        request: &BandRequest,
        config: &PipelineConfig,
    ) -> PipelineResult<BandDescriptor> {
        if let Some(table) = optical_table(constellation) {
            let normalized = Self::normalize_native_id(constellation, id);
            if let Some(entry) = table.iter().find(|e| e.native_id == normalized) {
                return Self::resolve_optical(constellation, entry.band, request, config);
            }
        }
        Err(Self::unsupported(constellation, id))
    }

    /// Normalize numeric native ids to the constellation's convention,
    /// so "B4" and "B04" both resolve on Sentinel-2.
    fn normalize_native_id(constellation: Constellation, id: &str) -> String {
        let re = Regex::new(r"^B(\d{1,2})(A)?$").unwrap();
        let caps = match re.captures(id) {
            Some(c) => c,
            None => return id.to_string(),
        };
        let number: u32 = caps[1].parse().unwrap_or(0);
        let suffix = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        match constellation {
            Constellation::Sentinel2 => format!("B{:02}{}", number, suffix),
            _ => format!("B{}{}", number, suffix),
        }
    }

    fn unsupported(constellation: Constellation, band: &str) -> PipelineError {
        PipelineError::UnsupportedBand {
            band: band.to_string(),
            constellation: constellation.to_string(),
            accepted: Self::accepted_forms(constellation),
        }
    }

    /// Human-readable list of the identifiers a constellation accepts,
    /// embedded in `UnsupportedBand` errors
    pub fn accepted_forms(constellation: Constellation) -> String {
        match optical_table(constellation) {
            Some(table) => {
                let names: Vec<String> = table
                    .iter()
                    .map(|e| format!("{} ({})", e.band, e.native_id))
                    .collect();
                format!(
                    "{}; CLOUDS, SHADOWS, CIRRUS_CLOUDS, ALL_CLOUDS; SLOPE, ASPECT, HILLSHADE",
                    names.join(", ")
                )
            }
            None => {
                "VV, VH, HV, HH (optionally with _DSPK suffix); SLOPE, ASPECT, HILLSHADE"
                    .to_string()
            }
        }
    }
}
