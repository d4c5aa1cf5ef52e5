//! Preprocessing pipeline orchestrator.
//!
//! One state machine per band request, with the shape fixed by sensor
//! category:
//!
//! - SAR:         Requested -> Calibrating -> Orthorectifying ->
//!                Despeckling -> Masking -> Ready
//! - optical:     Requested -> Reading -> Masking -> Ready
//! - DEM-derived: Requested -> ComputingDerivative -> Ready
//!
//! Each cacheable boundary is fingerprinted; a hit jumps the machine
//! forward using the cached artifact as input. For SAR the committed
//! boundaries are the orthorectified artifact (calibration output is
//! an uncommitted intermediate consumed immediately) and the optional
//! despeckled artifact on top of it.
//!
//! Orthorectification always runs before despeckling. The warp is the
//! expensive step; caching its output lets every despeckle variant and
//! every non-despeckled request reuse it. The result is not spectrally
//! identical to despeckle-then-orthorectify; that approximation is
//! deliberate and must not be "fixed" here.

use crate::cache::{CacheKey, CacheStore};
use crate::config::PipelineConfig;
use crate::core::{collocate, dem_derivative, mask};
use crate::io::{DemProvider, GdalRasterSource, GraphTool, RasterSource, SnapGraphAdapter};
use crate::registry::{BandRegistry, BandRequest};
use crate::types::*;
use ndarray::Array2;
use std::path::Path;
use std::sync::Arc;

/// Observable states of one band's processing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Requested,
    Reading,
    Calibrating,
    Orthorectifying,
    Despeckling,
    Masking,
    ComputingDerivative,
    Ready,
}

/// One deduplicated unit of work: a descriptor plus the concrete read
/// parameters derived from the request and the configuration defaults
#[derive(Debug, Clone, PartialEq)]
struct BandPlan {
    descriptor: BandDescriptor,
    resolution_m: f64,
    window: Option<PixelWindow>,
}

/// The band resolution and preprocessing pipeline
pub struct BandPipeline {
    config: PipelineConfig,
    cache: Arc<CacheStore>,
    raster: Arc<dyn RasterSource>,
    tool: Arc<dyn GraphTool>,
    dem_provider: DemProvider,
}

impl BandPipeline {
    pub fn new(
        config: PipelineConfig,
        raster: Arc<dyn RasterSource>,
        tool: Arc<dyn GraphTool>,
    ) -> PipelineResult<Self> {
        let cache = Arc::new(CacheStore::new(&config.cache_dir, config.persist_cache)?);
        let dem_provider = DemProvider::new(&config.cache_dir);
        Ok(Self {
            config,
            cache,
            raster,
            tool,
            dem_provider,
        })
    }

    /// Production constructor: GDAL raster I/O plus a graph-tool
    /// adapter built from `tool_path`, `graph_templates` and
    /// `tool_timeout`
    pub fn from_config(config: PipelineConfig) -> PipelineResult<Self> {
        let templates = config
            .graph_templates
            .clone()
            .ok_or_else(|| PipelineError::MissingDependency {
                what: "external graph tool adapter".to_string(),
                hint: "set PipelineConfig.graph_templates to the processing-graph files"
                    .to_string(),
            })?;
        let tool = SnapGraphAdapter::new(&config.tool_path, templates, config.tool_timeout);
        Self::new(config, Arc::new(GdalRasterSource::new()), Arc::new(tool))
    }

    pub fn cache(&self) -> &CacheStore {
        &self.cache
    }

    /// Resolve and compute a set of band requests. Bands come back in
    /// request order with duplicates collapsed, regardless of the
    /// completion order of any parallel execution underneath.
    pub fn load(
        &self,
        product: &Product,
        requests: &[BandRequest],
    ) -> PipelineResult<Vec<ResolvedBand>> {
        let (plans, _) = self.plan(product, requests)?;
        self.compute_plans(product, &plans)
    }

    /// Load, collocate and merge a set of band requests into one
    /// multi-band array on a single reference grid
    pub fn stack(
        &self,
        product: &Product,
        requests: &[BandRequest],
        reference: Option<&GridSpec>,
    ) -> PipelineResult<MultiBandArray> {
        let (plans, request_to_plan) = self.plan(product, requests)?;
        let computed = self.compute_plans(product, &plans)?;

        // Re-expand to request order (including duplicates) so the
        // stacking rules see every requested position
        let in_request_order: Vec<ResolvedBand> = request_to_plan
            .iter()
            .map(|&idx| computed[idx].clone())
            .collect();

        let collocated = collocate::collocate(in_request_order, reference)?;
        collocate::stack(collocated)
    }

    /// Drop every cached artifact of a product
    pub fn invalidate(&self, product: &Product) -> PipelineResult<()> {
        self.cache.invalidate(&product.id)
    }

    /// Dispose of a product's temporary workspace, honoring the
    /// persistent-retention opt-in
    pub fn teardown(&self, product: &Product) -> PipelineResult<()> {
        self.cache.teardown(&product.id)
    }

    /// Resolve requests to deduplicated plans plus the request->plan
    /// index map. The same concrete band requested twice (under any
    /// alias) is planned once.
    fn plan(
        &self,
        product: &Product,
        requests: &[BandRequest],
    ) -> PipelineResult<(Vec<BandPlan>, Vec<usize>)> {
        let mut plans: Vec<BandPlan> = Vec::with_capacity(requests.len());
        let mut request_to_plan = Vec::with_capacity(requests.len());
        for request in requests {
            let descriptor = BandRegistry::resolve(product.constellation, request, &self.config)?;
            let resolution_m = request
                .resolution_m
                .unwrap_or_else(|| self.config.default_resolutions.for_category(descriptor.category));
            let plan = BandPlan {
                descriptor,
                resolution_m,
                window: request.window,
            };
            match plans.iter().position(|p| *p == plan) {
                Some(idx) => request_to_plan.push(idx),
                None => {
                    plans.push(plan);
                    request_to_plan.push(plans.len() - 1);
                }
            }
        }
        Ok((plans, request_to_plan))
    }

    fn compute_plans(
        &self,
        product: &Product,
        plans: &[BandPlan],
    ) -> PipelineResult<Vec<ResolvedBand>> {
        if self.config.parallel && plans.len() > 1 {
            use rayon::prelude::*;
            plans
                .par_iter()
                .map(|plan| self.resolve_band(product, plan))
                .collect()
        } else {
            plans
                .iter()
                .map(|plan| self.resolve_band(product, plan))
                .collect()
        }
    }

    fn resolve_band(&self, product: &Product, plan: &BandPlan) -> PipelineResult<ResolvedBand> {
        let label = plan.descriptor.label.clone();
        Self::enter(&label, PipelineState::Requested);
        let raster = match plan.descriptor.category {
            SensorCategory::Optical => self.resolve_optical(product, plan)?,
            SensorCategory::CloudMask => self.resolve_cloud_mask(product, plan)?,
            SensorCategory::Sar => self.resolve_sar(product, plan)?,
            SensorCategory::DemDerived => self.resolve_derivative(product, plan)?,
        };
        Self::enter(&label, PipelineState::Ready);
        Ok(ResolvedBand {
            name: label,
            category: plan.descriptor.category,
            resampling: plan.descriptor.resampling,
            raster,
        })
    }

    // ───────────────────────── optical ─────────────────────────

    fn resolve_optical(&self, product: &Product, plan: &BandPlan) -> PipelineResult<RasterData> {
        let d = &plan.descriptor;
        let key = CacheKey::new(
            &product.id,
            &d.native_id,
            &d.steps,
            Some(plan.resolution_m),
            plan.window,
        );
        let lock = self.cache.key_lock(&key);
        let _guard = lock.lock().unwrap();

        // Artifact formats carry no unit note, so it is restated on
        // hits as well as fresh computes
        if let Some(entry) = self.cache.lookup(&product.id, &key) {
            let mut band = self.raster.read(&entry.path, None, None)?;
            band.unit = "reflectance".to_string();
            return Ok(band);
        }

        Self::enter(&d.label, PipelineState::Reading);
        let path = product.band_path(&d.native_id)?;
        let mut band = self
            .raster
            .read(path, plan.window, Some(plan.resolution_m))?;
        band.unit = "reflectance".to_string();

        Self::enter(&d.label, PipelineState::Masking);
        let level = d
            .steps
            .iter()
            .find_map(|s| match s {
                ProcessingStep::MaskInvalidPixels { level } => Some(*level),
                _ => None,
            })
            .unwrap_or_default();
        if level != CleaningLevel::Raw {
            let flags = self.read_flags(product, mask::flags_for_level(level), &band.grid, false)?;
            mask::apply_cleaning(&mut band, &flags)?;
        }

        self.commit(product, &key, &band)?;
        Ok(band)
    }

    fn resolve_cloud_mask(&self, product: &Product, plan: &BandPlan) -> PipelineResult<RasterData> {
        let d = &plan.descriptor;
        let kind = match d.label.as_str() {
            "CLOUDS" => MaskKind::Clouds,
            "SHADOWS" => MaskKind::Shadows,
            "CIRRUS_CLOUDS" => MaskKind::Cirrus,
            _ => MaskKind::AllClouds,
        };
        let key = CacheKey::new(
            &product.id,
            &d.native_id,
            &d.steps,
            Some(plan.resolution_m),
            plan.window,
        );
        let lock = self.cache.key_lock(&key);
        let _guard = lock.lock().unwrap();

        if let Some(entry) = self.cache.lookup(&product.id, &key) {
            let mut band = self.raster.read(&entry.path, None, None)?;
            band.unit = "flag".to_string();
            return Ok(band);
        }

        Self::enter(&d.label, PipelineState::Reading);
        // Flag rasters share the product grid, so the requested window
        // and resolution apply to them directly
        let mut grid: Option<GridSpec> = None;
        let mut arrays: Vec<Array2<f32>> = Vec::new();
        for flag_kind in mask::flags_for_mask(kind) {
            let path = product.flag_paths.get(flag_kind).ok_or_else(|| {
                PipelineError::InvalidFormat(format!(
                    "product '{}' carries no {:?} flag raster required by band '{}'",
                    product.id, flag_kind, d.label
                ))
            })?;
            let raw = self
                .raster
                .read(path, plan.window, Some(plan.resolution_m))?;
            let target = *grid.get_or_insert(raw.grid);
            let aligned = if raw.grid.matches(&target) {
                raw
            } else {
                collocate::resample_to_grid(&raw, &target, Resampling::Nearest)?
            };
            arrays.push(aligned.data);
        }
        let grid = grid.ok_or_else(|| {
            PipelineError::Processing(format!("band '{}' maps to no flag rasters", d.label))
        })?;
        let combined = mask::binarize(&arrays)?;
        let band = RasterData::new(combined, grid, NODATA, "flag");

        self.commit(product, &key, &band)?;
        Ok(band)
    }

    // ─────────────────────────── SAR ───────────────────────────

    fn resolve_sar(&self, product: &Product, plan: &BandPlan) -> PipelineResult<RasterData> {
        let d = &plan.descriptor;
        let calibrate = d
            .steps
            .iter()
            .find(|s| matches!(s, ProcessingStep::Calibrate { .. }))
            .ok_or_else(|| Self::malformed_chain(d))?;
        let orthorectify = d
            .steps
            .iter()
            .find(|s| matches!(s, ProcessingStep::Orthorectify { .. }))
            .ok_or_else(|| Self::malformed_chain(d))?;
        let despeckle = d
            .steps
            .iter()
            .find(|s| matches!(s, ProcessingStep::Despeckle { .. }));

        // Boundary 1: calibrated + orthorectified artifact, shared by
        // every variant of this polarization
        let ortho_prefix = [calibrate.clone(), orthorectify.clone()];
        let ortho_key = CacheKey::new(
            &product.id,
            &d.native_id,
            &ortho_prefix,
            Some(plan.resolution_m),
            plan.window,
        );
        let ortho_path = {
            let lock = self.cache.key_lock(&ortho_key);
            let _guard = lock.lock().unwrap();
            match self.cache.lookup(&product.id, &ortho_key) {
                Some(entry) => entry.path,
                None => {
                    let work = self.cache.work_dir(&product.id)?;

                    Self::enter(&d.label, PipelineState::Calibrating);
                    let input = product.band_path(&d.native_id)?;
                    // Keyed like the artifact it feeds: two plans for
                    // one polarization at different resolutions or
                    // windows run concurrently and must not share a
                    // scratch file
                    let calibrated = work.join(format!("cal_{:016x}.tif", ortho_key.hash()));
                    self.run_calibrate(calibrate, d, product, input, &calibrated)?;

                    Self::enter(&d.label, PipelineState::Orthorectifying);
                    let ortho_out = work.join(ortho_key.file_name());
                    self.tool.run(
                        orthorectify,
                        &d.label,
                        &product.id,
                        &calibrated,
                        &ortho_out,
                        false,
                    )?;
                    let _ = std::fs::remove_file(&calibrated);

                    match self.cache.store(&product.id, &ortho_key, &ortho_out) {
                        Some(entry) => entry.path,
                        None => ortho_out, // degraded: no cache this session
                    }
                }
            }
        };

        // Boundary 2: the optional despeckled artifact on top of the
        // orthorectified one
        let final_path = match despeckle {
            None => ortho_path,
            Some(step) => {
                let prefix = [calibrate.clone(), orthorectify.clone(), step.clone()];
                let key = CacheKey::new(
                    &product.id,
                    &d.native_id,
                    &prefix,
                    Some(plan.resolution_m),
                    plan.window,
                );
                let lock = self.cache.key_lock(&key);
                let _guard = lock.lock().unwrap();
                match self.cache.lookup(&product.id, &key) {
                    Some(entry) => entry.path,
                    None => {
                        Self::enter(&d.label, PipelineState::Despeckling);
                        let work = self.cache.work_dir(&product.id)?;
                        let out = work.join(key.file_name());
                        self.tool
                            .run(step, &d.label, &product.id, &ortho_path, &out, false)?;
                        match self.cache.store(&product.id, &key, &out) {
                            Some(entry) => entry.path,
                            None => out,
                        }
                    }
                }
            }
        };

        Self::enter(&d.label, PipelineState::Masking);
        let mut band = self.raster.read(&final_path, None, None)?;
        // The external tool emits a fixed nodata convention (0) for
        // SAR outputs; remap it so valid zero never aliases nodata
        mask::remap_nodata(&mut band, 0.0);
        band.unit = "linear_power".to_string();
        Ok(band)
    }

    /// Calibration with the one documented, bounded fallback: on an
    /// execution failure, retry once with the no-calibration parameter
    /// set when the configuration allows it. Never silent.
    fn run_calibrate(
        &self,
        step: &ProcessingStep,
        descriptor: &BandDescriptor,
        product: &Product,
        input: &Path,
        output: &Path,
    ) -> PipelineResult<()> {
        match self
            .tool
            .run(step, &descriptor.label, &product.id, input, output, false)
        {
            Err(err @ PipelineError::ToolExecution { .. }) if self.config.calibration_fallback => {
                log::warn!(
                    "calibration failed for band '{}' of product '{}' ({}); \
                     retrying once with the no-calibration fallback",
                    descriptor.label,
                    product.id,
                    err
                );
                self.tool
                    .run(step, &descriptor.label, &product.id, input, output, true)
            }
            other => other,
        }
    }

    fn malformed_chain(descriptor: &BandDescriptor) -> PipelineError {
        PipelineError::Processing(format!(
            "SAR descriptor '{}' is missing a required processing step",
            descriptor.label
        ))
    }

    // ─────────────────────── DEM-derived ───────────────────────

    fn resolve_derivative(&self, product: &Product, plan: &BandPlan) -> PipelineResult<RasterData> {
        let d = &plan.descriptor;
        let (kind, dem) = d
            .steps
            .iter()
            .find_map(|s| match s {
                ProcessingStep::ComputeDemDerivative { kind, dem } => Some((*kind, dem.clone())),
                _ => None,
            })
            .ok_or_else(|| {
                PipelineError::Processing(format!(
                    "DEM-derived descriptor '{}' has no derivative step",
                    d.label
                ))
            })?;

        let key = CacheKey::new(
            &product.id,
            &d.native_id,
            &d.steps,
            Some(plan.resolution_m),
            plan.window,
        );
        let lock = self.cache.key_lock(&key);
        let _guard = lock.lock().unwrap();

        if let Some(entry) = self.cache.lookup(&product.id, &key) {
            let mut band = self.raster.read(&entry.path, None, None)?;
            band.unit = match kind {
                DemDerivative::Slope | DemDerivative::Aspect => "deg",
                DemDerivative::Hillshade => "1",
            }
            .to_string();
            return Ok(band);
        }

        Self::enter(&d.label, PipelineState::ComputingDerivative);
        // Resolve the DEM before anything touches the cache so a
        // missing DEM leaves no partial artifact behind
        let dem_path = self.dem_provider.resolve(&dem)?;
        let dem_raster = self.raster.read(&dem_path, None, Some(plan.resolution_m))?;
        let band = dem_derivative::compute(kind, &dem_raster)?;

        self.commit(product, &key, &band)?;
        Ok(band)
    }

    // ───────────────────────── shared ──────────────────────────

    /// Read the flag rasters for a cleaning level, resampled (nearest)
    /// onto the band grid. Flags the product does not ship are skipped
    /// unless `required`.
    fn read_flags(
        &self,
        product: &Product,
        kinds: &[FlagKind],
        grid: &GridSpec,
        required: bool,
    ) -> PipelineResult<Vec<Array2<f32>>> {
        let mut flags = Vec::new();
        for kind in kinds {
            let path = match product.flag_paths.get(kind) {
                Some(p) => p,
                None if required => {
                    return Err(PipelineError::InvalidFormat(format!(
                        "product '{}' carries no {:?} flag raster",
                        product.id, kind
                    )))
                }
                None => {
                    log::debug!("product '{}' ships no {:?} flag, skipping", product.id, kind);
                    continue;
                }
            };
            let raw = self.raster.read(path, None, None)?;
            let aligned = collocate::resample_to_grid(&raw, grid, Resampling::Nearest)?;
            flags.push(aligned.data);
        }
        Ok(flags)
    }

    /// Write one computed raster into the product's scratch area and
    /// commit it under its key. A degraded (non-persisting) cache is
    /// not an error.
    fn commit(&self, product: &Product, key: &CacheKey, raster: &RasterData) -> PipelineResult<()> {
        let work = self.cache.work_dir(&product.id)?;
        let scratch = work.join(format!("wip_{}", key.file_name()));
        self.raster.write(&scratch, raster)?;
        self.cache.store(&product.id, key, &scratch);
        Ok(())
    }

    fn enter(label: &str, state: PipelineState) {
        log::debug!("band '{}' entering state {:?}", label, state);
    }
}
