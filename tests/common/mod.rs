//! Shared test fixtures: a flat-binary raster source that needs no
//! geospatial driver, a recording graph tool with deterministic marker
//! arithmetic, and product builders.
#![allow(dead_code)]

use eoband::core::resample_to_grid;
use eoband::io::{GraphTool, RasterSource};
use eoband::types::{
    Constellation, FlagKind, GeoTransform, GridSpec, PipelineError, PipelineResult, PixelWindow,
    ProcessingStep, Product, RasterData, Resampling, NODATA,
};
use eoband::PipelineConfig;
use ndarray::Array2;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

const MAGIC: &[u8; 4] = b"EOBF";

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Serialize one raster plane to the flat test format:
/// magic, shape, epsg, nodata, affine transform, unit, then row-major
/// little-endian f32 samples
pub fn write_flat(path: &Path, raster: &RasterData) -> PipelineResult<()> {
    let mut file = File::create(path)?;
    file.write_all(MAGIC)?;
    file.write_all(&(raster.grid.width as u64).to_le_bytes())?;
    file.write_all(&(raster.grid.height as u64).to_le_bytes())?;
    file.write_all(&raster.grid.epsg.to_le_bytes())?;
    file.write_all(&raster.nodata.to_le_bytes())?;
    for v in raster.grid.transform.to_gdal() {
        file.write_all(&v.to_le_bytes())?;
    }
    let unit = raster.unit.as_bytes();
    file.write_all(&(unit.len() as u32).to_le_bytes())?;
    file.write_all(unit)?;
    for v in raster.data.iter() {
        file.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

pub fn read_flat(path: &Path) -> PipelineResult<RasterData> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;
    let bad = |msg: &str| PipelineError::InvalidFormat(format!("{}: {}", path.display(), msg));
    if bytes.len() < 4 || &bytes[..4] != MAGIC {
        return Err(bad("not a flat test raster"));
    }
    fn take<'a>(bytes: &'a [u8], at: &mut usize, n: usize) -> Option<&'a [u8]> {
        let slice = bytes.get(*at..at.checked_add(n)?)?;
        *at += n;
        Some(slice)
    }
    let mut at = 4usize;
    let mut next = |n: usize| take(&bytes, &mut at, n).ok_or_else(|| bad("truncated file"));
    let width = u64::from_le_bytes(next(8)?.try_into().unwrap()) as usize;
    let height = u64::from_le_bytes(next(8)?.try_into().unwrap()) as usize;
    let epsg = u32::from_le_bytes(next(4)?.try_into().unwrap());
    let nodata = f32::from_le_bytes(next(4)?.try_into().unwrap());
    let mut gt = [0f64; 6];
    for v in gt.iter_mut() {
        *v = f64::from_le_bytes(next(8)?.try_into().unwrap());
    }
    let unit_len = u32::from_le_bytes(next(4)?.try_into().unwrap()) as usize;
    let unit = String::from_utf8(next(unit_len)?.to_vec())
        .map_err(|_| bad("unit is not valid UTF-8"))?;
    let mut samples = Vec::with_capacity(width * height);
    for _ in 0..width * height {
        samples.push(f32::from_le_bytes(next(4)?.try_into().unwrap()));
    }
    let data = Array2::from_shape_vec((height, width), samples)
        .map_err(|_| bad("sample count does not match shape"))?;
    let grid = GridSpec::new(GeoTransform::from_gdal(&gt), width, height, epsg);
    Ok(RasterData::new(data, grid, nodata, unit))
}

/// Raster source over the flat test format. Windows crop at native
/// resolution; a target resolution resamples (nearest) over the same
/// extent, mirroring the production source's decimated read.
pub struct FlatRasterSource;

impl RasterSource for FlatRasterSource {
    fn read(
        &self,
        path: &Path,
        window: Option<PixelWindow>,
        target_resolution_m: Option<f64>,
    ) -> PipelineResult<RasterData> {
        let mut raster = read_flat(path)?;
        if let Some(w) = window {
            if w.col_off + w.width > raster.grid.width || w.row_off + w.height > raster.grid.height
            {
                return Err(PipelineError::InvalidFormat(format!(
                    "window {:?} exceeds raster {}x{}",
                    w, raster.grid.width, raster.grid.height
                )));
            }
            let data = raster
                .data
                .slice(ndarray::s![
                    w.row_off..w.row_off + w.height,
                    w.col_off..w.col_off + w.width
                ])
                .to_owned();
            let (origin_x, origin_y) = raster
                .grid
                .transform
                .apply(w.col_off as f64, w.row_off as f64);
            let transform = GeoTransform {
                top_left_x: origin_x,
                top_left_y: origin_y,
                ..raster.grid.transform
            };
            raster = RasterData::new(
                data,
                GridSpec::new(transform, w.width, w.height, raster.grid.epsg),
                raster.nodata,
                raster.unit,
            );
        }
        if let Some(res) = target_resolution_m {
            let (px, _) = raster.grid.pixel_size();
            if (px - res).abs() > 1e-9 {
                let target = raster.grid.with_pixel_size(res);
                raster = resample_to_grid(&raster, &target, Resampling::Nearest)?;
            }
        }
        Ok(raster)
    }

    fn write(&self, path: &Path, raster: &RasterData) -> PipelineResult<()> {
        write_flat(path, raster)
    }
}

/// Like `FlatRasterSource`, but reads come back without a unit, the
/// way a GeoTIFF artifact does. Lets tests check that the pipeline
/// restates units itself instead of trusting the file.
pub struct UnitlessRasterSource(pub FlatRasterSource);

impl RasterSource for UnitlessRasterSource {
    fn read(
        &self,
        path: &Path,
        window: Option<PixelWindow>,
        target_resolution_m: Option<f64>,
    ) -> PipelineResult<RasterData> {
        let mut raster = self.0.read(path, window, target_resolution_m)?;
        raster.unit = String::new();
        Ok(raster)
    }

    fn write(&self, path: &Path, raster: &RasterData) -> PipelineResult<()> {
        self.0.write(path, raster)
    }
}

/// Graph tool double: records every invocation and applies a
/// per-step multiplicative marker so outputs are predictable and the
/// tool's zero-nodata convention is preserved.
pub struct RecordingGraphTool {
    calls: Mutex<Vec<(String, bool, PathBuf)>>,
    fail_calibration: AtomicBool,
}

impl RecordingGraphTool {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            fail_calibration: AtomicBool::new(false),
        }
    }

    /// Make every non-fallback calibration attempt fail
    pub fn fail_calibration(&self) {
        self.fail_calibration.store(true, Ordering::SeqCst);
    }

    pub fn invocations(&self, step_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == step_name)
            .count()
    }

    pub fn fallback_invocations(&self, step_name: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, fallback, _)| name == step_name && *fallback)
            .count()
    }

    /// Output paths each invocation of one step wrote to
    pub fn output_paths(&self, step_name: &str) -> Vec<PathBuf> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(name, _, _)| name == step_name)
            .map(|(_, _, output)| output.clone())
            .collect()
    }

    fn marker(step: &ProcessingStep) -> f32 {
        match step {
            ProcessingStep::Calibrate { .. } => 2.0,
            ProcessingStep::Orthorectify { .. } => 3.0,
            ProcessingStep::Despeckle { .. } => 0.5,
            _ => 1.0,
        }
    }
}

impl GraphTool for RecordingGraphTool {
    fn run(
        &self,
        step: &ProcessingStep,
        band: &str,
        product: &str,
        input: &Path,
        output: &Path,
        fallback: bool,
    ) -> PipelineResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((step.name().to_string(), fallback, output.to_path_buf()));
        if matches!(step, ProcessingStep::Calibrate { .. })
            && !fallback
            && self.fail_calibration.load(Ordering::SeqCst)
        {
            return Err(PipelineError::ToolExecution {
                step: step.name().to_string(),
                band: band.to_string(),
                product: product.to_string(),
                message: "simulated tool failure".to_string(),
            });
        }
        let mut raster = read_flat(input)?;
        let marker = Self::marker(step);
        raster.data.mapv_inplace(|v| v * marker);
        write_flat(output, &raster)
    }
}

pub fn grid(width: usize, height: usize, pixel: f64, epsg: u32) -> GridSpec {
    GridSpec::new(
        GeoTransform::from_origin(500_000.0, 4_600_000.0, pixel, pixel),
        width,
        height,
        epsg,
    )
}

pub fn raster_with(grid: GridSpec, f: impl Fn(usize, usize) -> f32) -> RasterData {
    let data = Array2::from_shape_fn((grid.height, grid.width), |(r, c)| f(r, c));
    RasterData::new(data, grid, NODATA, "test")
}

pub fn test_config(cache_dir: &Path) -> PipelineConfig {
    let mut config = PipelineConfig::with_cache_dir(cache_dir);
    config.parallel = false;
    config
}

/// A small Sentinel-2 product: GREEN (B03) and RED (B04) at 10 m plus
/// nodata and cloud flag rasters
pub fn make_s2_product(dir: &Path) -> PipelineResult<Product> {
    let band_grid = grid(8, 8, 10.0, 32633);
    let mut band_paths = HashMap::new();
    for (native, base) in [("B03", 0.1f32), ("B04", 0.2f32)] {
        let path = dir.join(format!("{}.bin", native));
        let raster = raster_with(band_grid, |r, c| base + (r * 8 + c) as f32 * 0.001);
        write_flat(&path, &raster)?;
        band_paths.insert(native.to_string(), path);
    }

    let mut flag_paths = HashMap::new();
    // Nodata flag marks the top-left pixel; cloud flag the bottom-right
    let nodata_path = dir.join("flag_nodata.bin");
    write_flat(
        &nodata_path,
        &raster_with(band_grid, |r, c| if r == 0 && c == 0 { 1.0 } else { 0.0 }),
    )?;
    flag_paths.insert(FlagKind::Nodata, nodata_path);
    let cloud_path = dir.join("flag_cloud.bin");
    write_flat(
        &cloud_path,
        &raster_with(band_grid, |r, c| if r == 7 && c == 7 { 1.0 } else { 0.0 }),
    )?;
    flag_paths.insert(FlagKind::Cloud, cloud_path);

    Ok(Product {
        id: "S2A_TEST_0001".to_string(),
        constellation: Constellation::Sentinel2,
        band_paths,
        flag_paths,
    })
}

/// A small Sentinel-1 product with one VV measurement. Pixel (0, 0)
/// carries the tool's zero nodata convention.
pub fn make_s1_product(dir: &Path) -> PipelineResult<Product> {
    let band_grid = grid(8, 8, 10.0, 32633);
    let path = dir.join("vv.bin");
    let raster = raster_with(band_grid, |r, c| {
        if r == 0 && c == 0 {
            0.0
        } else {
            1.0 + (r * 8 + c) as f32
        }
    });
    write_flat(&path, &raster)?;
    let mut band_paths = HashMap::new();
    band_paths.insert("VV".to_string(), path);

    Ok(Product {
        id: "S1A_TEST_0001".to_string(),
        constellation: Constellation::Sentinel1,
        band_paths,
        flag_paths: HashMap::new(),
    })
}

pub fn dem_file(dir: &Path) -> PipelineResult<PathBuf> {
    let dem_grid = grid(8, 8, 30.0, 32633);
    // Plane rising east at 0.5 m per meter
    let raster = raster_with(dem_grid, |_, c| c as f32 * 15.0);
    let path = dir.join("dem.bin");
    write_flat(&path, &raster)?;
    Ok(path)
}
