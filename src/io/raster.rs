//! Raster read/write seam.
//!
//! The pipeline never touches raw bytes: everything goes through
//! `RasterSource`, with a GDAL-backed implementation for production
//! and test doubles behind the same trait.

use crate::types::{
    GeoTransform, GridSpec, PipelineError, PipelineResult, PixelWindow, RasterData,
    METERS_PER_DEGREE, NODATA,
};
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// Narrow contract for raster I/O. `read` applies an optional pixel
/// window and target resolution; `write` persists one plane with its
/// grid and nodata value.
pub trait RasterSource: Send + Sync {
    fn read(
        &self,
        path: &Path,
        window: Option<PixelWindow>,
        target_resolution_m: Option<f64>,
    ) -> PipelineResult<RasterData>;

    fn write(&self, path: &Path, raster: &RasterData) -> PipelineResult<()>;
}

/// Production raster source backed by GDAL
pub struct GdalRasterSource;

impl GdalRasterSource {
    pub fn new() -> Self {
        Self
    }
}

impl Default for GdalRasterSource {
    fn default() -> Self {
        Self::new()
    }
}

impl RasterSource for GdalRasterSource {
    fn read(
        &self,
        path: &Path,
        window: Option<PixelWindow>,
        target_resolution_m: Option<f64>,
    ) -> PipelineResult<RasterData> {
        log::debug!("reading raster: {}", path.display());

        let dataset = Dataset::open(path)?;
        let geo_transform = dataset.geo_transform()?;
        let transform = GeoTransform::from_gdal(&geo_transform);
        let (full_width, full_height) = dataset.raster_size();

        let epsg = dataset
            .spatial_ref()
            .ok()
            .and_then(|sr| sr.auth_code().ok())
            .unwrap_or(0) as u32;

        let win = window.unwrap_or(PixelWindow {
            col_off: 0,
            row_off: 0,
            width: full_width,
            height: full_height,
        });
        if win.col_off + win.width > full_width || win.row_off + win.height > full_height {
            return Err(PipelineError::InvalidFormat(format!(
                "window {:?} exceeds raster size {}x{} ({})",
                win,
                full_width,
                full_height,
                path.display()
            )));
        }

        // Pixel size in meters, converting degree grids for the
        // resolution arithmetic
        let native_m = if epsg == 4326 {
            transform.pixel_width.abs() * METERS_PER_DEGREE
        } else {
            transform.pixel_width.abs()
        };
        let (out_width, out_height) = match target_resolution_m {
            Some(res) if res > 0.0 => {
                let factor = native_m / res;
                (
                    ((win.width as f64) * factor).round().max(1.0) as usize,
                    ((win.height as f64) * factor).round().max(1.0) as usize,
                )
            }
            _ => (win.width, win.height),
        };

        let rasterband = dataset.rasterband(1)?;
        let nodata = rasterband.no_data_value().map(|v| v as f32).unwrap_or(NODATA);
        let buffer = rasterband.read_as::<f32>(
            (win.col_off as isize, win.row_off as isize),
            (win.width, win.height),
            (out_width, out_height),
            None,
        )?;
        let data = Array2::from_shape_vec((out_height, out_width), buffer.data).map_err(|e| {
            PipelineError::Processing(format!("failed to reshape raster data: {}", e))
        })?;

        let (origin_x, origin_y) = transform.apply(win.col_off as f64, win.row_off as f64);
        let scale_x = win.width as f64 / out_width as f64;
        let scale_y = win.height as f64 / out_height as f64;
        let grid = GridSpec::new(
            GeoTransform::from_origin(
                origin_x,
                origin_y,
                transform.pixel_width.abs() * scale_x,
                transform.pixel_height.abs() * scale_y,
            ),
            out_width,
            out_height,
            epsg,
        );

        Ok(RasterData::new(data, grid, nodata, ""))
    }

    fn write(&self, path: &Path, raster: &RasterData) -> PipelineResult<()> {
        log::debug!("writing raster: {}", path.display());

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (height, width) = raster.data.dim();

        let mut dataset =
            driver.create_with_band_type::<f32, _>(path, width as isize, height as isize, 1)?;
        dataset.set_geo_transform(&raster.grid.transform.to_gdal())?;
        if raster.grid.epsg != 0 {
            dataset.set_spatial_ref(&gdal::spatial_ref::SpatialRef::from_epsg(raster.grid.epsg)?)?;
        }

        let mut rasterband = dataset.rasterband(1)?;
        let flat_data: Vec<f32> = raster.data.iter().cloned().collect();
        let buffer = gdal::raster::Buffer::new((width, height), flat_data);
        rasterband.write((0, 0), (width, height), &buffer)?;
        rasterband.set_no_data_value(Some(raster.nodata as f64))?;

        Ok(())
    }
}
