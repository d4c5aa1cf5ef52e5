//! DEM derivatives: slope, aspect and hillshade computed from an
//! elevation raster with Horn's 3x3 kernel.
//!
//! Border pixels and any pixel with a nodata neighbor come out as the
//! nodata sentinel.

use crate::types::{
    DemDerivative, GridSpec, PipelineResult, RasterData, METERS_PER_DEGREE, NODATA,
};
use ndarray::Array2;

/// Sun position for hillshading (compass azimuth / elevation, degrees)
const SUN_AZIMUTH_DEG: f64 = 315.0;
const SUN_ELEVATION_DEG: f64 = 45.0;

/// Compute one derivative of an elevation raster
pub fn compute(kind: DemDerivative, dem: &RasterData) -> PipelineResult<RasterData> {
    log::info!("computing {} from DEM ({}x{})", kind, dem.grid.width, dem.grid.height);

    let (px, py) = pixel_size_meters(&dem.grid);
    let (height, width) = dem.data.dim();
    let mut out = Array2::from_elem((height, width), NODATA);

    for row in 1..height.saturating_sub(1) {
        for col in 1..width.saturating_sub(1) {
            let (p, q) = match gradient(&dem.data, dem.nodata, row, col, px, py) {
                Some(g) => g,
                None => continue,
            };
            out[[row, col]] = match kind {
                DemDerivative::Slope => slope_deg(p, q),
                DemDerivative::Aspect => aspect_deg(p, q),
                DemDerivative::Hillshade => hillshade(p, q),
            };
        }
    }

    let unit = match kind {
        DemDerivative::Slope | DemDerivative::Aspect => "deg",
        DemDerivative::Hillshade => "1",
    };
    Ok(RasterData::new(out, dem.grid, NODATA, unit))
}

/// Pixel size in meters, converting degree grids
fn pixel_size_meters(grid: &GridSpec) -> (f64, f64) {
    let (px, py) = grid.pixel_size();
    if grid.epsg == 4326 {
        (px * METERS_PER_DEGREE, py * METERS_PER_DEGREE)
    } else {
        (px, py)
    }
}

/// Horn gradient (dz/dx, dz/dy) over the 3x3 neighborhood, or None if
/// any neighbor is nodata
fn gradient(
    z: &Array2<f32>,
    nodata: f32,
    row: usize,
    col: usize,
    px: f64,
    py: f64,
) -> Option<(f64, f64)> {
    let mut w = [[0.0f64; 3]; 3];
    for (i, wr) in w.iter_mut().enumerate() {
        for (j, v) in wr.iter_mut().enumerate() {
            let value = z[[row + i - 1, col + j - 1]];
            if value == nodata || !value.is_finite() {
                return None;
            }
            *v = value as f64;
        }
    }
    let p = ((w[0][2] + 2.0 * w[1][2] + w[2][2]) - (w[0][0] + 2.0 * w[1][0] + w[2][0])) / (8.0 * px);
    let q = ((w[2][0] + 2.0 * w[2][1] + w[2][2]) - (w[0][0] + 2.0 * w[0][1] + w[0][2])) / (8.0 * py);
    Some((p, q))
}

fn slope_deg(p: f64, q: f64) -> f32 {
    (p * p + q * q).sqrt().atan().to_degrees() as f32
}

/// Compass aspect: degrees clockwise from north, downslope direction.
/// Flat cells report 0.
fn aspect_deg(p: f64, q: f64) -> f32 {
    if p == 0.0 && q == 0.0 {
        return 0.0;
    }
    // Downslope direction: east component -p, north component q
    // (rows grow southward)
    let mut deg = (-p).atan2(q).to_degrees();
    if deg < 0.0 {
        deg += 360.0;
    }
    deg as f32
}

/// Hillshade in [0, 1] for the fixed sun position
fn hillshade(p: f64, q: f64) -> f32 {
    let zenith = (90.0 - SUN_ELEVATION_DEG).to_radians();
    let azimuth = SUN_AZIMUTH_DEG.to_radians();
    let slope = (p * p + q * q).sqrt().atan();
    let aspect = if p == 0.0 && q == 0.0 {
        0.0
    } else {
        (-p).atan2(q)
    };
    let shade =
        zenith.cos() * slope.cos() + zenith.sin() * slope.sin() * (azimuth - aspect).cos();
    shade.max(0.0) as f32
}
