//! Collocation and stacking: resample resolved bands onto one
//! reference grid, then merge them into a single labeled array.
//!
//! The resampler is affine-only: SAR data is warped into the target
//! CRS by the external tool at orthorectification time and optical
//! products carry a native CRS, so two resolved bands disagreeing on
//! EPSG is an unreconcilable grid, not something to warp silently.

use crate::types::{
    GridSpec, MultiBandArray, PipelineError, PipelineResult, RasterData, Resampling, ResolvedBand,
    SensorCategory, StackArray, NODATA,
};
use ndarray::Array2;
use num_traits::Float;

/// Resample every band onto the reference grid.
///
/// When no reference is supplied, the first band in request order
/// establishes it — skipping DEM-derived bands, whose native
/// resolution frequently differs from the satellite bands and would
/// surprise callers if silently adopted.
pub fn collocate(
    bands: Vec<ResolvedBand>,
    reference: Option<&GridSpec>,
) -> PipelineResult<Vec<ResolvedBand>> {
    if bands.is_empty() {
        return Ok(bands);
    }
    let reference = match reference {
        Some(grid) => *grid,
        None => {
            bands
                .iter()
                .find(|b| b.category != SensorCategory::DemDerived)
                .map(|b| b.raster.grid)
                .ok_or_else(|| {
                    PipelineError::GridMismatch(
                        "only DEM-derived bands requested; supply an explicit reference grid"
                            .to_string(),
                    )
                })?
        }
    };

    log::debug!(
        "collocating {} bands onto {}x{} grid (EPSG:{})",
        bands.len(),
        reference.width,
        reference.height,
        reference.epsg
    );

    bands
        .into_iter()
        .map(|band| {
            let raster = resample_to_grid(&band.raster, &reference, band.resampling)
                .map_err(|e| match e {
                    PipelineError::GridMismatch(msg) => {
                        PipelineError::GridMismatch(format!("band '{}': {}", band.name, msg))
                    }
                    other => other,
                })?;
            Ok(ResolvedBand { raster, ..band })
        })
        .collect()
}

/// Merge collocated bands into one multi-band array.
///
/// Duplicate abstract bands collapse to a single instance ordered at
/// the position of the last occurrence; every plane shares the f32
/// nodata sentinel.
pub fn stack(bands: Vec<ResolvedBand>) -> PipelineResult<MultiBandArray> {
    if bands.is_empty() {
        return Err(PipelineError::Processing("cannot stack zero bands".to_string()));
    }
    let grid = bands[0].raster.grid;
    for band in &bands {
        if !band.raster.grid.matches(&grid) {
            return Err(PipelineError::GridMismatch(format!(
                "band '{}' is not on the stack grid; collocate before stacking",
                band.name
            )));
        }
    }

    // Last occurrence of each name wins and fixes the position
    let mut last_index: Vec<(String, usize)> = Vec::new();
    for (idx, band) in bands.iter().enumerate() {
        match last_index.iter_mut().find(|(name, _)| *name == band.name) {
            Some((_, slot)) => *slot = idx,
            None => last_index.push((band.name.clone(), idx)),
        }
    }
    last_index.sort_by_key(|(_, idx)| *idx);

    let (height, width) = (grid.height, grid.width);
    let mut data = StackArray::from_elem((last_index.len(), height, width), NODATA);
    let mut names = Vec::with_capacity(last_index.len());
    for (plane, (name, idx)) in last_index.iter().enumerate() {
        let band = &bands[*idx];
        let mut slice = data.index_axis_mut(ndarray::Axis(0), plane);
        for ((r, c), out) in slice.indexed_iter_mut() {
            let v = band.raster.data[[r, c]];
            *out = if v == band.raster.nodata || !v.is_finite() {
                NODATA
            } else {
                v
            };
        }
        names.push(name.clone());
    }

    Ok(MultiBandArray {
        names,
        data,
        grid,
        nodata: NODATA,
    })
}

/// Resample one raster onto a target grid with the given method.
/// Source nodata maps to the internal sentinel; pixels falling outside
/// the source extent come out as nodata.
pub fn resample_to_grid(
    source: &RasterData,
    target: &GridSpec,
    method: Resampling,
) -> PipelineResult<RasterData> {
    if source.grid.matches(target) {
        let mut out = source.clone();
        if out.nodata != NODATA {
            crate::core::mask::remap_nodata(&mut out, source.nodata);
        }
        return Ok(out);
    }
    if source.grid.epsg != target.epsg {
        return Err(PipelineError::GridMismatch(format!(
            "source EPSG:{} differs from reference EPSG:{}",
            source.grid.epsg, target.epsg
        )));
    }

    let src = &source.grid.transform;
    let mut data = Array2::from_elem((target.height, target.width), NODATA);
    for ((row, col), out) in data.indexed_iter_mut() {
        let (x, y) = target.transform.apply(col as f64 + 0.5, row as f64 + 0.5);
        // Fractional source pixel-center coordinates
        let fx = (x - src.top_left_x) / src.pixel_width - 0.5;
        let fy = (y - src.top_left_y) / src.pixel_height - 0.5;
        let sampled = match method {
            Resampling::Nearest => sample_nearest(&source.data, fx, fy, source.nodata),
            Resampling::Bilinear => sample_bilinear(&source.data, fx, fy, source.nodata),
        };
        if let Some(v) = sampled {
            *out = v;
        }
    }

    Ok(RasterData::new(data, *target, NODATA, source.unit.clone()))
}

fn sample_nearest<T: Float>(data: &Array2<T>, fx: f64, fy: f64, nodata: T) -> Option<T> {
    let (height, width) = data.dim();
    let col = fx.round();
    let row = fy.round();
    if col < 0.0 || row < 0.0 || col >= width as f64 || row >= height as f64 {
        return None;
    }
    let v = data[[row as usize, col as usize]];
    if v == nodata || !v.is_finite() {
        None
    } else {
        Some(v)
    }
}

fn sample_bilinear<T: Float>(data: &Array2<T>, fx: f64, fy: f64, nodata: T) -> Option<T> {
    let (height, width) = data.dim();
    if fx < -0.5 || fy < -0.5 || fx > width as f64 - 0.5 || fy > height as f64 - 0.5 {
        return None;
    }
    let x0 = fx.floor();
    let y0 = fy.floor();
    let wx = fx - x0;
    let wy = fy - y0;

    let fetch = |r: f64, c: f64| -> Option<T> {
        if r < 0.0 || c < 0.0 || r >= height as f64 || c >= width as f64 {
            return None;
        }
        let v = data[[r as usize, c as usize]];
        if v == nodata || !v.is_finite() {
            None
        } else {
            Some(v)
        }
    };

    let corners = [
        (fetch(y0, x0), (1.0 - wx) * (1.0 - wy)),
        (fetch(y0, x0 + 1.0), wx * (1.0 - wy)),
        (fetch(y0 + 1.0, x0), (1.0 - wx) * wy),
        (fetch(y0 + 1.0, x0 + 1.0), wx * wy),
    ];

    if corners.iter().all(|(v, _)| v.is_some()) {
        let mut acc = T::zero();
        for (v, w) in &corners {
            acc = acc + v.unwrap() * T::from(*w).unwrap();
        }
        Some(acc)
    } else {
        // Degrade to the heaviest valid corner near edges and nodata
        // holes instead of bleeding the sentinel into the average
        corners
            .iter()
            .filter(|(v, _)| v.is_some())
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
            .and_then(|(v, _)| *v)
    }
}
