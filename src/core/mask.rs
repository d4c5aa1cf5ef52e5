//! Invalid-pixel masking from provider flag rasters.
//!
//! Operates on in-memory arrays; reading the flag rasters and
//! resampling them onto the band grid happens upstream in the
//! orchestrator.

use crate::types::{CleaningLevel, FlagKind, MaskKind, PipelineError, PipelineResult, RasterData, NODATA};
use ndarray::Array2;

/// Flag rasters consulted per cleaning level. `Full` is strictly a
/// superset of `NodataOnly`.
pub fn flags_for_level(level: CleaningLevel) -> &'static [FlagKind] {
    match level {
        CleaningLevel::Raw => &[],
        CleaningLevel::NodataOnly => &[FlagKind::Nodata],
        CleaningLevel::Full => &[
            FlagKind::Nodata,
            FlagKind::Defect,
            FlagKind::Saturation,
            FlagKind::Cloud,
            FlagKind::Shadow,
            FlagKind::Cirrus,
        ],
    }
}

/// Flag rasters composing one requestable cloud-mask band
pub fn flags_for_mask(kind: MaskKind) -> &'static [FlagKind] {
    match kind {
        MaskKind::Clouds => &[FlagKind::Cloud],
        MaskKind::Shadows => &[FlagKind::Shadow],
        MaskKind::Cirrus => &[FlagKind::Cirrus],
        MaskKind::AllClouds => &[FlagKind::Cloud, FlagKind::Shadow, FlagKind::Cirrus],
    }
}

/// Set every pixel flagged in any of `flags` to the nodata sentinel,
/// and remap the band's delivered nodata value onto the sentinel so it
/// is never reinterpreted as valid data downstream.
pub fn apply_cleaning(band: &mut RasterData, flags: &[Array2<f32>]) -> PipelineResult<()> {
    let shape = band.data.dim();
    for flag in flags {
        if flag.dim() != shape {
            return Err(PipelineError::GridMismatch(format!(
                "flag raster shape {:?} does not match band shape {:?}",
                flag.dim(),
                shape
            )));
        }
    }

    let delivered_nodata = band.nodata;
    for ((row, col), value) in band.data.indexed_iter_mut() {
        if *value == delivered_nodata || !value.is_finite() {
            *value = NODATA;
            continue;
        }
        if flags.iter().any(|f| f[[row, col]] != 0.0) {
            *value = NODATA;
        }
    }
    band.nodata = NODATA;
    Ok(())
}

/// Combine flag rasters into one binary 0/1 mask band
pub fn binarize(flags: &[Array2<f32>]) -> PipelineResult<Array2<f32>> {
    let first = flags.first().ok_or_else(|| {
        PipelineError::Processing("cannot binarize an empty flag list".to_string())
    })?;
    let shape = first.dim();
    for flag in flags {
        if flag.dim() != shape {
            return Err(PipelineError::GridMismatch(format!(
                "flag raster shape {:?} does not match {:?}",
                flag.dim(),
                shape
            )));
        }
    }
    let mut out = Array2::zeros(shape);
    for ((row, col), value) in out.indexed_iter_mut() {
        if flags.iter().any(|f| f[[row, col]] != 0.0) {
            *value = 1.0;
        }
    }
    Ok(out)
}

/// Remap one delivered nodata value (e.g. the SAR tool's fixed 0) onto
/// the internal sentinel
pub fn remap_nodata(band: &mut RasterData, delivered: f32) {
    for value in band.data.iter_mut() {
        if *value == delivered || !value.is_finite() {
            *value = NODATA;
        }
    }
    band.nodata = NODATA;
}
