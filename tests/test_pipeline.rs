//! End-to-end pipeline scenarios over the flat-raster test doubles:
//! cache population and reuse, SAR chain sharing, cleaning levels,
//! windows and the calibration fallback.

mod common;

use approx::assert_relative_eq;
use common::{FlatRasterSource, RecordingGraphTool, UnitlessRasterSource};
use eoband::config::GraphTemplates;
use eoband::types::{CleaningLevel, DemReference, PipelineError, PixelWindow, NODATA};
use eoband::{BandPipeline, BandRequest, PipelineConfig};
use std::path::Path;
use std::sync::Arc;

fn build(config: PipelineConfig, tool: &Arc<RecordingGraphTool>) -> BandPipeline {
    BandPipeline::new(config, Arc::new(FlatRasterSource), tool.clone())
        .expect("pipeline construction")
}

/// Committed artifacts for one product, ignoring the scratch area
fn artifact_count(cache_root: &Path, product_id: &str) -> usize {
    let dir = cache_root.join(product_id);
    if !dir.exists() {
        return 0;
    }
    std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name() != "work")
        .count()
}

#[test]
fn optical_band_is_masked_and_cached_once() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let mut config = common::test_config(&tmp.path().join("cache"));
    config.cleaning_level = CleaningLevel::Full;
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    let requests = [BandRequest::parse("GREEN").unwrap()];
    let bands = pipeline.load(&product, &requests).unwrap();
    assert_eq!(bands.len(), 1);
    let green = &bands[0];
    assert_eq!(green.name, "GREEN");
    assert_eq!(green.raster.data.dim(), (8, 8));

    // Full cleaning masks the flagged pixels, leaves the rest intact
    assert_eq!(green.raster.data[[0, 0]], NODATA);
    assert_eq!(green.raster.data[[7, 7]], NODATA);
    assert_relative_eq!(green.raster.data[[0, 1]], 0.101, epsilon = 1e-6);
    assert_eq!(green.raster.nodata, NODATA);

    // Exactly one committed artifact, no external tool involvement
    assert_eq!(artifact_count(&cache_root, &product.id), 1);
    assert_eq!(tool.invocations("calibrate"), 0);
}

#[test]
fn requested_resolution_changes_shape_and_cache_key() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let config = common::test_config(&tmp.path().join("cache"));
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    let native = [BandRequest::parse("GREEN").unwrap()];
    let coarse = [BandRequest::parse("GREEN").unwrap().with_resolution(20.0)];

    let at_10 = pipeline.load(&product, &native).unwrap();
    let at_20 = pipeline.load(&product, &coarse).unwrap();
    assert_eq!(at_10[0].raster.data.dim(), (8, 8));
    assert_eq!(at_20[0].raster.data.dim(), (4, 4));
    let (px, py) = at_20[0].raster.grid.pixel_size();
    assert_relative_eq!(px, 20.0, epsilon = 1e-9);
    assert_relative_eq!(py, 20.0, epsilon = 1e-9);

    // Different read resolution, different artifact
    assert_eq!(artifact_count(&cache_root, &product.id), 2);
}

#[test]
fn second_load_reuses_the_artifact_bit_for_bit() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let config = common::test_config(&tmp.path().join("cache"));
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    let requests = [BandRequest::parse("RED").unwrap()];
    let first = pipeline.load(&product, &requests).unwrap();
    let second = pipeline.load(&product, &requests).unwrap();

    assert_eq!(artifact_count(&cache_root, &product.id), 1);
    assert_eq!(first[0].raster.data, second[0].raster.data);
    assert_eq!(first[0].raster.grid, second[0].raster.grid);
}

#[test]
fn window_limits_the_read_extent() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let pipeline = build(common::test_config(&tmp.path().join("cache")), &tool);

    let window = PixelWindow {
        col_off: 2,
        row_off: 2,
        width: 4,
        height: 4,
    };
    let requests = [BandRequest::parse("GREEN").unwrap().with_window(window)];
    let bands = pipeline.load(&product, &requests).unwrap();
    assert_eq!(bands[0].raster.data.dim(), (4, 4));
    // First windowed pixel is native (row 2, col 2)
    assert_relative_eq!(bands[0].raster.data[[0, 0]], 0.118, epsilon = 1e-6);
}

#[test]
fn sar_pair_shares_one_orthorectification() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s1_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let config = common::test_config(&tmp.path().join("cache"));
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    let requests = [
        BandRequest::parse("VV").unwrap(),
        BandRequest::parse("VV_DSPK").unwrap(),
    ];
    let bands = pipeline.load(&product, &requests).unwrap();
    assert_eq!(bands.len(), 2);
    assert_eq!(bands[0].name, "VV");
    assert_eq!(bands[1].name, "VV_DSPK");

    // One calibration, one warp, one filter run for the pair
    assert_eq!(tool.invocations("calibrate"), 1);
    assert_eq!(tool.invocations("orthorectify"), 1);
    assert_eq!(tool.invocations("despeckle"), 1);

    // Two committed artifacts: orthorectified and despeckled
    assert_eq!(artifact_count(&cache_root, &product.id), 2);

    // Markers: input v -> calibrate x2 -> orthorectify x3 (= 6v),
    // despeckle halves that (= 3v)
    let input_1_1 = 1.0 + (1 * 8 + 1) as f32;
    assert_relative_eq!(bands[0].raster.data[[1, 1]], 6.0 * input_1_1, epsilon = 1e-4);
    assert_relative_eq!(bands[1].raster.data[[1, 1]], 3.0 * input_1_1, epsilon = 1e-4);

    // The tool's zero nodata convention is remapped, never left to
    // alias valid backscatter
    assert_eq!(bands[0].raster.data[[0, 0]], NODATA);
    assert_eq!(bands[0].raster.nodata, NODATA);
}

#[test]
fn sar_reload_runs_no_tool_at_all() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s1_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let pipeline = build(common::test_config(&tmp.path().join("cache")), &tool);

    let requests = [BandRequest::parse("VV_DSPK").unwrap()];
    let first = pipeline.load(&product, &requests).unwrap();
    let calls_after_first =
        tool.invocations("calibrate") + tool.invocations("orthorectify") + tool.invocations("despeckle");
    let second = pipeline.load(&product, &requests).unwrap();
    let calls_after_second =
        tool.invocations("calibrate") + tool.invocations("orthorectify") + tool.invocations("despeckle");

    assert_eq!(calls_after_first, 3);
    assert_eq!(calls_after_second, 3);
    assert_eq!(first[0].raster.data, second[0].raster.data);
}

#[test]
fn calibration_fallback_is_one_logged_retry() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s1_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    tool.fail_calibration();

    let mut config = common::test_config(&tmp.path().join("cache"));
    config.calibration_fallback = true;
    let pipeline = build(config, &tool);

    let requests = [BandRequest::parse("VV").unwrap()];
    let bands = pipeline.load(&product, &requests).unwrap();
    assert_eq!(bands.len(), 1);
    assert_eq!(tool.invocations("calibrate"), 2);
    assert_eq!(tool.fallback_invocations("calibrate"), 1);
}

#[test]
fn calibration_failure_without_fallback_is_fatal() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s1_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    tool.fail_calibration();
    let pipeline = build(common::test_config(&tmp.path().join("cache")), &tool);

    let requests = [BandRequest::parse("VV").unwrap()];
    let err = pipeline.load(&product, &requests).unwrap_err();
    assert!(matches!(err, PipelineError::ToolExecution { .. }));
    assert_eq!(tool.invocations("calibrate"), 1);
}

#[test]
fn slope_is_computed_from_the_configured_dem() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let dem = common::dem_file(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());

    let mut config = common::test_config(&tmp.path().join("cache"));
    config.dem = Some(DemReference::Path(dem));
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    let requests = [BandRequest::parse("SLOPE").unwrap()];
    let bands = pipeline.load(&product, &requests).unwrap();
    let slope = &bands[0].raster;

    // Plane rising east at 0.5 m/m: slope atan(0.5), borders nodata
    assert_relative_eq!(slope.data[[3, 3]], 0.5f32.atan().to_degrees(), epsilon = 1e-3);
    assert_eq!(slope.data[[0, 0]], NODATA);
    assert_eq!(artifact_count(&cache_root, &product.id), 1);
}

#[test]
fn missing_dem_fails_before_any_artifact_is_written() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());

    let mut config = common::test_config(&tmp.path().join("cache"));
    config.dem = Some(DemReference::Path(tmp.path().join("no_such_dem.bin")));
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    let requests = [BandRequest::parse("SLOPE").unwrap()];
    let err = pipeline.load(&product, &requests).unwrap_err();
    assert!(matches!(err, PipelineError::MissingDependency { .. }));
    assert_eq!(artifact_count(&cache_root, &product.id), 0);
}

#[test]
fn duplicate_requests_are_planned_once() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let config = common::test_config(&tmp.path().join("cache"));
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    // Alias and native id name the same concrete band
    let requests = [
        BandRequest::parse("GREEN").unwrap(),
        BandRequest::parse("B03").unwrap(),
    ];
    let bands = pipeline.load(&product, &requests).unwrap();
    assert_eq!(bands.len(), 1);
    assert_eq!(artifact_count(&cache_root, &product.id), 1);
}

#[test]
fn cleaning_levels_produce_distinct_artifacts() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let config = common::test_config(&tmp.path().join("cache"));
    let cache_root = config.cache_dir.clone();
    let pipeline = build(config, &tool);

    let nodata_only = [BandRequest::parse("GREEN").unwrap()];
    let full = [BandRequest::parse("GREEN")
        .unwrap()
        .with_cleaning(CleaningLevel::Full)];

    let lenient = pipeline.load(&product, &nodata_only).unwrap();
    let strict = pipeline.load(&product, &full).unwrap();
    assert_eq!(artifact_count(&cache_root, &product.id), 2);

    // Clouds survive the lenient level, not the strict one
    assert_ne!(lenient[0].raster.data[[7, 7]], NODATA);
    assert_eq!(strict[0].raster.data[[7, 7]], NODATA);
}

#[test]
fn resolution_variants_calibrate_into_separate_scratch_files() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s1_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    let pipeline = build(common::test_config(&tmp.path().join("cache")), &tool);

    // Same polarization, two output grids: two calibration runs that
    // must never share an intermediate
    let requests = [
        BandRequest::parse("VV").unwrap(),
        BandRequest::parse("VV").unwrap().with_resolution(20.0),
    ];
    let bands = pipeline.load(&product, &requests).unwrap();
    assert_eq!(bands.len(), 2);

    let outputs = tool.output_paths("calibrate");
    assert_eq!(outputs.len(), 2);
    assert_ne!(outputs[0], outputs[1]);
}

#[test]
fn production_constructor_requires_graph_templates() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();

    let config = common::test_config(&tmp.path().join("cache"));
    let err = BandPipeline::from_config(config).err().unwrap();
    assert!(matches!(err, PipelineError::MissingDependency { .. }));

    let mut config = common::test_config(&tmp.path().join("cache"));
    config.graph_templates = Some(GraphTemplates {
        calibrate: tmp.path().join("calibrate.xml"),
        calibrate_fallback: None,
        orthorectify: tmp.path().join("orthorectify.xml"),
        despeckle: tmp.path().join("despeckle.xml"),
    });
    assert!(BandPipeline::from_config(config).is_ok());
}

#[test]
fn unit_is_restated_when_loading_from_the_cache() {
    common::init_logging();
    let tmp = tempfile::tempdir().unwrap();
    let product = common::make_s2_product(tmp.path()).unwrap();
    let tool = Arc::new(RecordingGraphTool::new());
    // Artifacts read back without a unit, like a plain GeoTIFF
    let pipeline = BandPipeline::new(
        common::test_config(&tmp.path().join("cache")),
        Arc::new(UnitlessRasterSource(FlatRasterSource)),
        tool.clone(),
    )
    .unwrap();

    let requests = [BandRequest::parse("GREEN").unwrap()];
    let fresh = pipeline.load(&product, &requests).unwrap();
    assert_eq!(fresh[0].raster.unit, "reflectance");

    let hit = pipeline.load(&product, &requests).unwrap();
    assert_eq!(hit[0].raster.unit, "reflectance");
}
