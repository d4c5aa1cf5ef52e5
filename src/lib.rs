//! eoband: Band Resolution & Preprocessing Cache for Multi-Sensor Imagery
//!
//! This library resolves abstract band requests ("GREEN", "VV", "SLOPE")
//! against Sentinel-1/2 and Landsat products, runs the per-sensor
//! preprocessing each band needs (radiometric calibration,
//! orthorectification, despeckling, cloud masking, terrain derivatives),
//! caches every expensive intermediate under a deterministic fingerprint,
//! and collocates the results into analysis-ready multi-band stacks.

pub mod cache;
pub mod config;
pub mod core;
pub mod io;
pub mod registry;
pub mod types;

// Re-export main types and functions for easier access
pub use types::{
    BandDescriptor, CleaningLevel, Constellation, DemReference, GridSpec, MultiBandArray,
    PipelineError, PipelineResult, PixelWindow, Polarization, Product, RasterData, ResolvedBand,
    SensorCategory, NODATA,
};

pub use cache::{CacheKey, CacheStore};
pub use config::PipelineConfig;
pub use core::{BandPipeline, PipelineState};
pub use io::{GdalRasterSource, GraphTool, RasterSource, SnapGraphAdapter};
pub use registry::{BandRegistry, BandRequest, BandSelector};
