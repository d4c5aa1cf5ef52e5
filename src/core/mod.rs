//! Core processing: masking, terrain derivatives, collocation and the
//! band pipeline state machine

pub mod collocate;
pub mod dem_derivative;
pub mod mask;
pub mod pipeline;

pub use collocate::{collocate, resample_to_grid, stack};
pub use pipeline::{BandPipeline, PipelineState};
