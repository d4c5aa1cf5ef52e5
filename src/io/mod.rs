//! I/O boundaries: raster access, DEM provisioning and the external
//! graph tool adapter

pub mod dem;
pub mod graph_tool;
pub mod raster;

pub use dem::DemProvider;
pub use graph_tool::{GraphTool, SnapGraphAdapter};
pub use raster::{GdalRasterSource, RasterSource};
