//! Raster, scene and product metadata I/O

pub mod metadata;
pub mod raster;
pub mod scene;

pub use metadata::{ProductMetadata, ProductName};
pub use raster::{RasterInfo, RasterReader, RasterWriter};
pub use scene::{collect_mosaic_inputs, find_masked_band, SceneLocator};
