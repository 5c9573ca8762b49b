//! s2cloudmask: cloud masking and median mosaicking for Sentinel-2 Level-1C
//!
//! Scenes are resampled onto a common grid, calibrated to top-of-atmosphere
//! reflectance and masked with an external cloud classifier. The masked bands
//! of several scenes are then reduced to a per-band median mosaic and stacked
//! into one multi-band composite.

pub mod core;
pub mod io;
pub mod types;

#[cfg(feature = "python")]
mod python;

// Re-export main types
pub use types::{
    BandCode, BandStack, BatchReport, BoundingBox, CompositeProduct, GeoTransform, ItemOutcome, MosaicInput,
    Raster, RasterGrid, ReflectanceStack, S2Error, S2Result, Scene, UsabilityMask,
};

pub use crate::core::{
    BandMasker, CloudClassifier, GridReconciler, MaskSynthesizer, MosaicCompositor, ReflectanceCalibrator,
    ScenePipeline,
};
pub use io::{RasterReader, RasterWriter, SceneLocator};
