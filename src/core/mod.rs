//! Core cloud masking and mosaicking modules

pub mod band_mask;
pub mod cloud_mask;
pub mod grid;
pub mod mosaic;
pub mod pipeline;
pub mod progress;
pub mod reflectance;

// Re-export main types
pub use band_mask::BandMasker;
pub use cloud_mask::{
    BareSoilParams, ClassifierConfig, CloudClassifier, MaskComponents, MaskSynthesisConfig, MaskSynthesizer,
};
pub use grid::{GridReconciler, ResampleMethod};
pub use mosaic::{masked_median, BandMosaic, MosaicCompositor, MosaicConfig, MosaicRun};
pub use pipeline::{CropExtent, SceneOutputs, ScenePipeline, ScenePipelineConfig};
pub use progress::{BatchProgress, LogProgress, NoProgress, ProgressReporter};
pub use reflectance::ReflectanceCalibrator;
