use crate::core::band_mask::BandMasker;
use crate::core::cloud_mask::{CloudClassifier, MaskSynthesisConfig, MaskSynthesizer};
use crate::core::grid::{GridReconciler, ResampleMethod};
use crate::core::progress::{BatchProgress, ProgressReporter};
use crate::core::reflectance::ReflectanceCalibrator;
use crate::io::raster::RasterWriter;
use crate::types::{
    BandCode, BandStack, BatchReport, BoundingBox, ItemOutcome, Raster, RasterGrid, S2Error, S2Result,
    Scene,
};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// File name of the usability mask product
pub const MASK_FILE_NAME: &str = "binary_mask.tif";

/// Area of interest in an arbitrary CRS
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CropExtent {
    pub bounds: BoundingBox,
    pub crs: String,
}

/// Single-scene masking parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenePipelineConfig {
    /// Output resolution in meters
    pub pixel_size: f64,
    /// Output CRS; the scene's own CRS when unset
    pub target_crs: Option<String>,
    /// Nearest keeps DN values intact
    pub resample: ResampleMethod,
    pub crop: Option<CropExtent>,
    /// Bands written as masked products
    pub output_bands: Vec<BandCode>,
    pub write_mask: bool,
    pub writer: RasterWriter,
    pub calibrator: ReflectanceCalibrator,
    pub masking: MaskSynthesisConfig,
}

impl Default for ScenePipelineConfig {
    fn default() -> Self {
        Self {
            pixel_size: 10.0,
            target_crs: None,
            resample: ResampleMethod::Nearest,
            crop: None,
            output_bands: BandCode::OUTPUT_BANDS.to_vec(),
            write_mask: true,
            writer: RasterWriter::default(),
            calibrator: ReflectanceCalibrator::default(),
            masking: MaskSynthesisConfig::default(),
        }
    }
}

/// Files written for one scene
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneOutputs {
    pub scene_id: String,
    pub output_dir: PathBuf,
    pub mask_path: Option<PathBuf>,
    pub band_paths: BTreeMap<BandCode, PathBuf>,
    pub grid: RasterGrid,
    /// Share of pixels flagged unusable
    pub unusable_fraction: f64,
}

/// Cloud masking of Level-1C scenes: grid, calibrate, classify, mask, write
pub struct ScenePipeline<C> {
    config: ScenePipelineConfig,
    synthesizer: MaskSynthesizer<C>,
    masker: BandMasker,
}

impl<C: CloudClassifier> ScenePipeline<C> {
    pub fn new(classifier: C) -> Self {
        Self::with_config(classifier, ScenePipelineConfig::default())
    }

    pub fn with_config(classifier: C, config: ScenePipelineConfig) -> Self {
        let synthesizer = MaskSynthesizer::with_config(classifier, config.masking.clone());
        Self {
            config,
            synthesizer,
            masker: BandMasker::new(),
        }
    }

    pub fn config(&self) -> &ScenePipelineConfig {
        &self.config
    }

    /// Directory receiving the outputs of `scene`
    pub fn scene_output_dir(&self, output_dir: &Path, scene: &Scene) -> PathBuf {
        output_dir.join(&scene.id)
    }

    /// Common grid of the scene's band files, cropped when configured
    pub fn scene_grid(&self, scene: &Scene) -> S2Result<RasterGrid> {
        let paths = ordered_band_files(scene);
        let target_crs = self.config.target_crs.as_deref().unwrap_or(&scene.crs);
        let reconciler = GridReconciler::new(self.config.pixel_size, self.config.resample)
            .with_target_projection(target_crs);

        let grid = reconciler.reconcile(&paths)?;
        match &self.config.crop {
            Some(crop) => {
                let cropped = reconciler.crop(&grid, &crop.bounds, &crop.crs)?;
                log::info!("Cropped grid to {}x{} pixels", cropped.width, cropped.height);
                Ok(cropped)
            }
            None => Ok(grid),
        }
    }

    /// Warp every available band of the scene onto `grid` as DN
    pub fn load_bands(&self, scene: &Scene, grid: &RasterGrid) -> S2Result<BandStack<u16>> {
        let reconciler = GridReconciler::new(self.config.pixel_size, self.config.resample);
        let bands: Vec<(BandCode, &PathBuf)> = BandCode::CLASSIFIER_ORDER
            .iter()
            .filter_map(|band| scene.band_files.get(band).map(|path| (*band, path)))
            .collect();

        #[cfg(feature = "parallel")]
        let loaded: S2Result<Vec<_>> = bands
            .par_iter()
            .map(|&(band, path)| load_band(&reconciler, grid, band, path))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let loaded: S2Result<Vec<_>> = bands
            .iter()
            .map(|&(band, path)| load_band(&reconciler, grid, band, path))
            .collect();

        let mut stack = BandStack::new(grid.clone());
        for (band, data) in loaded? {
            stack.insert(band, data)?;
        }
        Ok(stack)
    }

    /// Mask one scene and write `binary_mask.tif` and `<band>_masked.tif`
    /// under `<output_dir>/<scene id>/`
    pub fn run(&self, scene: &Scene, output_dir: &Path, progress: &dyn ProgressReporter) -> S2Result<SceneOutputs> {
        log::info!("🛰️ Processing scene {}", scene.id);

        progress.step(0, &format!("{}: building common grid", scene.id))?;
        let grid = self.scene_grid(scene)?;
        log::info!("Scene grid: {}x{} at {} m", grid.width, grid.height, self.config.pixel_size);

        progress.step(10, &format!("{}: loading bands", scene.id))?;
        let dn = self.load_bands(scene, &grid)?;

        progress.step(40, &format!("{}: calibrating reflectance", scene.id))?;
        let reflectance = self.config.calibrator.calibrate(&dn)?;

        progress.step(50, &format!("{}: detecting clouds", scene.id))?;
        let components = self.synthesizer.synthesize(&reflectance)?;

        progress.step(70, &format!("{}: writing masked bands", scene.id))?;
        let scene_dir = self.scene_output_dir(output_dir, scene);
        std::fs::create_dir_all(&scene_dir)?;

        let mask_path = if self.config.write_mask {
            let path = scene_dir.join(MASK_FILE_NAME);
            self.config.writer.write_mask(&path, &grid, &components.mask)?;
            log::info!("Mask saved: {}", path.display());
            Some(path)
        } else {
            None
        };

        let mut band_paths = BTreeMap::new();
        for &band in &self.config.output_bands {
            let data = match dn.get(band) {
                Some(data) => data,
                None => {
                    log::warn!("{}: band {} not available, no masked output", scene.id, band);
                    continue;
                }
            };
            let band_raster = Raster::new(grid.clone(), data.clone(), None)?;
            let masked = self.masker.apply(&band_raster, &components.mask)?;
            let path = scene_dir.join(format!("{}_masked.tif", band));
            self.config.writer.write(&path, &masked)?;
            band_paths.insert(band, path);
        }

        progress.step(100, &format!("{}: done", scene.id))?;
        log::info!(
            "✅ Scene {} masked: {} band(s), {:.1}% unusable",
            scene.id,
            band_paths.len(),
            components.unusable_fraction() * 100.0
        );

        Ok(SceneOutputs {
            scene_id: scene.id.clone(),
            output_dir: scene_dir,
            mask_path,
            band_paths,
            grid,
            unusable_fraction: components.unusable_fraction(),
        })
    }

    /// Mask several scenes; a failing scene is recorded and the rest continue.
    /// Cancellation aborts the whole batch.
    pub fn run_batch(
        &self,
        scenes: &[Scene],
        output_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> S2Result<BatchReport<String, SceneOutputs>> {
        log::info!("Masking {} scene(s)", scenes.len());
        progress.step(0, &format!("Masking {} scene(s)", scenes.len()))?;
        let batch_progress = BatchProgress::new(progress, scenes.len());

        let run_one = |scene: &Scene| -> S2Result<ItemOutcome<SceneOutputs>> {
            let outcome = match self.run(scene, output_dir, &batch_progress) {
                Ok(outputs) => ItemOutcome::Success(outputs),
                Err(S2Error::Cancelled) => return Err(S2Error::Cancelled),
                Err(e) => {
                    log::error!("Scene {} failed: {}", scene.id, e);
                    ItemOutcome::Failed { error: e.to_string() }
                }
            };
            batch_progress.finish_item();
            Ok(outcome)
        };

        #[cfg(feature = "parallel")]
        let outcomes: Vec<S2Result<ItemOutcome<SceneOutputs>>> = scenes.par_iter().map(run_one).collect();
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<S2Result<ItemOutcome<SceneOutputs>>> = scenes.iter().map(run_one).collect();

        let mut report = BatchReport::new();
        for (scene, outcome) in scenes.iter().zip(outcomes) {
            report.record(scene.id.clone(), outcome?);
        }
        log::info!(
            "Scene batch: {} succeeded, {} failed",
            report.success_count(),
            report.failed_count()
        );
        Ok(report)
    }
}

fn load_band(
    reconciler: &GridReconciler,
    grid: &RasterGrid,
    band: BandCode,
    path: &Path,
) -> S2Result<(BandCode, Array2<u16>)> {
    log::debug!("Warping {} from {}", band, path.display());
    let raster = reconciler.warp_file::<u16, _>(path, grid, None, 0.0)?;
    Ok((band, raster.data))
}

/// Band files in classifier order, so the reference raster is deterministic
fn ordered_band_files(scene: &Scene) -> Vec<PathBuf> {
    BandCode::CLASSIFIER_ORDER
        .iter()
        .filter_map(|band| scene.band_files.get(band).cloned())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cloud_mask::ClassifierConfig;
    use crate::core::progress::LogProgress;
    use crate::types::UsabilityMask;
    use ndarray::ArrayView3;

    fn never_cloudy(input: ArrayView3<f32>, _: &ClassifierConfig) -> S2Result<UsabilityMask> {
        let (_, rows, cols) = input.dim();
        Ok(UsabilityMask::from_elem((rows, cols), false))
    }

    fn scene(id: &str, files: &[(BandCode, &str)]) -> Scene {
        Scene {
            id: id.to_string(),
            band_files: files.iter().map(|(b, p)| (*b, PathBuf::from(p))).collect(),
            crs: "EPSG:32633".to_string(),
        }
    }

    #[test]
    fn test_band_files_in_classifier_order() {
        let s = scene(
            "S",
            &[(BandCode::B8A, "/b8a.jp2"), (BandCode::B09, "/b09.jp2"), (BandCode::B01, "/b01.jp2")],
        );
        assert_eq!(
            ordered_band_files(&s),
            vec![PathBuf::from("/b01.jp2"), PathBuf::from("/b8a.jp2"), PathBuf::from("/b09.jp2")]
        );
    }

    #[test]
    fn test_cancelled_before_first_step() {
        let progress = LogProgress::new();
        progress.cancel();
        let pipeline = ScenePipeline::new(never_cloudy);
        let dir = tempfile::TempDir::new().unwrap();
        let s = scene("S", &[(BandCode::B02, "/missing.jp2")]);
        assert!(matches!(pipeline.run(&s, dir.path(), &progress), Err(S2Error::Cancelled)));
        assert!(!dir.path().join("S").exists());
    }

    #[test]
    fn test_batch_records_failed_scenes() {
        let pipeline = ScenePipeline::new(never_cloudy);
        let dir = tempfile::TempDir::new().unwrap();
        let scenes = vec![
            scene("A", &[(BandCode::B02, "/missing/a.jp2")]),
            scene("B", &[(BandCode::B02, "/missing/b.jp2")]),
        ];
        let progress = LogProgress::new();
        let report = pipeline.run_batch(&scenes, dir.path(), &progress).unwrap();
        assert_eq!(report.failed_count(), 2);
        assert!(!report.is_success());
        // Batch-level percentage, not the last scene's own
        assert_eq!(progress.percent(), 100);
    }
}
