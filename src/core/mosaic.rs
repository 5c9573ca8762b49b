use crate::core::grid::{GridInput, GridReconciler, ResampleMethod};
use crate::core::progress::ProgressReporter;
use crate::io::raster::{RasterReader, RasterWriter};
use crate::io::scene::collect_mosaic_inputs;
use crate::types::{
    BandCode, BatchReport, CompositeProduct, ItemOutcome, MosaicInput, Pixel, Raster, RasterGrid,
    S2Error, S2Result,
};
use ndarray::{s, Array2, Zip};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[cfg(feature = "parallel")]
use rayon::prelude::*;

/// Mosaic run parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicConfig {
    /// Shared grid resolution in meters
    pub pixel_size: f64,
    /// Value marking "no observation" in inputs and outputs
    pub nodata: f64,
    pub resample: ResampleMethod,
    /// Bands with fewer contributing scenes are skipped
    pub min_scenes: usize,
    /// Prefix of the per-band and composite file names
    pub output_name: String,
    pub bands: Vec<BandCode>,
    pub writer: RasterWriter,
}

impl Default for MosaicConfig {
    fn default() -> Self {
        Self {
            pixel_size: 10.0,
            nodata: 0.0,
            resample: ResampleMethod::Bilinear,
            min_scenes: 2,
            output_name: "mosaic".to_string(),
            bands: BandCode::OUTPUT_BANDS.to_vec(),
            writer: RasterWriter::default(),
        }
    }
}

/// Median mosaic of one band written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BandMosaic {
    pub band: BandCode,
    pub path: PathBuf,
    pub grid: RasterGrid,
    /// Scenes that contributed after warping
    pub scene_count: usize,
}

/// Result of a full mosaic run
#[derive(Debug, Clone)]
pub struct MosaicRun {
    pub bands: BatchReport<BandCode, BandMosaic>,
    pub composite: CompositeProduct,
}

/// Per-pixel median over a stack, ignoring `nodata` and NaN entries.
/// Even counts take the mean of the two middle values; pixels without any
/// observation receive `nodata`.
pub fn masked_median(arrays: &[Array2<f32>], nodata: f64) -> S2Result<Array2<f32>> {
    let first = arrays
        .first()
        .ok_or_else(|| S2Error::NoValidScenes("No arrays to reduce".to_string()))?;
    let shape = first.dim();
    if let Some(bad) = arrays.iter().find(|a| a.dim() != shape) {
        return Err(S2Error::InvalidInput(format!(
            "Cannot stack arrays of shape {:?} and {:?}",
            shape,
            bad.dim()
        )));
    }

    let nodata_f32 = nodata as f32;
    let median_at = |(i, j): (usize, usize)| -> f32 {
        let mut values: Vec<f32> = arrays
            .iter()
            .map(|a| a[[i, j]])
            .filter(|v| !v.is_nan() && *v != nodata_f32)
            .collect();
        if values.is_empty() {
            return nodata_f32;
        }
        values.sort_unstable_by(|a, b| a.total_cmp(b));
        let mid = values.len() / 2;
        if values.len() % 2 == 1 {
            values[mid]
        } else {
            (values[mid - 1] + values[mid]) / 2.0
        }
    };

    let mut result = Array2::<f32>::zeros(shape);
    #[cfg(feature = "parallel")]
    Zip::indexed(&mut result).par_for_each(|idx, out| *out = median_at(idx));
    #[cfg(not(feature = "parallel"))]
    Zip::indexed(&mut result).for_each(|idx, out| *out = median_at(idx));

    Ok(result)
}

/// Place single-band rasters sharing one pixel lattice into band order
/// (ascending band code) on their union grid
pub fn stack_bands<T: Pixel>(
    mut bands: Vec<(BandCode, Raster<T>)>,
    pixel_size: f64,
    nodata: f64,
) -> S2Result<(RasterGrid, Vec<BandCode>, Vec<Array2<T>>)> {
    if bands.is_empty() {
        return Err(S2Error::NoValidScenes("No band mosaics to stack".to_string()));
    }
    bands.sort_by_key(|(band, _)| *band);

    let inputs: Vec<GridInput> = bands.iter().map(|(_, r)| GridInput::from(&r.grid)).collect();
    let grid = GridReconciler::new(pixel_size, ResampleMethod::Nearest).reconcile_inputs(&inputs)?;

    let fill = T::from_f64_lossy(nodata);
    let mut codes = Vec::with_capacity(bands.len());
    let mut arrays = Vec::with_capacity(bands.len());
    for (band, raster) in bands {
        let (row, col) = match raster.grid.offset_within(&grid) {
            Some(offset) => offset,
            None => {
                log::warn!("Band {} is not aligned with the composite grid, leaving it out", band);
                continue;
            }
        };
        let (rows, cols) = raster.grid.shape();
        let mut placed = Array2::from_elem(grid.shape(), fill);
        placed
            .slice_mut(s![row..row + rows, col..col + cols])
            .assign(&raster.data);
        codes.push(band);
        arrays.push(placed);
    }

    if codes.is_empty() {
        return Err(S2Error::NoValidScenes("No band mosaics could be placed".to_string()));
    }
    Ok((grid, codes, arrays))
}

/// Builds per-band median mosaics and the multi-band composite
pub struct MosaicCompositor {
    config: MosaicConfig,
    reconciler: GridReconciler,
}

impl MosaicCompositor {
    pub fn new(config: MosaicConfig) -> Self {
        let reconciler = GridReconciler::new(config.pixel_size, config.resample);
        Self { config, reconciler }
    }

    pub fn config(&self) -> &MosaicConfig {
        &self.config
    }

    /// Path of the median mosaic of `band`
    pub fn band_output_path(&self, output_dir: &Path, band: BandCode) -> PathBuf {
        output_dir.join(format!("{}_{}_median.tif", self.config.output_name, band))
    }

    pub fn composite_path(&self, output_dir: &Path) -> PathBuf {
        output_dir.join(format!("{}_composite.tif", self.config.output_name))
    }

    /// Median mosaic of in-memory single-scene rasters. Rasters that fail to
    /// warp are left out; the first raster defines the projection.
    pub fn mosaic_rasters(&self, rasters: &[Raster<f32>]) -> S2Result<Raster<u16>> {
        let inputs: Vec<GridInput> = rasters.iter().map(|r| GridInput::from(&r.grid)).collect();
        let grid = self.reconciler.reconcile_inputs(&inputs)?;

        let mut warped = Vec::with_capacity(rasters.len());
        for (index, raster) in rasters.iter().enumerate() {
            let src_nodata = raster.nodata.unwrap_or(self.config.nodata);
            match self.reconciler.warp(raster, &grid, Some(src_nodata), self.config.nodata) {
                Ok(w) => warped.push(w.data),
                Err(e) => log::warn!("Scene {} could not be warped, skipping: {}", index, e),
            }
        }

        self.reduce(grid, warped)
    }

    /// Median mosaic of one band's scene files, written as unsigned 16-bit
    pub fn mosaic_band(&self, input: &MosaicInput, output_dir: &Path) -> S2Result<BandMosaic> {
        log::info!("Mosaicking band {} from {} scene(s)", input.band, input.paths.len());

        let grid = self.reconciler.reconcile(&input.paths)?;
        log::debug!("Band {} grid: {}x{} at {} m", input.band, grid.width, grid.height, self.config.pixel_size);

        let mut warped = Vec::with_capacity(input.paths.len());
        for path in &input.paths {
            match self.reconciler.warp_file::<f32, _>(path, &grid, Some(self.config.nodata), self.config.nodata) {
                Ok(raster) => warped.push(raster.data),
                Err(e) => log::warn!("Failed to warp {}, skipping: {}", path.display(), e),
            }
        }
        let scene_count = warped.len();

        let mosaic = self.reduce(grid, warped).map_err(|e| match e {
            S2Error::NoValidScenes(reason) => S2Error::NoValidScenes(format!(
                "Band {} has no usable scene: {}",
                input.band, reason
            )),
            other => other,
        })?;

        let path = self.band_output_path(output_dir, input.band);
        self.config.writer.write(&path, &mosaic)?;
        log::info!("✅ Band {} mosaic saved: {}", input.band, path.display());

        Ok(BandMosaic {
            band: input.band,
            path,
            grid: mosaic.grid,
            scene_count,
        })
    }

    fn reduce(&self, grid: RasterGrid, warped: Vec<Array2<f32>>) -> S2Result<Raster<u16>> {
        let median = masked_median(&warped, self.config.nodata)?;
        let nodata = self.config.nodata as f32;
        if median.iter().all(|v| v.is_nan() || *v == nodata) {
            return Err(S2Error::NoValidScenes(format!(
                "{} scene(s) carry no valid observation",
                warped.len()
            )));
        }
        let data = median.mapv(|v| u16::from_f64_lossy(v as f64));
        Raster::new(grid, data, Some(self.config.nodata))
    }

    fn mosaic_item(
        &self,
        input: &MosaicInput,
        output_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> S2Result<ItemOutcome<BandMosaic>> {
        progress.check_cancelled()?;
        if input.paths.len() < self.config.min_scenes {
            log::info!(
                "Skipping band {}: insufficient files ({})",
                input.band,
                input.paths.len()
            );
            return Ok(ItemOutcome::Skipped {
                reason: format!("insufficient files ({})", input.paths.len()),
            });
        }
        Ok(match self.mosaic_band(input, output_dir) {
            Ok(mosaic) => ItemOutcome::Success(mosaic),
            Err(S2Error::Cancelled) => return Err(S2Error::Cancelled),
            Err(e) => {
                log::error!("Band {} mosaic failed: {}", input.band, e);
                ItemOutcome::Failed { error: e.to_string() }
            }
        })
    }

    /// Mosaic every band independently; one band failing does not affect the others
    pub fn mosaic_all(
        &self,
        inputs: &[MosaicInput],
        output_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> S2Result<BatchReport<BandCode, BandMosaic>> {
        #[cfg(feature = "parallel")]
        let outcomes: Vec<S2Result<ItemOutcome<BandMosaic>>> = inputs
            .par_iter()
            .map(|input| self.mosaic_item(input, output_dir, progress))
            .collect();
        #[cfg(not(feature = "parallel"))]
        let outcomes: Vec<S2Result<ItemOutcome<BandMosaic>>> = inputs
            .iter()
            .map(|input| self.mosaic_item(input, output_dir, progress))
            .collect();

        let mut report = BatchReport::new();
        for (input, outcome) in inputs.iter().zip(outcomes) {
            report.record(input.band, outcome?);
        }
        Ok(report)
    }

    /// Stack successful band mosaics into `<name>_composite.tif`
    pub fn assemble_composite(&self, mosaics: &[BandMosaic], output_dir: &Path) -> S2Result<CompositeProduct> {
        let mut bands = Vec::with_capacity(mosaics.len());
        for mosaic in mosaics {
            bands.push((mosaic.band, RasterReader::read_band::<u16, _>(&mosaic.path, 1)?));
        }
        let (grid, codes, arrays) = stack_bands(bands, self.config.pixel_size, self.config.nodata)?;

        let path = self.composite_path(output_dir);
        let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
        self.config
            .writer
            .write_bands(&path, &grid, &views, Some(self.config.nodata))?;

        log::info!(
            "✅ Composite with bands {:?} saved: {}",
            codes.iter().map(|b| b.as_str()).collect::<Vec<_>>(),
            path.display()
        );
        Ok(CompositeProduct {
            path,
            bands: codes,
            grid,
        })
    }

    /// Discover masked scene outputs, mosaic every configured band and build
    /// the composite. Fails with `NoValidScenes` when no band succeeded.
    pub fn run<P: AsRef<Path>>(
        &self,
        scene_dirs: &[P],
        output_dir: &Path,
        progress: &dyn ProgressReporter,
    ) -> S2Result<MosaicRun> {
        progress.step(0, "Collecting masked scene outputs")?;
        let inputs = collect_mosaic_inputs(scene_dirs, &self.config.bands)?;
        for input in &inputs {
            log::info!("Band {}: {} file(s)", input.band, input.paths.len());
        }
        std::fs::create_dir_all(output_dir)?;

        progress.step(10, "Computing band medians")?;
        let report = self.mosaic_all(&inputs, output_dir, progress)?;
        log::info!(
            "Band mosaics: {} succeeded, {} skipped, {} failed",
            report.success_count(),
            report.skipped_count(),
            report.failed_count()
        );

        if !report.is_success() {
            let reasons: Vec<String> = report
                .outcomes
                .iter()
                .map(|(band, outcome)| match outcome {
                    ItemOutcome::Skipped { reason } => format!("{}: skipped, {}", band, reason),
                    ItemOutcome::Failed { error } => format!("{}: {}", band, error),
                    ItemOutcome::Success(_) => format!("{}: ok", band),
                })
                .collect();
            return Err(S2Error::NoValidScenes(if reasons.is_empty() {
                "no masked band files found".to_string()
            } else {
                reasons.join("; ")
            }));
        }

        progress.step(90, "Assembling composite")?;
        let mosaics: Vec<BandMosaic> = report.successes().map(|(_, m)| m.clone()).collect();
        let composite = self.assemble_composite(&mosaics, output_dir)?;
        progress.step(100, "Mosaic complete")?;

        Ok(MosaicRun {
            bands: report,
            composite,
        })
    }
}
