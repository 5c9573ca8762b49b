//! Python extension module `_core`

use crate::core::cloud_mask::{
    bare_soil_index as compute_bsi, ClassifierConfig, CloudClassifier, MaskSynthesisConfig, MaskSynthesizer,
};
use crate::core::mosaic::{masked_median, MosaicCompositor, MosaicConfig};
use crate::core::pipeline::{CropExtent, ScenePipeline, ScenePipelineConfig};
use crate::core::progress::{NoProgress, ProgressReporter};
use crate::core::reflectance::ReflectanceCalibrator;
use crate::io::scene::SceneLocator;
use crate::types::{
    BandCode, BoundingBox, ItemOutcome, RasterGrid, ReflectanceStack, S2Error, S2Result, UsabilityMask,
};
use ndarray::{Array2, Array3, ArrayView3, Axis};
use numpy::{PyReadonlyArray2, PyReadonlyArray3, ToPyArray};
use pyo3::exceptions::{PyInterruptedError, PyRuntimeError, PyValueError};
use pyo3::prelude::*;
use pyo3::types::PyDict;
use std::path::{Path, PathBuf};

fn to_py_err(err: S2Error) -> PyErr {
    match err {
        S2Error::InvalidInput(_) | S2Error::Calibration(_) | S2Error::Classifier(_) => {
            PyValueError::new_err(err.to_string())
        }
        S2Error::Cancelled => PyInterruptedError::new_err(err.to_string()),
        other => PyRuntimeError::new_err(other.to_string()),
    }
}

/// Python callable used as cloud detector. It receives reflectance shaped
/// `(1, rows, cols, bands)` and a dict with the classifier settings, and
/// returns anything numpy can turn into a `(rows, cols)` boolean mask.
struct PyClassifier {
    callable: PyObject,
}

impl CloudClassifier for PyClassifier {
    fn classify(&self, reflectance: ArrayView3<f32>, config: &ClassifierConfig) -> S2Result<UsabilityMask> {
        Python::with_gil(|py| -> PyResult<UsabilityMask> {
            let batch = reflectance.permuted_axes([1, 2, 0]).insert_axis(Axis(0));
            let settings = PyDict::new(py);
            settings.set_item("threshold", config.threshold)?;
            settings.set_item("average_over", config.average_over)?;
            settings.set_item("dilation_size", config.dilation_size)?;
            settings.set_item("all_bands", config.all_bands)?;

            let result = self.callable.call1(py, (batch.to_pyarray(py), settings))?;
            let numpy = py.import("numpy")?;
            let mask = numpy
                .call_method1("asarray", (result,))?
                .call_method1("astype", ("bool",))?
                .call_method0("squeeze")?;
            let mask: PyReadonlyArray2<bool> = mask.extract()?;
            Ok(mask.as_array().to_owned())
        })
        .map_err(|e| S2Error::Classifier(e.to_string()))
    }
}

/// Adapts a host progress object with `set_detail`, `set_value` and
/// `is_cancelled` methods; missing methods are ignored
struct PyProgress {
    target: PyObject,
}

impl PyProgress {
    fn call(&self, method: &str, arg: impl IntoPy<Py<pyo3::types::PyTuple>>) -> Option<PyObject> {
        Python::with_gil(|py| {
            let target = self.target.as_ref(py);
            if !target.hasattr(method).unwrap_or(false) {
                return None;
            }
            match target.call_method1(method, arg) {
                Ok(value) => Some(value.into()),
                Err(e) => {
                    log::warn!("Progress callback {} failed: {}", method, e);
                    None
                }
            }
        })
    }
}

impl ProgressReporter for PyProgress {
    fn report_detail(&self, detail: &str) {
        self.call("set_detail", (detail,));
    }

    fn report_progress(&self, percent: u8) {
        self.call("set_value", (percent,));
    }

    fn is_cancelled(&self) -> bool {
        self.call("is_cancelled", ())
            .map(|value| Python::with_gil(|py| value.as_ref(py).is_true().unwrap_or(false)))
            .unwrap_or(false)
    }
}

fn progress_from(progress: Option<PyObject>) -> Box<dyn ProgressReporter> {
    match progress {
        Some(target) => Box::new(PyProgress { target }),
        None => Box::new(NoProgress),
    }
}

fn unit_grid(rows: usize, cols: usize) -> RasterGrid {
    RasterGrid::from_bounds(BoundingBox::new(0.0, 0.0, cols as f64, rows as f64), 1.0, "")
}

/// Convert a `(bands, rows, cols)` DN cube to reflectance
#[pyfunction]
#[pyo3(signature = (dn, offset = 1000.0, quantification = 10000.0))]
fn calibrate_reflectance(
    py: Python,
    dn: PyReadonlyArray3<u16>,
    offset: f32,
    quantification: f32,
) -> PyResult<PyObject> {
    let dn = dn.as_array();
    let calibrator = ReflectanceCalibrator::new(offset, quantification);
    let mut reflectance = Array3::<f32>::zeros(dn.dim());
    for (mut out, band) in reflectance.axis_iter_mut(Axis(0)).zip(dn.axis_iter(Axis(0))) {
        out.assign(&calibrator.calibrate_band(&band.to_owned()));
    }
    Ok(reflectance.to_pyarray(py).into())
}

/// Bare soil index from SWIR1, red, NIR and blue reflectance
#[pyfunction]
fn bare_soil_index(
    py: Python,
    swir1: PyReadonlyArray2<f32>,
    red: PyReadonlyArray2<f32>,
    nir: PyReadonlyArray2<f32>,
    blue: PyReadonlyArray2<f32>,
) -> PyResult<PyObject> {
    let (rows, cols) = swir1.as_array().dim();
    let stack = ReflectanceStack::new(unit_grid(rows, cols))
        .with_band(BandCode::B11, swir1.as_array().to_owned())
        .and_then(|s| s.with_band(BandCode::B04, red.as_array().to_owned()))
        .and_then(|s| s.with_band(BandCode::B08, nir.as_array().to_owned()))
        .and_then(|s| s.with_band(BandCode::B02, blue.as_array().to_owned()))
        .map_err(to_py_err)?;
    let bsi = compute_bsi(&stack).map_err(to_py_err)?;
    Ok(bsi.to_pyarray(py).into())
}

/// Usability mask from a 13-band reflectance cube in B01..B8A..B12 order
#[pyfunction]
#[pyo3(signature = (reflectance, classifier, threshold = 0.35, average_over = 4, dilation_size = 3))]
fn synthesize_mask(
    py: Python,
    reflectance: PyReadonlyArray3<f32>,
    classifier: PyObject,
    threshold: f32,
    average_over: usize,
    dilation_size: usize,
) -> PyResult<PyObject> {
    let cube = reflectance.as_array();
    let (bands, rows, cols) = cube.dim();
    if bands != BandCode::CLASSIFIER_ORDER.len() {
        return Err(PyValueError::new_err(format!(
            "Expected {} bands, got {}",
            BandCode::CLASSIFIER_ORDER.len(),
            bands
        )));
    }
    let mut stack = ReflectanceStack::new(unit_grid(rows, cols));
    for (band, plane) in BandCode::CLASSIFIER_ORDER.iter().zip(cube.axis_iter(Axis(0))) {
        stack.insert(*band, plane.to_owned()).map_err(to_py_err)?;
    }

    let config = MaskSynthesisConfig {
        classifier: ClassifierConfig {
            threshold,
            average_over,
            dilation_size,
            ..ClassifierConfig::default()
        },
        ..MaskSynthesisConfig::default()
    };
    let synthesizer = MaskSynthesizer::with_config(PyClassifier { callable: classifier }, config);
    let components = py
        .allow_threads(|| synthesizer.synthesize(&stack))
        .map_err(to_py_err)?;

    let result = PyDict::new(py);
    result.set_item("mask", components.mask.to_pyarray(py))?;
    result.set_item("cloud", components.cloud.to_pyarray(py))?;
    result.set_item("bare_soil", components.bare_soil.to_pyarray(py))?;
    result.set_item("unusable_fraction", components.unusable_fraction())?;
    Ok(result.into())
}

/// Mask one Level-1C product found below `download_dir`
#[pyfunction]
#[pyo3(signature = (download_dir, product, output_dir, classifier, crs = None, crop = None, crop_crs = None, use_metadata = false, progress = None))]
#[allow(clippy::too_many_arguments)]
fn mask_scene(
    py: Python,
    download_dir: String,
    product: String,
    output_dir: String,
    classifier: PyObject,
    crs: Option<String>,
    crop: Option<(f64, f64, f64, f64)>,
    crop_crs: Option<String>,
    use_metadata: bool,
    progress: Option<PyObject>,
) -> PyResult<PyObject> {
    let locator = SceneLocator::new(&download_dir);
    let scene = locator.resolve_scene(&product, crs.as_deref()).map_err(to_py_err)?;

    let calibrator = if use_metadata {
        locator
            .read_metadata(&product)
            .map_err(to_py_err)?
            .map(|meta| meta.calibrator())
            .unwrap_or_default()
    } else {
        ReflectanceCalibrator::default()
    };

    let config = ScenePipelineConfig {
        calibrator,
        target_crs: crs,
        crop: crop.map(|(min_x, min_y, max_x, max_y)| CropExtent {
            bounds: BoundingBox::new(min_x, min_y, max_x, max_y),
            crs: crop_crs.clone().unwrap_or_else(|| scene.crs.clone()),
        }),
        ..ScenePipelineConfig::default()
    };
    let pipeline = ScenePipeline::with_config(PyClassifier { callable: classifier }, config);
    let progress = progress_from(progress);

    let outputs = py
        .allow_threads(|| pipeline.run(&scene, Path::new(&output_dir), &*progress))
        .map_err(to_py_err)?;

    let bands = PyDict::new(py);
    for (band, path) in &outputs.band_paths {
        bands.set_item(band.as_str(), path.to_string_lossy().to_string())?;
    }
    let result = PyDict::new(py);
    result.set_item("scene_id", &outputs.scene_id)?;
    result.set_item("output_dir", outputs.output_dir.to_string_lossy().to_string())?;
    result.set_item(
        "mask",
        outputs.mask_path.as_ref().map(|p| p.to_string_lossy().to_string()),
    )?;
    result.set_item("bands", bands)?;
    result.set_item("unusable_fraction", outputs.unusable_fraction)?;
    Ok(result.into())
}

/// Median mosaic of masked scene outputs plus the multi-band composite
#[pyfunction]
#[pyo3(signature = (scene_dirs, output_dir, output_name = "mosaic".to_string(), pixel_size = 10.0, progress = None))]
fn mosaic_scenes(
    py: Python,
    scene_dirs: Vec<String>,
    output_dir: String,
    output_name: String,
    pixel_size: f64,
    progress: Option<PyObject>,
) -> PyResult<PyObject> {
    let compositor = MosaicCompositor::new(MosaicConfig {
        output_name,
        pixel_size,
        ..MosaicConfig::default()
    });
    let dirs: Vec<PathBuf> = scene_dirs.iter().map(PathBuf::from).collect();
    let progress = progress_from(progress);

    let run = py
        .allow_threads(|| compositor.run(&dirs, Path::new(&output_dir), &*progress))
        .map_err(to_py_err)?;

    let bands = PyDict::new(py);
    let skipped = PyDict::new(py);
    let failed = PyDict::new(py);
    for (band, outcome) in &run.bands.outcomes {
        match outcome {
            ItemOutcome::Success(mosaic) => {
                bands.set_item(band.as_str(), mosaic.path.to_string_lossy().to_string())?
            }
            ItemOutcome::Skipped { reason } => skipped.set_item(band.as_str(), reason)?,
            ItemOutcome::Failed { error } => failed.set_item(band.as_str(), error)?,
        }
    }
    let composite_bands: Vec<&str> = run.composite.bands.iter().map(|b| b.as_str()).collect();

    let result = PyDict::new(py);
    result.set_item("composite", run.composite.path.to_string_lossy().to_string())?;
    result.set_item("composite_bands", composite_bands)?;
    result.set_item("bands", bands)?;
    result.set_item("skipped", skipped)?;
    result.set_item("failed", failed)?;
    Ok(result.into())
}

/// Per-pixel median of co-registered arrays, ignoring `nodata`
#[pyfunction]
#[pyo3(signature = (arrays, nodata = 0.0))]
fn median_composite(py: Python, arrays: Vec<PyReadonlyArray2<f32>>, nodata: f64) -> PyResult<PyObject> {
    let owned: Vec<Array2<f32>> = arrays.iter().map(|a| a.as_array().to_owned()).collect();
    let median = masked_median(&owned, nodata).map_err(to_py_err)?;
    Ok(median.to_pyarray(py).into())
}

#[pymodule]
fn _core(_py: Python, m: &PyModule) -> PyResult<()> {
    m.add_function(wrap_pyfunction!(calibrate_reflectance, m)?)?;
    m.add_function(wrap_pyfunction!(bare_soil_index, m)?)?;
    m.add_function(wrap_pyfunction!(synthesize_mask, m)?)?;
    m.add_function(wrap_pyfunction!(mask_scene, m)?)?;
    m.add_function(wrap_pyfunction!(mosaic_scenes, m)?)?;
    m.add_function(wrap_pyfunction!(median_composite, m)?)?;
    Ok(())
}
