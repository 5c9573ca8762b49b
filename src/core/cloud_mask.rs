use crate::types::{BandCode, ReflectanceStack, S2Error, S2Result, UsabilityMask};
use ndarray::{Array2, Array3, ArrayView3, Axis, Zip};
use serde::{Deserialize, Serialize};

/// Bands consumed by the bare soil index
const BSI_BANDS: [BandCode; 4] = [BandCode::B11, BandCode::B04, BandCode::B08, BandCode::B02];

/// Reduced band set used by the classifier when `all_bands` is off
pub const CLASSIFIER_SUBSET: [BandCode; 10] = [
    BandCode::B01,
    BandCode::B02,
    BandCode::B04,
    BandCode::B05,
    BandCode::B08,
    BandCode::B8A,
    BandCode::B09,
    BandCode::B10,
    BandCode::B11,
    BandCode::B12,
];

/// Configuration handed to the cloud classifier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierConfig {
    /// Cloud probability threshold
    pub threshold: f32,
    /// Radius of the probability averaging window
    pub average_over: usize,
    /// Dilation applied to the thresholded cloud mask
    pub dilation_size: usize,
    /// Feed all 13 bands rather than the reduced 10-band set
    pub all_bands: bool,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.35,
            average_over: 4,
            dilation_size: 3,
            all_bands: true,
        }
    }
}

impl ClassifierConfig {
    /// Bands the classifier expects, in positional order
    pub fn bands(&self) -> &'static [BandCode] {
        if self.all_bands {
            &BandCode::CLASSIFIER_ORDER
        } else {
            &CLASSIFIER_SUBSET
        }
    }
}

/// External cloud detector.
///
/// Receives reflectance shaped `(bands, rows, cols)` with bands in
/// [`ClassifierConfig::bands`] order and returns a `(rows, cols)` mask where
/// `true` marks cloud.
pub trait CloudClassifier: Send + Sync {
    fn classify(&self, reflectance: ArrayView3<f32>, config: &ClassifierConfig) -> S2Result<UsabilityMask>;
}

impl<F> CloudClassifier for F
where
    F: Fn(ArrayView3<f32>, &ClassifierConfig) -> S2Result<UsabilityMask> + Send + Sync,
{
    fn classify(&self, reflectance: ArrayView3<f32>, config: &ClassifierConfig) -> S2Result<UsabilityMask> {
        self(reflectance, config)
    }
}

/// Bare soil heuristic parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BareSoilParams {
    /// Pixels with BSI above this are bare soil candidates
    pub bsi_threshold: f32,
    /// Box filter radius (window side is `2 * average_over + 1`)
    pub average_over: usize,
    /// Cross-shaped dilation passes
    pub dilation_iterations: usize,
    /// Smoothed fraction above which a pixel stays flagged
    pub smoothing_threshold: f32,
}

impl Default for BareSoilParams {
    fn default() -> Self {
        Self {
            bsi_threshold: -0.01,
            average_over: 4,
            dilation_iterations: 3,
            smoothing_threshold: 0.5,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaskSynthesisConfig {
    pub classifier: ClassifierConfig,
    pub bare_soil: BareSoilParams,
}

/// Intermediate and final masks of one synthesis run
#[derive(Debug, Clone)]
pub struct MaskComponents {
    pub cloud: UsabilityMask,
    pub bare_soil: UsabilityMask,
    pub mask: UsabilityMask,
}

impl MaskComponents {
    /// Share of unusable pixels in the final mask
    pub fn unusable_fraction(&self) -> f64 {
        mask_fraction(&self.mask)
    }
}

/// Builds the usability mask from a reflectance stack
pub struct MaskSynthesizer<C> {
    classifier: C,
    config: MaskSynthesisConfig,
}

impl<C: CloudClassifier> MaskSynthesizer<C> {
    pub fn new(classifier: C) -> Self {
        Self {
            classifier,
            config: MaskSynthesisConfig::default(),
        }
    }

    pub fn with_config(classifier: C, config: MaskSynthesisConfig) -> Self {
        Self { classifier, config }
    }

    pub fn config(&self) -> &MaskSynthesisConfig {
        &self.config
    }

    pub fn synthesize(&self, stack: &ReflectanceStack) -> S2Result<MaskComponents> {
        log::info!("Synthesizing usability mask for {:?} grid", stack.shape());

        let missing: Vec<&str> = BSI_BANDS
            .iter()
            .filter(|band| !stack.contains(**band))
            .map(|band| band.as_str())
            .collect();
        if !missing.is_empty() {
            return Err(S2Error::Calibration(format!(
                "Bare soil index needs bands {:?}, missing {:?}",
                BSI_BANDS.iter().map(|b| b.as_str()).collect::<Vec<_>>(),
                missing
            )));
        }

        let input = classifier_input(stack, self.config.classifier.bands())?;
        log::debug!(
            "Classifier input {:?}, config {:?}",
            input.dim(),
            self.config.classifier
        );
        let cloud = self.classifier.classify(input.view(), &self.config.classifier)?;
        if cloud.dim() != stack.shape() {
            return Err(S2Error::Classifier(format!(
                "Classifier returned mask of shape {:?}, expected {:?}",
                cloud.dim(),
                stack.shape()
            )));
        }
        log::debug!("Classifier flagged {:.2}% of pixels as cloud", mask_fraction(&cloud) * 100.0);

        let bsi = bare_soil_index(stack)?;
        let bare_soil = bare_soil_mask(&bsi, &self.config.bare_soil);
        log::debug!("Bare soil mask covers {:.2}%", mask_fraction(&bare_soil) * 100.0);

        let mask = combine_masks(&cloud, &bare_soil)?;
        log::info!("✅ Usability mask: {:.2}% unusable", mask_fraction(&mask) * 100.0);

        Ok(MaskComponents {
            cloud,
            bare_soil,
            mask,
        })
    }
}

/// Stack the classifier bands along a leading axis
pub fn classifier_input(stack: &ReflectanceStack, bands: &[BandCode]) -> S2Result<Array3<f32>> {
    let missing: Vec<&str> = bands
        .iter()
        .filter(|band| !stack.contains(**band))
        .map(|band| band.as_str())
        .collect();
    if !missing.is_empty() {
        return Err(S2Error::Classifier(format!(
            "Classifier input is missing bands {:?}",
            missing
        )));
    }

    let (rows, cols) = stack.shape();
    let mut input = Array3::<f32>::zeros((bands.len(), rows, cols));
    for (mut plane, band) in input.axis_iter_mut(Axis(0)).zip(bands) {
        if let Some(data) = stack.get(*band) {
            plane.assign(data);
        }
    }
    Ok(input)
}

/// `((swir1 + red) - (nir + blue)) / ((swir1 + red) + (nir + blue))`, zero where
/// the denominator vanishes
pub fn bare_soil_index(stack: &ReflectanceStack) -> S2Result<Array2<f32>> {
    let band = |code: BandCode| {
        stack
            .get(code)
            .ok_or_else(|| S2Error::Calibration(format!("Bare soil index needs band {}", code)))
    };
    let swir1 = band(BandCode::B11)?;
    let red = band(BandCode::B04)?;
    let nir = band(BandCode::B08)?;
    let blue = band(BandCode::B02)?;

    let bsi = |&s: &f32, &r: &f32, &n: &f32, &b: &f32| {
        let soil = s + r;
        let veg = n + b;
        let denominator = soil + veg;
        if denominator == 0.0 {
            0.0
        } else {
            (soil - veg) / denominator
        }
    };

    let zip = Zip::from(swir1).and(red).and(nir).and(blue);
    #[cfg(feature = "parallel")]
    let result = zip.par_map_collect(bsi);
    #[cfg(not(feature = "parallel"))]
    let result = zip.map_collect(bsi);
    Ok(result)
}

/// Threshold, smooth and dilate the BSI into a bare soil mask
pub fn bare_soil_mask(bsi: &Array2<f32>, params: &BareSoilParams) -> UsabilityMask {
    let raw = bsi.mapv(|v| if v > params.bsi_threshold { 1.0f32 } else { 0.0 });
    let smoothed = uniform_filter(&raw, params.average_over).mapv(|v| v > params.smoothing_threshold);
    binary_dilation(&smoothed, params.dilation_iterations)
}

/// Box mean over a `(2 * radius + 1)` square window with zero padding
pub fn uniform_filter(image: &Array2<f32>, radius: usize) -> Array2<f32> {
    let (rows, cols) = image.dim();
    let size = 2 * radius + 1;
    let area = (size * size) as f64;

    // Summed-area table with a zero first row and column
    let mut integral = Array2::<f64>::zeros((rows + 1, cols + 1));
    for i in 0..rows {
        let mut row_sum = 0.0;
        for j in 0..cols {
            row_sum += image[[i, j]] as f64;
            integral[[i + 1, j + 1]] = integral[[i, j + 1]] + row_sum;
        }
    }

    Array2::from_shape_fn((rows, cols), |(i, j)| {
        let r0 = i.saturating_sub(radius);
        let c0 = j.saturating_sub(radius);
        let r1 = (i + radius + 1).min(rows);
        let c1 = (j + radius + 1).min(cols);
        let sum = integral[[r1, c1]] - integral[[r0, c1]] - integral[[r1, c0]] + integral[[r0, c0]];
        (sum / area) as f32
    })
}

/// Binary dilation with a 4-connected cross, repeated `iterations` times.
/// Pixels beyond the border count as unset.
pub fn binary_dilation(mask: &UsabilityMask, iterations: usize) -> UsabilityMask {
    let (rows, cols) = mask.dim();
    let mut current = mask.clone();
    for _ in 0..iterations {
        let previous = current.clone();
        for i in 0..rows {
            for j in 0..cols {
                if previous[[i, j]] {
                    continue;
                }
                let hit = (i > 0 && previous[[i - 1, j]])
                    || (i + 1 < rows && previous[[i + 1, j]])
                    || (j > 0 && previous[[i, j - 1]])
                    || (j + 1 < cols && previous[[i, j + 1]]);
                if hit {
                    current[[i, j]] = true;
                }
            }
        }
    }
    current
}

/// Final mask: `(NOT ((NOT cloud) OR bare_soil)) OR cloud`.
///
/// By absorption this equals `cloud` for every input, so the bare soil term
/// never changes the result. Kept as is until the intended shadow formula is
/// confirmed.
pub fn combine_masks(cloud: &UsabilityMask, bare_soil: &UsabilityMask) -> S2Result<UsabilityMask> {
    if cloud.dim() != bare_soil.dim() {
        return Err(S2Error::InvalidInput(format!(
            "Cloud mask {:?} and bare soil mask {:?} differ in shape",
            cloud.dim(),
            bare_soil.dim()
        )));
    }
    Ok(Zip::from(cloud).and(bare_soil).map_collect(|&c, &s| {
        let combined = !c || s;
        !combined || c
    }))
}

/// Share of `true` pixels
pub fn mask_fraction(mask: &UsabilityMask) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    mask.iter().filter(|&&v| v).count() as f64 / mask.len() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, RasterGrid};
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    fn grid(rows: usize, cols: usize) -> RasterGrid {
        RasterGrid::from_bounds(
            BoundingBox::new(0.0, 0.0, cols as f64 * 10.0, rows as f64 * 10.0),
            10.0,
            "",
        )
    }

    /// Deterministic pseudo-random reflectance for all 13 bands
    fn synthetic_stack(rows: usize, cols: usize, seed: u64) -> ReflectanceStack {
        let mut state = seed;
        let mut next = move || {
            state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
            ((state >> 33) as f32) / (u32::MAX >> 1) as f32
        };
        let mut stack = ReflectanceStack::new(grid(rows, cols));
        for band in BandCode::CLASSIFIER_ORDER {
            let data = Array2::from_shape_fn((rows, cols), |_| next());
            stack.insert(band, data).unwrap();
        }
        stack
    }

    /// Flags pixels whose blue reflectance exceeds the threshold
    fn blue_threshold(input: ArrayView3<f32>, config: &ClassifierConfig) -> S2Result<UsabilityMask> {
        let blue = config
            .bands()
            .iter()
            .position(|b| *b == BandCode::B02)
            .ok_or_else(|| S2Error::Classifier("no blue band".to_string()))?;
        Ok(input.index_axis(Axis(0), blue).mapv(|v| v > config.threshold))
    }

    #[test]
    fn test_bare_soil_index() {
        let g = grid(1, 3);
        let stack = ReflectanceStack::new(g)
            .with_band(BandCode::B11, arr2(&[[0.3, 0.0, 0.1]]))
            .unwrap()
            .with_band(BandCode::B04, arr2(&[[0.1, 0.0, 0.1]]))
            .unwrap()
            .with_band(BandCode::B08, arr2(&[[0.1, 0.0, 0.3]]))
            .unwrap()
            .with_band(BandCode::B02, arr2(&[[0.1, 0.0, 0.1]]))
            .unwrap();

        let bsi = bare_soil_index(&stack).unwrap();
        assert_abs_diff_eq!(bsi[[0, 0]], 1.0 / 3.0, epsilon = 1e-6);
        // Zero denominator gives zero, never NaN
        assert_eq!(bsi[[0, 1]], 0.0);
        assert_abs_diff_eq!(bsi[[0, 2]], -1.0 / 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_uniform_filter_zero_padding() {
        let ones = Array2::<f32>::ones((5, 5));
        let filtered = uniform_filter(&ones, 1);
        assert_abs_diff_eq!(filtered[[2, 2]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(filtered[[0, 0]], 4.0 / 9.0, epsilon = 1e-6);
        assert_abs_diff_eq!(filtered[[0, 2]], 6.0 / 9.0, epsilon = 1e-6);

        let identity = uniform_filter(&ones, 0);
        assert_eq!(identity, ones);
    }

    #[test]
    fn test_binary_dilation_cross() {
        let mut mask = Array2::from_elem((7, 7), false);
        mask[[3, 3]] = true;

        let once = binary_dilation(&mask, 1);
        assert_eq!(once.iter().filter(|&&v| v).count(), 5);
        assert!(once[[2, 3]] && once[[4, 3]] && once[[3, 2]] && once[[3, 4]]);
        assert!(!once[[2, 2]]);

        // Three passes grow a diamond of radius 3
        let thrice = binary_dilation(&mask, 3);
        assert_eq!(thrice.iter().filter(|&&v| v).count(), 25);
        assert!(thrice[[0, 3]] && thrice[[3, 6]]);
        assert!(!thrice[[0, 0]]);

        let mut corner = Array2::from_elem((3, 3), false);
        corner[[0, 0]] = true;
        assert_eq!(binary_dilation(&corner, 1).iter().filter(|&&v| v).count(), 3);
    }

    #[test]
    fn test_bare_soil_mask_drops_isolated_pixels() {
        let mut bsi = Array2::from_elem((20, 20), -0.5f32);
        bsi[[10, 10]] = 0.5;
        let mask = bare_soil_mask(&bsi, &BareSoilParams::default());
        assert!(mask.iter().all(|&v| !v));

        let soil = Array2::from_elem((20, 20), 0.2f32);
        let mask = bare_soil_mask(&soil, &BareSoilParams::default());
        assert!(mask[[10, 10]]);
        // Corner windows average to 25/81 before dilation re-grows them
        assert!(mask[[0, 0]]);
    }

    #[test]
    fn test_final_mask_equals_cloud_mask() {
        for seed in 1..6u64 {
            let stack = synthetic_stack(24, 31, seed);
            let synthesizer = MaskSynthesizer::new(blue_threshold);
            let components = synthesizer.synthesize(&stack).unwrap();

            assert_eq!(components.mask, components.cloud);
            assert!(components.cloud.iter().any(|&v| v));
            assert!(components.cloud.iter().any(|&v| !v));
        }
    }

    #[test]
    fn test_combine_masks_ignores_bare_soil() {
        let cloud = arr2(&[[true, false], [true, false]]);
        let soil = arr2(&[[true, true], [false, false]]);
        assert_eq!(combine_masks(&cloud, &soil).unwrap(), cloud);
    }

    #[test]
    fn test_missing_bsi_band_is_calibration_error() {
        let mut stack = ReflectanceStack::new(grid(4, 4));
        for band in BandCode::CLASSIFIER_ORDER {
            if band != BandCode::B08 {
                stack.insert(band, Array2::zeros((4, 4))).unwrap();
            }
        }
        let result = MaskSynthesizer::new(blue_threshold).synthesize(&stack);
        assert!(matches!(result, Err(S2Error::Calibration(_))));
    }

    #[test]
    fn test_missing_classifier_band_is_classifier_error() {
        let mut stack = ReflectanceStack::new(grid(4, 4));
        for band in BSI_BANDS {
            stack.insert(band, Array2::zeros((4, 4))).unwrap();
        }
        let result = MaskSynthesizer::new(blue_threshold).synthesize(&stack);
        assert!(matches!(result, Err(S2Error::Classifier(_))));
    }

    #[test]
    fn test_wrong_classifier_shape_is_rejected() {
        let stack = synthetic_stack(6, 6, 42);
        fn truncated(_: ArrayView3<f32>, _: &ClassifierConfig) -> S2Result<UsabilityMask> {
            Ok(Array2::from_elem((5, 6), false))
        }
        let result = MaskSynthesizer::new(truncated).synthesize(&stack);
        assert!(matches!(result, Err(S2Error::Classifier(_))));
    }

    #[test]
    fn test_classifier_input_order() {
        let stack = synthetic_stack(3, 3, 7);
        let input = classifier_input(&stack, &BandCode::CLASSIFIER_ORDER).unwrap();
        assert_eq!(input.dim(), (13, 3, 3));
        assert_eq!(input.index_axis(Axis(0), 8), *stack.get(BandCode::B8A).unwrap());

        let subset = classifier_input(&stack, &CLASSIFIER_SUBSET).unwrap();
        assert_eq!(subset.dim(), (10, 3, 3));
        assert_eq!(subset.index_axis(Axis(0), 2), *stack.get(BandCode::B04).unwrap());
    }
}
