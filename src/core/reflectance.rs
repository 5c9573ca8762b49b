use crate::types::{BandStack, Pixel, ReflectanceStack, S2Result};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Converts Level-1C digital numbers to top-of-atmosphere reflectance:
/// `clip((dn - offset) / quantification, 0, 1)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReflectanceCalibrator {
    /// Radiometric offset subtracted from each DN (processing baseline 04.00+)
    pub offset: f32,
    /// Quantification value mapping DN to reflectance
    pub quantification: f32,
}

impl Default for ReflectanceCalibrator {
    fn default() -> Self {
        Self {
            offset: 1000.0,
            quantification: 10000.0,
        }
    }
}

impl ReflectanceCalibrator {
    pub fn new(offset: f32, quantification: f32) -> Self {
        Self {
            offset,
            quantification,
        }
    }

    #[inline]
    fn reflectance(&self, dn: f64) -> f32 {
        let value = ((dn - self.offset as f64) / self.quantification as f64) as f32;
        if value.is_nan() {
            0.0
        } else {
            value.clamp(0.0, 1.0)
        }
    }

    /// Calibrate one band of digital numbers
    pub fn calibrate_band<T: Pixel>(&self, dn: &Array2<T>) -> Array2<f32> {
        #[cfg(feature = "parallel")]
        {
            Zip::from(dn).par_map_collect(|&value| self.reflectance(value.as_f64()))
        }
        #[cfg(not(feature = "parallel"))]
        {
            Zip::from(dn).map_collect(|&value| self.reflectance(value.as_f64()))
        }
    }

    /// Calibrate every band of a DN stack, keeping the grid and band codes
    pub fn calibrate<T: Pixel>(&self, stack: &BandStack<T>) -> S2Result<ReflectanceStack> {
        log::info!(
            "Calibrating {} band(s) to reflectance (offset {}, quantification {})",
            stack.len(),
            self.offset,
            self.quantification
        );

        let mut reflectance = ReflectanceStack::new(stack.grid().clone());
        for (&band, data) in stack.iter() {
            reflectance.insert(band, self.calibrate_band(data))?;
        }

        log::debug!("Reflectance stack bands: {:?}", reflectance.band_codes());
        Ok(reflectance)
    }
}
