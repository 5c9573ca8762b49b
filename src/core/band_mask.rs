use crate::types::{Pixel, Raster, S2Error, S2Result, UsabilityMask};
use ndarray::{Array2, Zip};

/// Nodata value of masked band outputs
pub const MASKED_NODATA: f64 = 0.0;

/// Zeroes unusable pixels of DN band rasters
#[derive(Debug, Clone, Copy, Default)]
pub struct BandMasker;

impl BandMasker {
    pub fn new() -> Self {
        Self
    }

    /// `output = input * (1 - mask)` on the raw array
    pub fn apply_array<T: Pixel>(&self, band: &Array2<T>, mask: &UsabilityMask) -> S2Result<Array2<T>> {
        if band.dim() != mask.dim() {
            return Err(S2Error::InvalidInput(format!(
                "Band shape {:?} does not match mask shape {:?}",
                band.dim(),
                mask.dim()
            )));
        }

        let masked = Zip::from(band)
            .and(mask)
            .map_collect(|&value, &unusable| if unusable { T::zero() } else { value });
        Ok(masked)
    }

    /// Mask a raster; the result carries nodata 0
    pub fn apply<T: Pixel>(&self, band: &Raster<T>, mask: &UsabilityMask) -> S2Result<Raster<T>> {
        let data = self.apply_array(&band.data, mask)?;
        let masked_count = mask.iter().filter(|&&m| m).count();
        log::debug!(
            "Masked {} of {} pixels ({:.1}%)",
            masked_count,
            mask.len(),
            if mask.is_empty() {
                0.0
            } else {
                masked_count as f64 * 100.0 / mask.len() as f64
            }
        );
        Raster::new(band.grid.clone(), data, Some(MASKED_NODATA))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BoundingBox, RasterGrid};
    use ndarray::arr2;

    #[test]
    fn test_masked_pixels_become_zero() {
        let grid = RasterGrid::from_bounds(BoundingBox::new(0.0, 0.0, 30.0, 20.0), 10.0, "");
        let band = Raster::new(grid, arr2(&[[1200u16, 1300, 1400], [1500, 1600, 1700]]), None).unwrap();
        let mask = arr2(&[[true, false, false], [false, true, true]]);

        let masked = BandMasker::new().apply(&band, &mask).unwrap();

        for ((idx, &out), &m) in masked.data.indexed_iter().zip(mask.iter()) {
            if m {
                assert_eq!(out, 0);
            } else {
                assert_eq!(out, band.data[idx]);
            }
        }
        assert_eq!(masked.nodata, Some(0.0));
        assert_eq!(masked.grid, band.grid);
    }

    #[test]
    fn test_shape_mismatch() {
        let band = Array2::<f32>::ones((2, 2));
        let mask = Array2::from_elem((2, 3), false);
        assert!(matches!(
            BandMasker::new().apply_array(&band, &mask),
            Err(S2Error::InvalidInput(_))
        ));
    }
}
