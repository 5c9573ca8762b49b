use crate::types::{GeoTransform, Pixel, Raster, RasterGrid, S2Error, S2Result};
use gdal::raster::{Buffer, RasterCreationOption};
use gdal::{Dataset, DriverManager};
use ndarray::{Array2, ArrayView2};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Georeferencing and layout of a raster file
#[derive(Debug, Clone)]
pub struct RasterInfo {
    pub grid: RasterGrid,
    pub band_count: usize,
    pub nodata: Option<f64>,
}

/// GDAL-backed raster reader
pub struct RasterReader;

impl RasterReader {
    /// Read grid, band count and first-band nodata without loading pixels
    pub fn info<P: AsRef<Path>>(path: P) -> S2Result<RasterInfo> {
        let dataset = Dataset::open(path.as_ref())?;
        let grid = Self::grid_of(&dataset)?;
        let band_count = dataset.raster_count().max(0) as usize;
        let nodata = if band_count > 0 {
            dataset.rasterband(1)?.no_data_value()
        } else {
            None
        };
        Ok(RasterInfo {
            grid,
            band_count,
            nodata,
        })
    }

    /// Read one band (1-based) as an in-memory raster
    pub fn read_band<T: Pixel, P: AsRef<Path>>(path: P, band_index: isize) -> S2Result<Raster<T>> {
        log::debug!("Reading band {} from: {}", band_index, path.as_ref().display());

        let dataset = Dataset::open(path.as_ref())?;
        let grid = Self::grid_of(&dataset)?;
        let (width, height) = dataset.raster_size();

        let rasterband = dataset.rasterband(band_index)?;
        let nodata = rasterband.no_data_value();
        let band_data = rasterband.read_as::<T>((0, 0), (width, height), (width, height), None)?;

        let data = Array2::from_shape_vec((height, width), band_data.data)
            .map_err(|e| S2Error::Processing(format!("Failed to reshape raster data: {}", e)))?;

        Raster::new(grid, data, nodata)
    }

    fn grid_of(dataset: &Dataset) -> S2Result<RasterGrid> {
        let geo_transform = GeoTransform::from_gdal(dataset.geo_transform()?);
        let (width, height) = dataset.raster_size();
        Ok(RasterGrid::from_geo_transform(
            geo_transform,
            width,
            height,
            dataset.projection(),
        ))
    }
}

/// GeoTIFF writer carrying creation options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RasterWriter {
    /// GTiff COMPRESS creation option (e.g. "LZW"); `None` writes uncompressed
    pub compress: Option<String>,
    pub tiled: bool,
}

impl Default for RasterWriter {
    fn default() -> Self {
        Self {
            compress: Some("LZW".to_string()),
            tiled: true,
        }
    }
}

impl RasterWriter {
    pub fn uncompressed() -> Self {
        Self {
            compress: None,
            tiled: false,
        }
    }

    /// Write a single-band raster
    pub fn write<T: Pixel, P: AsRef<Path>>(&self, path: P, raster: &Raster<T>) -> S2Result<()> {
        self.write_bands(path, &raster.grid, &[raster.data.view()], raster.nodata)
    }

    /// Write a boolean mask as unsigned 8-bit (1 = set)
    pub fn write_mask<P: AsRef<Path>>(
        &self,
        path: P,
        grid: &RasterGrid,
        mask: &Array2<bool>,
    ) -> S2Result<()> {
        let data = mask.mapv(u8::from);
        self.write_bands(path, grid, &[data.view()], None)
    }

    /// Write several equally-shaped bands into one GeoTIFF
    pub fn write_bands<T: Pixel, P: AsRef<Path>>(
        &self,
        path: P,
        grid: &RasterGrid,
        bands: &[ArrayView2<T>],
        nodata: Option<f64>,
    ) -> S2Result<()> {
        let path = path.as_ref();
        log::debug!("Writing {} band(s) to GeoTIFF: {}", bands.len(), path.display());

        if bands.is_empty() {
            return Err(S2Error::InvalidInput(format!(
                "No bands to write to {}",
                path.display()
            )));
        }
        for band in bands {
            if band.dim() != grid.shape() {
                return Err(S2Error::InvalidInput(format!(
                    "Band shape {:?} does not match grid shape {:?}",
                    band.dim(),
                    grid.shape()
                )));
            }
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let (height, width) = grid.shape();

        let mut options = Vec::new();
        if let Some(compress) = &self.compress {
            options.push(RasterCreationOption {
                key: "COMPRESS",
                value: compress.as_str(),
            });
        }
        if self.tiled {
            options.push(RasterCreationOption {
                key: "TILED",
                value: "YES",
            });
        }

        let mut dataset = driver.create_with_band_type_with_options::<T, _>(
            path,
            width as isize,
            height as isize,
            bands.len() as isize,
            &options,
        )?;

        dataset.set_geo_transform(&grid.geo_transform.to_gdal())?;
        if !grid.projection.is_empty() {
            dataset.set_projection(&grid.projection)?;
        }

        for (index, band) in bands.iter().enumerate() {
            let mut rasterband = dataset.rasterband(index as isize + 1)?;
            let flat_data: Vec<T> = band.iter().copied().collect();
            let buffer = Buffer::new((width, height), flat_data);
            rasterband.write((0, 0), (width, height), &buffer)?;
            if let Some(value) = nodata {
                rasterband.set_no_data_value(Some(value))?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use tempfile::TempDir;

    #[test]
    fn test_write_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("band.tif");

        let grid = RasterGrid::from_bounds(BoundingBox::new(500000.0, 4000000.0, 500040.0, 4000030.0), 10.0, "");
        let data = Array2::from_shape_fn((3, 4), |(i, j)| (i * 4 + j) as u16);
        let raster = Raster::new(grid.clone(), data.clone(), Some(0.0)).unwrap();

        RasterWriter::default().write(&path, &raster).unwrap();

        let info = RasterReader::info(&path).unwrap();
        assert_eq!(info.band_count, 1);
        assert_eq!(info.grid.shape(), (3, 4));
        assert_eq!(info.nodata, Some(0.0));
        assert_eq!(info.grid.bounds, grid.bounds);

        let back = RasterReader::read_band::<u16, _>(&path, 1).unwrap();
        assert_eq!(back.data, data);
    }

    #[test]
    fn test_write_rejects_shape_mismatch() {
        let dir = TempDir::new().unwrap();
        let grid = RasterGrid::from_bounds(BoundingBox::new(0.0, 0.0, 20.0, 20.0), 10.0, "");
        let wrong = Array2::<u16>::zeros((3, 3));
        let result = RasterWriter::uncompressed().write_bands(dir.path().join("x.tif"), &grid, &[wrong.view()], None);
        assert!(matches!(result, Err(S2Error::InvalidInput(_))));
    }
}
