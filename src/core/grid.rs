use crate::io::raster::RasterReader;
use crate::types::{BoundingBox, Pixel, Raster, RasterGrid, S2Error, S2Result};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Resampling kernel used when warping onto a grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResampleMethod {
    /// Preserves discrete values (DN inputs of the masking pipeline)
    Nearest,
    /// Smooth blending across scene boundaries (mosaics)
    Bilinear,
}

/// Extent and projection of one grid input
#[derive(Debug, Clone)]
pub struct GridInput {
    pub bounds: BoundingBox,
    pub projection: String,
}

impl From<&RasterGrid> for GridInput {
    fn from(grid: &RasterGrid) -> Self {
        Self {
            bounds: grid.bounds,
            projection: grid.projection.clone(),
        }
    }
}

/// Computes a common pixel grid over several rasters and warps them onto it
#[derive(Debug, Clone)]
pub struct GridReconciler {
    pixel_size: f64,
    target_projection: Option<String>,
    resample: ResampleMethod,
}

impl GridReconciler {
    pub fn new(pixel_size: f64, resample: ResampleMethod) -> Self {
        Self {
            pixel_size,
            target_projection: None,
            resample,
        }
    }

    /// Reproject into this CRS; without it the reference raster's projection is used
    pub fn with_target_projection(mut self, projection: impl Into<String>) -> Self {
        let projection = projection.into();
        self.target_projection = if projection.trim().is_empty() {
            None
        } else {
            Some(projection)
        };
        self
    }

    pub fn pixel_size(&self) -> f64 {
        self.pixel_size
    }

    pub fn resample_method(&self) -> ResampleMethod {
        self.resample
    }

    /// Union grid over raster files. The first file is the reference and must
    /// open; later files that cannot be opened are left out of the union.
    pub fn reconcile<P: AsRef<Path>>(&self, paths: &[P]) -> S2Result<RasterGrid> {
        let (reference, rest) = paths
            .split_first()
            .ok_or_else(|| S2Error::InvalidInput("No input rasters provided".to_string()))?;

        let reference_info =
            RasterReader::info(reference).map_err(|e| S2Error::ReferenceUnavailable {
                path: reference.as_ref().to_path_buf(),
                reason: e.to_string(),
            })?;

        let mut inputs = vec![GridInput::from(&reference_info.grid)];
        for path in rest {
            match RasterReader::info(path) {
                Ok(info) => inputs.push(GridInput::from(&info.grid)),
                Err(e) => log::warn!(
                    "Skipping {} in grid union: {}",
                    path.as_ref().display(),
                    e
                ),
            }
        }

        self.reconcile_inputs(&inputs)
    }

    /// Union grid over in-memory extents; the first input is the reference
    pub fn reconcile_inputs(&self, inputs: &[GridInput]) -> S2Result<RasterGrid> {
        if !(self.pixel_size > 0.0) {
            return Err(S2Error::InvalidInput(format!(
                "Pixel size must be positive, got {}",
                self.pixel_size
            )));
        }
        let reference = inputs
            .first()
            .ok_or_else(|| S2Error::InvalidInput("No input rasters provided".to_string()))?;

        let target_projection = match &self.target_projection {
            Some(definition) => normalize_projection(definition),
            None => reference.projection.clone(),
        };

        let mut union: Option<BoundingBox> = None;
        for input in inputs {
            let bounds = transform_bounds(&input.bounds, &input.projection, &target_projection)?;
            union = Some(match union {
                Some(acc) => acc.union(&bounds),
                None => bounds,
            });
        }
        // `inputs` is non-empty so the union is always set
        let union = union.unwrap_or(reference.bounds);

        let snapped = union.snap_outward(self.pixel_size);
        let grid = RasterGrid::from_bounds(snapped, self.pixel_size, target_projection);

        log::debug!(
            "Reconciled {} input(s) onto {}x{} grid at {} m, bounds {:?}",
            inputs.len(),
            grid.width,
            grid.height,
            self.pixel_size,
            grid.bounds
        );
        Ok(grid)
    }

    /// Restrict a grid to an area of interest given in any CRS, snapped outward
    pub fn crop(&self, grid: &RasterGrid, area: &BoundingBox, area_projection: &str) -> S2Result<RasterGrid> {
        let area = transform_bounds(area, area_projection, &grid.projection)?;
        let overlap = grid.bounds.intersection(&area).ok_or_else(|| {
            S2Error::InvalidInput(format!(
                "Crop extent {:?} does not intersect grid bounds {:?}",
                area, grid.bounds
            ))
        })?;
        let snapped = overlap.snap_outward(self.pixel_size);
        Ok(RasterGrid::from_bounds(snapped, self.pixel_size, grid.projection.clone()))
    }

    /// Read band 1 of a file and warp it onto `target`
    pub fn warp_file<T: Pixel, P: AsRef<Path>>(
        &self,
        path: P,
        target: &RasterGrid,
        src_nodata: Option<f64>,
        dst_nodata: f64,
    ) -> S2Result<Raster<T>> {
        let source = RasterReader::read_band::<T, _>(path, 1)?;
        self.warp(&source, target, src_nodata, dst_nodata)
    }

    /// Resample a raster onto `target`. Target pixels falling outside the
    /// source, or only on source nodata, receive `dst_nodata`.
    pub fn warp<T: Pixel>(
        &self,
        source: &Raster<T>,
        target: &RasterGrid,
        src_nodata: Option<f64>,
        dst_nodata: f64,
    ) -> S2Result<Raster<T>> {
        let (target_rows, target_cols) = target.shape();
        let fill = T::from_f64_lossy(dst_nodata);
        let mut data = Array2::from_elem((target_rows, target_cols), fill);

        let transform = if needs_reprojection(&target.projection, &source.grid.projection) {
            Some(coord_transform(&target.projection, &source.grid.projection)?)
        } else {
            None
        };

        let sampler = Sampler {
            data: &source.data,
            transform: &source.grid.geo_transform,
            nodata: src_nodata,
        };

        let mut xs = vec![0.0; target_cols];
        let mut ys = vec![0.0; target_cols];
        let mut zs = vec![0.0; target_cols];
        for i in 0..target_rows {
            for j in 0..target_cols {
                let (x, y) = target
                    .geo_transform
                    .pixel_to_geo(j as f64 + 0.5, i as f64 + 0.5);
                xs[j] = x;
                ys[j] = y;
                zs[j] = 0.0;
            }
            if let Some(ct) = &transform {
                ct.transform_coords(&mut xs, &mut ys, &mut zs)?;
            }
            for j in 0..target_cols {
                let value = match self.resample {
                    ResampleMethod::Nearest => sampler.nearest(xs[j], ys[j]),
                    ResampleMethod::Bilinear => sampler
                        .bilinear(xs[j], ys[j])
                        .map(T::from_f64_lossy),
                };
                if let Some(value) = value {
                    data[[i, j]] = value;
                }
            }
        }

        Raster::new(target.clone(), data, Some(dst_nodata))
    }
}

struct Sampler<'a, T> {
    data: &'a Array2<T>,
    transform: &'a crate::types::GeoTransform,
    nodata: Option<f64>,
}

impl<'a, T: Pixel> Sampler<'a, T> {
    fn valid(&self, value: T) -> bool {
        let v = value.as_f64();
        !v.is_nan() && self.nodata.map_or(true, |nd| v != nd)
    }

    /// Source pixel containing the point
    fn nearest(&self, x: f64, y: f64) -> Option<T> {
        let (col, row) = self.transform.geo_to_pixel(x, y);
        let (rows, cols) = self.data.dim();
        if !(col >= 0.0 && row >= 0.0 && col < cols as f64 && row < rows as f64) {
            return None;
        }
        let value = self.data[[row.floor() as usize, col.floor() as usize]];
        self.valid(value).then_some(value)
    }

    /// Bilinear interpolation between source pixel centers; nodata neighbours
    /// are dropped and the remaining weights renormalised
    fn bilinear(&self, x: f64, y: f64) -> Option<f64> {
        let (col, row) = self.transform.geo_to_pixel(x, y);
        let (rows, cols) = self.data.dim();
        if !(col >= 0.0 && row >= 0.0 && col < cols as f64 && row < rows as f64) {
            return None;
        }

        let fx = (col - 0.5).max(0.0);
        let fy = (row - 0.5).max(0.0);
        let x1 = (fx.floor() as usize).min(cols - 1);
        let y1 = (fy.floor() as usize).min(rows - 1);
        let x2 = (x1 + 1).min(cols - 1);
        let y2 = (y1 + 1).min(rows - 1);
        let dx = fx - x1 as f64;
        let dy = fy - y1 as f64;

        let neighbours = [
            (y1, x1, (1.0 - dx) * (1.0 - dy)),
            (y1, x2, dx * (1.0 - dy)),
            (y2, x1, (1.0 - dx) * dy),
            (y2, x2, dx * dy),
        ];

        let mut sum = 0.0;
        let mut weight_sum = 0.0;
        for (r, c, w) in neighbours {
            let value = self.data[[r, c]];
            if w > 0.0 && self.valid(value) {
                sum += value.as_f64() * w;
                weight_sum += w;
            }
        }

        if weight_sum > 0.0 {
            Some(sum / weight_sum)
        } else {
            None
        }
    }
}

/// WKT for a user-supplied CRS definition such as `EPSG:32633`
fn normalize_projection(definition: &str) -> String {
    match SpatialRef::from_definition(definition).and_then(|srs| srs.to_wkt()) {
        Ok(wkt) => wkt,
        Err(e) => {
            log::warn!("Could not resolve CRS {}: {}", definition, e);
            definition.to_string()
        }
    }
}

fn needs_reprojection(target: &str, source: &str) -> bool {
    if target.trim().is_empty() || source.trim().is_empty() || target == source {
        return false;
    }
    match (spatial_ref(target), spatial_ref(source)) {
        (Ok(t), Ok(s)) => t != s,
        _ => true,
    }
}

fn spatial_ref(definition: &str) -> S2Result<SpatialRef> {
    let srs = SpatialRef::from_definition(definition)?;
    // Keep x = easting/longitude regardless of the authority axis order
    srs.set_axis_mapping_strategy(gdal_sys::OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
    Ok(srs)
}

fn coord_transform(from: &str, to: &str) -> S2Result<CoordTransform> {
    let source = spatial_ref(from)?;
    let target = spatial_ref(to)?;
    Ok(CoordTransform::new(&source, &target)?)
}

/// Reproject a bounding box by densifying its edges
pub fn transform_bounds(bounds: &BoundingBox, from: &str, to: &str) -> S2Result<BoundingBox> {
    if !needs_reprojection(to, from) {
        return Ok(*bounds);
    }
    const EDGE_POINTS: usize = 21;

    let transform = coord_transform(from, to)?;
    let mut xs = Vec::with_capacity(EDGE_POINTS * 4);
    let mut ys = Vec::with_capacity(EDGE_POINTS * 4);
    for k in 0..EDGE_POINTS {
        let t = k as f64 / (EDGE_POINTS - 1) as f64;
        let x = bounds.min_x + t * bounds.width();
        let y = bounds.min_y + t * bounds.height();
        xs.extend_from_slice(&[x, x, bounds.min_x, bounds.max_x]);
        ys.extend_from_slice(&[bounds.min_y, bounds.max_y, y, y]);
    }
    let mut zs = vec![0.0; xs.len()];
    transform.transform_coords(&mut xs, &mut ys, &mut zs)?;

    let mut result = BoundingBox::new(f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY);
    for (&x, &y) in xs.iter().zip(ys.iter()) {
        if x.is_finite() && y.is_finite() {
            result.min_x = result.min_x.min(x);
            result.min_y = result.min_y.min(y);
            result.max_x = result.max_x.max(x);
            result.max_y = result.max_y.max(y);
        }
    }
    if !(result.min_x < result.max_x && result.min_y < result.max_y) {
        return Err(S2Error::Processing(format!(
            "Could not reproject bounds {:?} from {} to {}",
            bounds, from, to
        )));
    }
    Ok(result)
}
