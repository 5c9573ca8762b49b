use crate::io::metadata::{ProductMetadata, ProductName};
use crate::types::{BandCode, MosaicInput, S2Error, S2Result, Scene};
use regex::Regex;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Locates band files of Sentinel-2 products below a download directory
pub struct SceneLocator {
    root: PathBuf,
    extension: String,
}

impl SceneLocator {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            extension: "jp2".to_string(),
        }
    }

    /// Match band files with another extension (e.g. "tif" for converted products)
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = extension.trim_start_matches('.').to_lowercase();
        self
    }

    /// Directory holding a product, with or without the `.SAFE` suffix
    pub fn product_dir(&self, product: &str) -> Option<PathBuf> {
        let stem = product.trim_end_matches(".SAFE");
        [stem.to_string(), format!("{}.SAFE", stem)]
            .iter()
            .map(|name| self.root.join(name))
            .find(|path| path.is_dir())
    }

    /// All files below the product that could hold `band`, sorted
    pub fn band_candidates(&self, product: &str, band: BandCode) -> S2Result<Vec<PathBuf>> {
        let dir = match self.product_dir(product) {
            Some(dir) => dir,
            None => return Ok(Vec::new()),
        };
        let pattern = Regex::new(&format!(
            r"(?i)(?:^|_){}(?:_\d{{2}}m)?\.{}$",
            band.as_str(),
            regex::escape(&self.extension)
        ))
        .map_err(|e| S2Error::Processing(format!("Regex error: {}", e)))?;

        let mut candidates: Vec<PathBuf> = collect_files(&dir)
            .into_iter()
            .filter(|path| {
                path.file_name()
                    .and_then(|n| n.to_str())
                    .map(|name| pattern.is_match(name))
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        Ok(candidates)
    }

    /// First non-mask candidate with the expected extension
    pub fn select_band_file(&self, candidates: &[PathBuf]) -> Option<PathBuf> {
        candidates
            .iter()
            .find(|path| {
                let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                let ext_ok = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .map(|e| e.eq_ignore_ascii_case(&self.extension))
                    .unwrap_or(false);
                ext_ok && !name.contains("MSK_")
            })
            .cloned()
    }

    /// Product-level `MTD_MSI*.xml` of a product, if present
    pub fn read_metadata(&self, product: &str) -> S2Result<Option<ProductMetadata>> {
        let dir = match self.product_dir(product) {
            Some(dir) => dir,
            None => return Ok(None),
        };
        for name in ["MTD_MSIL1C.xml", "MTD_MSIL2A.xml"] {
            let path = dir.join(name);
            if path.is_file() {
                return ProductMetadata::from_file(&path).map(Some);
            }
        }
        log::debug!("No product metadata found in {}", dir.display());
        Ok(None)
    }

    /// Resolve all 13 bands of a product; missing bands are left out.
    /// When `crs` is `None` the UTM zone of the product's tile is used.
    pub fn resolve_scene(&self, product: &str, crs: Option<&str>) -> S2Result<Scene> {
        log::info!("Resolving band files for product: {}", product);

        let mut band_files = BTreeMap::new();
        for band in BandCode::CLASSIFIER_ORDER {
            let candidates = self.band_candidates(product, band)?;
            match self.select_band_file(&candidates) {
                Some(path) => {
                    log::debug!("{} -> {}", band, path.display());
                    band_files.insert(band, path);
                }
                None => log::debug!("No file found for band {}", band),
            }
        }

        if band_files.is_empty() {
            return Err(S2Error::InvalidInput(format!(
                "No band files found for product {} under {}",
                product,
                self.root.display()
            )));
        }

        let crs = match crs {
            Some(crs) => crs.to_string(),
            None => ProductName::parse(product)?.utm_crs()?,
        };

        log::info!("Found {}/13 bands for {}", band_files.len(), product);
        Ok(Scene {
            id: product.trim_end_matches(".SAFE").to_string(),
            band_files,
            crs,
        })
    }
}

/// First `*<band>*masked*.tif` file directly inside a scene output directory
pub fn find_masked_band<P: AsRef<Path>>(scene_dir: P, band: BandCode) -> S2Result<Option<PathBuf>> {
    let pattern = Regex::new(&format!(r"{}.*masked.*\.tif$", band.as_str()))
        .map_err(|e| S2Error::Processing(format!("Regex error: {}", e)))?;

    let mut matches: Vec<PathBuf> = std::fs::read_dir(scene_dir.as_ref())?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| path.is_file())
        .filter(|path| {
            path.file_name()
                .and_then(|n| n.to_str())
                .map(|name| pattern.is_match(name))
                .unwrap_or(false)
        })
        .collect();
    matches.sort();
    Ok(matches.into_iter().next())
}

/// Group masked band files of several scene directories by band
pub fn collect_mosaic_inputs<P: AsRef<Path>>(
    scene_dirs: &[P],
    bands: &[BandCode],
) -> S2Result<Vec<MosaicInput>> {
    let mut by_band: BTreeMap<BandCode, Vec<PathBuf>> = BTreeMap::new();
    for scene_dir in scene_dirs {
        if !scene_dir.as_ref().is_dir() {
            log::warn!("Scene directory not found: {}", scene_dir.as_ref().display());
            continue;
        }
        for &band in bands {
            if let Some(path) = find_masked_band(scene_dir, band)? {
                by_band.entry(band).or_default().push(path);
            }
        }
    }
    Ok(by_band
        .into_iter()
        .map(|(band, paths)| MosaicInput { band, paths })
        .collect())
}

/// Regular files below `dir`. Symlinks are not followed; unreadable entries are logged and skipped.
fn collect_files(dir: &Path) -> Vec<PathBuf> {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| match entry {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("Skipping unreadable entry below {}: {}", dir.display(), e);
                None
            }
        })
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PRODUCT: &str = "S2A_MSIL1C_20230101T032131_N0509_R118_T48QWJ_20230101T050843";

    fn touch(path: &Path) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn test_resolve_scene_skips_mask_files() {
        let root = TempDir::new().unwrap();
        let img = root
            .path()
            .join(format!("{}.SAFE", PRODUCT))
            .join("GRANULE/L1C_T48QWJ_A039329_20230101T032817/IMG_DATA");
        touch(&img.join("T48QWJ_20230101T032131_B04.jp2"));
        touch(&img.join("T48QWJ_20230101T032131_B8A.jp2"));
        touch(&img.join("T48QWJ_20230101T032131_TCI.jp2"));
        let qi = root
            .path()
            .join(format!("{}.SAFE", PRODUCT))
            .join("GRANULE/L1C_T48QWJ_A039329_20230101T032817/QI_DATA");
        touch(&qi.join("MSK_DETFOO_B04.jp2"));

        let locator = SceneLocator::new(root.path());
        let scene = locator.resolve_scene(PRODUCT, None).unwrap();

        assert_eq!(scene.crs, "EPSG:32648");
        assert_eq!(scene.band_files.len(), 2);
        let b04 = scene.band_files.get(&BandCode::B04).unwrap();
        assert!(b04.ends_with("T48QWJ_20230101T032131_B04.jp2"));
        assert!(scene.band_files.contains_key(&BandCode::B8A));
        assert!(!scene.band_files.contains_key(&BandCode::B08));
    }

    #[cfg(unix)]
    #[test]
    fn test_band_candidates_ignore_symlink_loops() {
        let root = TempDir::new().unwrap();
        let product_dir = root.path().join(format!("{}.SAFE", PRODUCT));
        let img = product_dir.join("GRANULE/L1C_T48QWJ_A039329_20230101T032817/IMG_DATA");
        touch(&img.join("T48QWJ_20230101T032131_B04.jp2"));
        std::os::unix::fs::symlink(&product_dir, product_dir.join("GRANULE/up")).unwrap();

        let locator = SceneLocator::new(root.path());
        let candidates = locator.band_candidates(PRODUCT, BandCode::B04).unwrap();
        assert_eq!(candidates.len(), 1);
        assert!(candidates[0].ends_with("T48QWJ_20230101T032131_B04.jp2"));
    }

    #[test]
    fn test_read_metadata() {
        let root = TempDir::new().unwrap();
        let locator = SceneLocator::new(root.path());
        assert!(locator.read_metadata(PRODUCT).unwrap().is_none());

        let product_dir = root.path().join(format!("{}.SAFE", PRODUCT));
        std::fs::create_dir_all(&product_dir).unwrap();
        std::fs::write(
            product_dir.join("MTD_MSIL1C.xml"),
            "<root><QUANTIFICATION_VALUE>10000</QUANTIFICATION_VALUE></root>",
        )
        .unwrap();
        let meta = locator.read_metadata(PRODUCT).unwrap().unwrap();
        assert_eq!(meta.quantification_value, Some(10000.0));
    }

    #[test]
    fn test_missing_product_is_invalid_input() {
        let root = TempDir::new().unwrap();
        let locator = SceneLocator::new(root.path());
        assert!(matches!(
            locator.resolve_scene(PRODUCT, Some("EPSG:32648")),
            Err(S2Error::InvalidInput(_))
        ));
    }

    #[test]
    fn test_collect_mosaic_inputs() {
        let root = TempDir::new().unwrap();
        for scene in ["a", "b"] {
            touch(&root.path().join(scene).join("B04_masked.tif"));
        }
        touch(&root.path().join("a").join("B02_masked.tif"));
        touch(&root.path().join("a").join("binary_mask.tif"));

        let dirs = vec![root.path().join("a"), root.path().join("b"), root.path().join("missing")];
        let inputs = collect_mosaic_inputs(&dirs, &[BandCode::B02, BandCode::B04]).unwrap();

        assert_eq!(inputs.len(), 2);
        assert_eq!(inputs[0].band, BandCode::B02);
        assert_eq!(inputs[0].paths.len(), 1);
        assert_eq!(inputs[1].band, BandCode::B04);
        assert_eq!(inputs[1].paths.len(), 2);
    }
}
