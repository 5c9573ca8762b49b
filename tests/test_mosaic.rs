use ndarray::Array2;
use s2cloudmask::core::mosaic::{MosaicCompositor, MosaicConfig};
use s2cloudmask::core::progress::NoProgress;
use s2cloudmask::io::{RasterReader, RasterWriter};
use s2cloudmask::types::{BandCode, BoundingBox, ItemOutcome, MosaicInput, Raster, RasterGrid, S2Error};
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn write_masked(scene_dir: &Path, band: BandCode, bounds: BoundingBox, data: Array2<u16>) -> PathBuf {
    let grid = RasterGrid::from_bounds(bounds, 10.0, "");
    let raster = Raster::new(grid, data, Some(0.0)).expect("valid raster");
    let path = scene_dir.join(format!("{}_masked.tif", band));
    RasterWriter::default()
        .write(&path, &raster)
        .expect("Failed to write masked band");
    path
}

fn tile() -> BoundingBox {
    BoundingBox::new(300000.0, 4000000.0, 300030.0, 4000020.0)
}

#[test]
fn test_two_scene_median() {
    init_logging();
    let work = TempDir::new().unwrap();
    let scene_a = work.path().join("scene_a");
    let scene_b = work.path().join("scene_b");

    let mut a = Array2::from_elem((2, 3), 100u16);
    a[[0, 0]] = 0;
    write_masked(&scene_a, BandCode::B04, tile(), a);
    write_masked(&scene_b, BandCode::B04, tile(), Array2::from_elem((2, 3), 200u16));
    // Only one scene has B03
    write_masked(&scene_a, BandCode::B03, tile(), Array2::from_elem((2, 3), 50u16));

    let out = work.path().join("mosaic");
    let compositor = MosaicCompositor::new(MosaicConfig::default());
    let run = compositor
        .run(&[scene_a, scene_b], &out, &NoProgress)
        .expect("Mosaic run failed");

    assert_eq!(run.bands.success_count(), 1);
    assert!(matches!(
        run.bands.outcomes.get(&BandCode::B03),
        Some(ItemOutcome::Skipped { .. })
    ));
    assert!(!out.join("mosaic_B03_median.tif").exists());

    let median = RasterReader::read_band::<u16, _>(out.join("mosaic_B04_median.tif"), 1).unwrap();
    assert_eq!(median.nodata, Some(0.0));
    assert_eq!(median.data[[0, 0]], 200, "masked scene A must not contribute");
    assert_eq!(median.data[[1, 2]], 150, "even count takes the mean of the middle values");

    assert_eq!(run.composite.bands, vec![BandCode::B04]);
    let info = RasterReader::info(&run.composite.path).unwrap();
    assert_eq!(info.band_count, 1);
    assert!(run.composite.path.ends_with("mosaic_composite.tif"));
}

#[test]
fn test_composite_band_order_and_extent() {
    init_logging();
    let work = TempDir::new().unwrap();
    let scenes: Vec<PathBuf> = (0..3).map(|i| work.path().join(format!("scene_{}", i))).collect();

    // B8A tiles are shifted east by one pixel in every scene
    let shifted = BoundingBox::new(300010.0, 4000000.0, 300040.0, 4000020.0);
    for (i, scene) in scenes.iter().enumerate() {
        let value = 10 * (i as u16 + 1);
        write_masked(scene, BandCode::B8A, shifted, Array2::from_elem((2, 3), value + 8));
        write_masked(scene, BandCode::B04, tile(), Array2::from_elem((2, 3), value + 4));
        write_masked(scene, BandCode::B02, tile(), Array2::from_elem((2, 3), value + 2));
    }

    let out = work.path().join("out");
    let config = MosaicConfig {
        output_name: "summer".to_string(),
        ..MosaicConfig::default()
    };
    let run = MosaicCompositor::new(config)
        .run(&scenes, &out, &NoProgress)
        .expect("Mosaic run failed");

    assert_eq!(run.composite.bands, vec![BandCode::B02, BandCode::B04, BandCode::B8A]);
    assert_eq!(run.composite.grid.shape(), (2, 4));

    let info = RasterReader::info(&run.composite.path).unwrap();
    assert_eq!(info.band_count, 3);

    let b02 = RasterReader::read_band::<u16, _>(&run.composite.path, 1).unwrap();
    assert_eq!(b02.data[[0, 0]], 22);
    assert_eq!(b02.data[[0, 3]], 0);

    let b8a = RasterReader::read_band::<u16, _>(&run.composite.path, 3).unwrap();
    assert_eq!(b8a.data[[0, 0]], 0);
    assert_eq!(b8a.data[[1, 3]], 28);
}

#[test]
fn test_no_usable_bands() {
    init_logging();
    let work = TempDir::new().unwrap();
    let scene = work.path().join("only_scene");
    write_masked(&scene, BandCode::B04, tile(), Array2::from_elem((2, 3), 100u16));

    let result = MosaicCompositor::new(MosaicConfig::default()).run(&[scene], &work.path().join("out"), &NoProgress);
    assert!(matches!(result, Err(S2Error::NoValidScenes(_))));
}

#[test]
fn test_fully_masked_band_fails_without_output() {
    init_logging();
    let work = TempDir::new().unwrap();
    let scenes: Vec<PathBuf> = ["scene_a", "scene_b"].iter().map(|s| work.path().join(s)).collect();
    for scene in &scenes {
        write_masked(scene, BandCode::B04, tile(), Array2::zeros((2, 3)));
        write_masked(scene, BandCode::B02, tile(), Array2::from_elem((2, 3), 120u16));
    }

    let out = work.path().join("out");
    let run = MosaicCompositor::new(MosaicConfig::default())
        .run(&scenes, &out, &NoProgress)
        .expect("B02 alone should still build a composite");

    assert!(matches!(
        run.bands.outcomes.get(&BandCode::B04),
        Some(ItemOutcome::Failed { .. })
    ));
    assert!(!out.join("mosaic_B04_median.tif").exists());
    assert_eq!(run.composite.bands, vec![BandCode::B02]);
}

#[test]
fn test_unreadable_scene_is_left_out() {
    init_logging();
    let work = TempDir::new().unwrap();
    let a = write_masked(&work.path().join("scene_a"), BandCode::B04, tile(), Array2::from_elem((2, 3), 100u16));
    let b = write_masked(&work.path().join("scene_b"), BandCode::B04, tile(), Array2::from_elem((2, 3), 300u16));

    let broken_dir = work.path().join("scene_c");
    std::fs::create_dir_all(&broken_dir).unwrap();
    let broken = broken_dir.join("B04_masked.tif");
    std::fs::write(&broken, b"not a geotiff").unwrap();

    let input = MosaicInput {
        band: BandCode::B04,
        paths: vec![a, broken, b],
    };
    let out = work.path().join("out");
    std::fs::create_dir_all(&out).unwrap();
    let mosaic = MosaicCompositor::new(MosaicConfig::default())
        .mosaic_band(&input, &out)
        .expect("Two readable scenes should mosaic");

    assert_eq!(mosaic.scene_count, 2);
    assert_eq!(mosaic.grid.shape(), (2, 3));
    let median = RasterReader::read_band::<u16, _>(&mosaic.path, 1).unwrap();
    assert_eq!(median.data[[1, 1]], 200);
}
