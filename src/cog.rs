use crate::error::{PnnError, Result};
use gdal::{Dataset, DatasetOptions, GdalOpenFlags};
use log::{debug, info};
use std::path::Path;

/// Smallest overview edge worth building.
const MIN_OVERVIEW_SIZE: usize = 256;

/// GeoTIFF creation options for every raster written by the pipeline.
pub fn creation_options() -> Vec<String> {
    vec![
        "TILED=YES".to_string(),
        "BIGTIFF=YES".to_string(),
        "COMPRESS=LZW".to_string(),
        "BLOCKXSIZE=256".to_string(),
        "BLOCKYSIZE=256".to_string(),
    ]
}

/// Power-of-two decimation factors down to [`MIN_OVERVIEW_SIZE`].
pub fn overview_levels(width: usize, height: usize) -> Vec<i32> {
    let min_dim = width.min(height);
    let mut levels = Vec::new();
    let mut level = 2;
    while min_dim / level >= MIN_OVERVIEW_SIZE {
        levels.push(level as i32);
        level *= 2;
    }
    levels
}

/// Build internal nearest-neighbour overviews for the raster at `path`.
pub fn build_overviews<P: AsRef<Path>>(path: P) -> Result<()> {
    let path = path.as_ref();
    let mut dataset = Dataset::open_ex(
        path,
        DatasetOptions {
            open_flags: GdalOpenFlags::GDAL_OF_UPDATE | GdalOpenFlags::GDAL_OF_RASTER,
            ..Default::default()
        },
    )?;

    let (width, height) = dataset.raster_size();
    let levels = overview_levels(width, height);
    if levels.is_empty() {
        debug!("Raster too small for overviews ({}x{}), skipping", width, height);
        return Ok(());
    }

    info!("Building overviews {:?} for {}", levels, path.display());
    dataset
        .build_overviews("NEAREST", &levels, &[])
        .map_err(|e| PnnError::OverviewFailed(format!("{}: {}", path.display(), e)))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_levels_for_small_raster() {
        assert!(overview_levels(300, 4000).is_empty());
    }

    #[test]
    fn test_levels_stop_at_min_size() {
        assert_eq!(overview_levels(4096, 2048), vec![2, 4, 8]);
        assert_eq!(overview_levels(43200, 21600), vec![2, 4, 8, 16, 32, 64]);
    }

    #[test]
    fn test_creation_options_are_tiled() {
        let opts = creation_options();
        assert!(opts.contains(&"TILED=YES".to_string()));
        assert!(opts.contains(&"BLOCKXSIZE=256".to_string()));
        assert!(opts.contains(&"BLOCKYSIZE=256".to_string()));
    }
}
