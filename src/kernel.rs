use crate::error::{PnnError, Result};
use crate::io::{self, RasterInfo};
use crate::chunking::Window;
use gdal::spatial_ref::SpatialRef;
use log::debug;
use ndarray::Array2;
use std::path::Path;

/// Placeholder georeferencing; downstream tools only need it to be valid.
const KERNEL_GEOTRANSFORM: [f64; 6] = [1.0, 0.1, 0.0, 1.0, 0.0, -0.1];
const KERNEL_NODATA: f64 = -9999.0;

/// Largest kernel radius written to disk.
pub const MAX_RADIUS_PIXELS: usize = 1 << 14;

/// Flat circular kernel of `2*rx` columns by `2*ry` rows. A cell is 1 when
/// its distance from the kernel centre is at most `rx`.
pub fn averaging_kernel(radius_in_pixels: (usize, usize), normalize: bool) -> Array2<f32> {
    let n_cols = 2 * radius_in_pixels.0;
    let n_rows = 2 * radius_in_pixels.1;
    let cx = n_cols as f64 / 2.0;
    let cy = n_rows as f64 / 2.0;
    let radius = radius_in_pixels.0 as f64;

    let mut kernel = Array2::from_shape_fn((n_rows, n_cols), |(i, j)| {
        let distance = ((cx - j as f64).powi(2) + (cy - i as f64).powi(2)).sqrt();
        if distance <= radius {
            1.0f32
        } else {
            0.0
        }
    });

    if normalize {
        let total: f32 = kernel.sum();
        if total > 0.0 {
            kernel /= total;
        }
    }
    kernel
}

/// Write [`averaging_kernel`] as a single-band float32 GeoTIFF, replacing
/// any existing file.
pub fn create_averaging_kernel_raster<P: AsRef<Path>>(
    radius_in_pixels: (usize, usize),
    kernel_path: P,
    normalize: bool,
) -> Result<()> {
    if radius_in_pixels.0 > MAX_RADIUS_PIXELS || radius_in_pixels.1 > MAX_RADIUS_PIXELS {
        return Err(PnnError::InvalidDimensions(
            radius_in_pixels.0.saturating_mul(2),
            radius_in_pixels.1.saturating_mul(2),
        ));
    }
    let kernel = averaging_kernel(radius_in_pixels, normalize);
    let (n_rows, n_cols) = kernel.dim();
    debug!(
        "Kernel radius {:?} -> {}x{} ({} cells set)",
        radius_in_pixels,
        n_cols,
        n_rows,
        kernel.iter().filter(|&&v| v > 0.0).count()
    );

    let template = RasterInfo {
        width: n_cols,
        height: n_rows,
        geotransform: KERNEL_GEOTRANSFORM,
        projection: SpatialRef::from_epsg(4326)?.to_wkt()?,
        nodata: Some(KERNEL_NODATA),
        pixel_size: (KERNEL_GEOTRANSFORM[1], KERNEL_GEOTRANSFORM[5]),
        bounding_box: io::bounding_box(&KERNEL_GEOTRANSFORM, n_cols, n_rows),
    };

    let mut dataset = io::create_raster::<f32, _>(kernel_path, &template, template.nodata, &[])?;
    let window = Window {
        x: 0,
        y: 0,
        width: n_cols,
        height: n_rows,
    };
    io::write_window(&mut dataset, &window, &kernel)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_shape() {
        let kernel = averaging_kernel((3, 3), false);
        assert_eq!(kernel.dim(), (6, 6));
    }

    #[test]
    fn test_kernel_cells_match_distance_rule() {
        let r = 4;
        let kernel = averaging_kernel((r, r), false);
        let c = r as f64;
        for ((i, j), &value) in kernel.indexed_iter() {
            let d = ((c - j as f64).powi(2) + (c - i as f64).powi(2)).sqrt();
            let expected = if d <= r as f64 { 1.0 } else { 0.0 };
            assert_eq!(value, expected, "cell ({}, {})", i, j);
        }
        // corners are always outside the circle
        assert_eq!(kernel[[0, 0]], 0.0);
        assert_eq!(kernel[[r, r]], 1.0);
    }

    #[test]
    fn test_unit_radius_kernel() {
        // centre (1, 1) sits on a cell corner: four cells within distance 1
        let kernel = averaging_kernel((1, 1), false);
        assert_eq!(kernel.dim(), (2, 2));
        assert_eq!(kernel[[0, 1]], 1.0);
        assert_eq!(kernel[[1, 0]], 1.0);
        assert_eq!(kernel[[1, 1]], 1.0);
        assert_eq!(kernel[[0, 0]], 0.0);
    }

    #[test]
    fn test_normalized_kernel_sums_to_one() {
        let kernel = averaging_kernel((10, 10), true);
        assert!((kernel.sum() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_zero_radius_is_empty() {
        let kernel = averaging_kernel((0, 0), true);
        assert_eq!(kernel.len(), 0);
    }

    #[test]
    fn test_oversized_radius_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge_kernel.tif");
        let err = create_averaging_kernel_raster((usize::MAX, 1), &path, false);
        assert!(matches!(err, Err(PnnError::InvalidDimensions(usize::MAX, 2))));
        assert!(!path.exists());
    }

    #[test]
    fn test_kernel_raster_written() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("10_kernel.tif");
        create_averaging_kernel_raster((2, 2), &path, false).unwrap();

        let (data, info) = io::read_raster::<f32, _>(&path).unwrap();
        assert_eq!(data, averaging_kernel((2, 2), false));
        assert_eq!(info.nodata, Some(KERNEL_NODATA));
        assert_eq!(info.geotransform, KERNEL_GEOTRANSFORM);
    }
}
