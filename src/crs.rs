use crate::error::{PnnError, Result};
use crate::kernel::MAX_RADIUS_PIXELS;
use gdal::spatial_ref::SpatialRef;
use log::{info, warn};

/// Flat approximation used to turn kilometres into degrees.
pub const METERS_PER_DEGREE: f64 = 110_000.0;

/// Kernel radius in pixels for a radius of `km` on a raster whose pixels
/// are `pixel_size` degrees wide. Never less than one pixel, and never more
/// than [`MAX_RADIUS_PIXELS`].
pub fn radius_in_pixels(km: u32, pixel_size: f64) -> Result<usize> {
    if !(pixel_size.is_finite() && pixel_size > 0.0) {
        return Err(PnnError::InvalidPixelSize);
    }
    let degrees = f64::from(km) * 1000.0 / METERS_PER_DEGREE;
    let pixels = (degrees / pixel_size).trunc();
    if pixels > MAX_RADIUS_PIXELS as f64 {
        return Err(PnnError::InvalidPixelSize);
    }
    let pixels = if pixels >= 1.0 { pixels as usize } else { 1 };
    info!(
        "Radius: {} km = {:.6} degrees = {} pixels (pixel size: {:.6})",
        km, degrees, pixels, pixel_size
    );
    Ok(pixels)
}

/// Warn when the raster is not in a geographic CRS, since the radius
/// conversion assumes pixel sizes in degrees. Returns whether it is.
pub fn check_geographic(projection_wkt: &str) -> bool {
    let spatial_ref = match SpatialRef::from_wkt(projection_wkt) {
        Ok(sr) => sr,
        Err(e) => {
            warn!("Failed to parse projection WKT, assuming degrees: {}", e);
            return false;
        }
    };

    if spatial_ref.is_geographic() {
        return true;
    }

    warn!(
        "Population raster is not geographic (linear units={:.6}); kilometre radii will be wrong",
        spatial_ref.linear_units()
    );
    false
}
