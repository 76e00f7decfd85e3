use crate::chunking::ChunkGrid;
use crate::cog;
use crate::error::{PnnError, Result};
use crate::io::{self, RasterInfo};
use gdal::Dataset;
use log::{debug, info};
use ndarray::{Array2, Zip};
use std::path::Path;

const RTOL: f64 = 1e-5;
const ATOL: f64 = 1e-8;

/// `numpy.isclose` with default tolerances.
pub fn is_close(a: f64, b: f64) -> bool {
    if a == b {
        return true;
    }
    if !a.is_finite() || !b.is_finite() {
        return false;
    }
    (a - b).abs() <= ATOL + RTOL * b.abs()
}

/// Keep `signal` where `mask` holds data, `target_nodata` everywhere else.
/// A mask without a nodata value keeps every cell.
pub fn mask_op(
    signal: &Array2<f64>,
    mask: &Array2<f64>,
    mask_nodata: Option<f64>,
    target_nodata: f64,
) -> Result<Array2<f64>> {
    if signal.dim() != mask.dim() {
        return Err(PnnError::ShapeMismatch(signal.dim(), mask.dim()));
    }

    let mut result = Array2::from_elem(signal.dim(), target_nodata);
    Zip::from(&mut result)
        .and(signal)
        .and(mask)
        .for_each(|out, &s, &m| {
            let habitat = match mask_nodata {
                Some(nodata) => !is_close(m, nodata),
                None => true,
            };
            if habitat {
                *out = s;
            }
        });
    Ok(result)
}

/// Apply [`mask_op`] block by block over two aligned rasters, write a
/// float32 result with `target_nodata`, then build its overviews.
pub fn build_overviews_raster_calculator<P, Q, R>(
    signal_path: P,
    mask_path: Q,
    target_path: R,
    target_nodata: f64,
    chunk_size: usize,
) -> Result<()>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let target_path = target_path.as_ref();
    let signal_ds = Dataset::open(signal_path.as_ref())?;
    let mask_ds = Dataset::open(mask_path.as_ref())?;
    let signal_info = RasterInfo::from_dataset(&signal_ds)?;
    let mask_info = RasterInfo::from_dataset(&mask_ds)?;
    if signal_info.shape() != mask_info.shape() {
        return Err(PnnError::ShapeMismatch(signal_info.shape(), mask_info.shape()));
    }

    info!(
        "Masking {} by {} -> {}",
        signal_path.as_ref().display(),
        mask_path.as_ref().display(),
        target_path.display()
    );

    let mut target_ds = io::create_raster::<f32, _>(
        target_path,
        &signal_info,
        Some(target_nodata),
        &cog::creation_options(),
    )?;

    let grid = ChunkGrid::new(signal_info.width, signal_info.height, chunk_size, 0)?;
    for bounds in grid.iter() {
        let signal = io::read_window::<f64>(&signal_ds, &bounds.output)?;
        let mask = io::read_window::<f64>(&mask_ds, &bounds.output)?;
        let masked = mask_op(&signal, &mask, mask_info.nodata, target_nodata)?;
        io::write_window(&mut target_ds, &bounds.output, &masked.mapv(|v| v as f32))?;
    }
    debug!("Masked {} chunks", grid.len());

    // flush before reopening for overviews
    drop(target_ds);
    cog::build_overviews(target_path)
}
