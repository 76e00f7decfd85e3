//! Two-dimensional convolution of a signal raster by a kernel raster.
//!
//! Each kernel row is split into runs of equal weight; a run is then summed
//! in constant time from per-row prefix sums of the signal. A flat circular
//! kernel has one run per row, so the cost per pixel is the kernel height
//! rather than its area. Arbitrary kernels are still handled exactly.

use crate::chunking::ChunkGrid;
use crate::cog;
use crate::error::Result;
use crate::io::{self, RasterInfo};
use crate::mask::is_close;
use gdal::Dataset;
use log::{debug, info};
use ndarray::Array2;
use rayon::prelude::*;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct ConvolveOptions {
    /// Divide each result by the kernel weight that fell on valid signal.
    pub ignore_nodata: bool,
    /// Write `target_nodata` wherever the signal itself is nodata.
    pub mask_nodata: bool,
    pub normalize_kernel: bool,
    pub target_nodata: f64,
    pub chunk_size: usize,
}

impl Default for ConvolveOptions {
    fn default() -> Self {
        Self {
            ignore_nodata: false,
            mask_nodata: true,
            normalize_kernel: false,
            target_nodata: f64::from(f32::MIN),
            chunk_size: 2048,
        }
    }
}

/// A horizontal run of equal, non-zero kernel weights, expressed as the
/// offsets from an output pixel to the signal samples it covers.
#[derive(Debug, Clone, Copy, PartialEq)]
struct KernelRun {
    dy: isize,
    dx_start: isize,
    len: usize,
    weight: f64,
}

/// Decompose `kernel` so that
/// `out[y, x] = sum k[a, b] * s[y + kr - a, x + kc - b]`
/// with `kr = rows / 2`, `kc = cols / 2`.
fn kernel_runs(kernel: &Array2<f64>) -> Vec<KernelRun> {
    let (n_rows, n_cols) = kernel.dim();
    let kr = (n_rows / 2) as isize;
    let kc = (n_cols / 2) as isize;
    let mut runs = Vec::new();

    for (a, row) in kernel.outer_iter().enumerate() {
        let mut b = 0;
        while b < n_cols {
            let weight = row[b];
            let start = b;
            while b + 1 < n_cols && row[b + 1] == weight {
                b += 1;
            }
            if weight != 0.0 {
                runs.push(KernelRun {
                    dy: kr - a as isize,
                    dx_start: kc - b as isize,
                    len: b - start + 1,
                    weight,
                });
            }
            b += 1;
        }
    }
    runs
}

/// Row-wise inclusive prefix sums with a leading zero column.
fn row_prefix_sums(values: &Array2<f64>) -> Array2<f64> {
    let (rows, cols) = values.dim();
    let mut sums = Array2::zeros((rows, cols + 1));
    for (mut out, row) in sums.outer_iter_mut().zip(values.outer_iter()) {
        let mut acc = 0.0;
        for (c, &v) in row.iter().enumerate() {
            acc += v;
            out[c + 1] = acc;
        }
    }
    sums
}

/// Convolve one padded block. `valid` marks signal cells that hold data;
/// `(top, left)` locates the output window inside the block.
fn convolve_block(
    signal: &Array2<f64>,
    valid: &Array2<bool>,
    runs: &[KernelRun],
    (top, left): (usize, usize),
    (out_rows, out_cols): (usize, usize),
    options: &ConvolveOptions,
) -> Result<Array2<f64>> {
    let (rows, cols) = signal.dim();
    let values = Array2::from_shape_fn((rows, cols), |idx| if valid[idx] { signal[idx] } else { 0.0 });
    let value_sums = row_prefix_sums(&values);
    let mass_sums = if options.ignore_nodata {
        let ones = valid.mapv(|v| if v { 1.0 } else { 0.0 });
        Some(row_prefix_sums(&ones))
    } else {
        None
    };

    let out_rows_data: Vec<Vec<f64>> = (0..out_rows)
        .into_par_iter()
        .map(|oy| {
            let py = (top + oy) as isize;
            (0..out_cols)
                .map(|ox| {
                    let px = (left + ox) as isize;
                    if options.mask_nodata && !valid[[py as usize, px as usize]] {
                        return options.target_nodata;
                    }

                    let mut total = 0.0;
                    let mut mass = 0.0;
                    for run in runs {
                        let row = py + run.dy;
                        if row < 0 || row >= rows as isize {
                            continue;
                        }
                        let c0 = (px + run.dx_start).clamp(0, cols as isize) as usize;
                        let c1 = (px + run.dx_start + run.len as isize).clamp(0, cols as isize) as usize;
                        if c0 >= c1 {
                            continue;
                        }
                        let row = row as usize;
                        total += run.weight * (value_sums[[row, c1]] - value_sums[[row, c0]]);
                        if let Some(sums) = &mass_sums {
                            mass += run.weight * (sums[[row, c1]] - sums[[row, c0]]);
                        }
                    }

                    if mass_sums.is_some() {
                        if mass > 0.0 {
                            total / mass
                        } else {
                            0.0
                        }
                    } else {
                        total
                    }
                })
                .collect()
        })
        .collect();

    let flat: Vec<f64> = out_rows_data.into_iter().flatten().collect();
    Ok(Array2::from_shape_vec((out_rows, out_cols), flat)?)
}

/// Convolve band 1 of `signal_path` with band 1 of `kernel_path` and write a
/// float64 raster aligned with the signal.
pub fn convolve_2d<P, Q, R>(
    signal_path: P,
    kernel_path: Q,
    target_path: R,
    options: &ConvolveOptions,
) -> Result<()>
where
    P: AsRef<Path>,
    Q: AsRef<Path>,
    R: AsRef<Path>,
{
    let (mut kernel, _) = io::read_raster::<f64, _>(kernel_path.as_ref())?;
    if options.normalize_kernel {
        let total = kernel.sum();
        if total != 0.0 {
            kernel /= total;
        }
    }
    let runs = kernel_runs(&kernel);
    let (k_rows, k_cols) = kernel.dim();

    let signal_ds = Dataset::open(signal_path.as_ref())?;
    let signal_info = RasterInfo::from_dataset(&signal_ds)?;
    let signal_nodata = signal_info.nodata;

    info!(
        "Convolving {} ({}x{}) with {}x{} kernel ({} runs) -> {}",
        signal_path.as_ref().display(),
        signal_info.width,
        signal_info.height,
        k_cols,
        k_rows,
        runs.len(),
        target_path.as_ref().display()
    );

    let mut target_ds = io::create_raster::<f64, _>(
        target_path.as_ref(),
        &signal_info,
        Some(options.target_nodata),
        &cog::creation_options(),
    )?;

    let padding = k_rows.max(k_cols);
    let grid = ChunkGrid::new(signal_info.width, signal_info.height, options.chunk_size, padding)?;
    for (index, bounds) in grid.iter().enumerate() {
        debug!("Convolving chunk {}/{}", index + 1, grid.len());
        let block = io::read_window::<f64>(&signal_ds, &bounds.read)?;
        let valid = block.mapv(|v| match signal_nodata {
            Some(nodata) => !is_close(v, nodata),
            None => true,
        });
        let result = convolve_block(
            &block,
            &valid,
            &runs,
            (bounds.pad_top(), bounds.pad_left()),
            (bounds.output.height, bounds.output.width),
            options,
        )?;
        io::write_window(&mut target_ds, &bounds.output, &result)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::Window;
    use crate::kernel;
    use gdal::spatial_ref::SpatialRef;
    use ndarray::arr2;

    /// Direct evaluation of the convolution sum, for comparison.
    fn brute_force(signal: &Array2<f64>, kernel: &Array2<f64>) -> Array2<f64> {
        let (rows, cols) = signal.dim();
        let (k_rows, k_cols) = kernel.dim();
        let kr = (k_rows / 2) as isize;
        let kc = (k_cols / 2) as isize;
        Array2::from_shape_fn((rows, cols), |(y, x)| {
            let mut total = 0.0;
            for ((a, b), &w) in kernel.indexed_iter() {
                let sy = y as isize + kr - a as isize;
                let sx = x as isize + kc - b as isize;
                if sy >= 0 && sy < rows as isize && sx >= 0 && sx < cols as isize {
                    total += w * signal[[sy as usize, sx as usize]];
                }
            }
            total
        })
    }

    fn whole(signal: &Array2<f64>, kernel: &Array2<f64>, options: &ConvolveOptions) -> Array2<f64> {
        let valid = signal.mapv(|_| true);
        convolve_block(signal, &valid, &kernel_runs(kernel), (0, 0), signal.dim(), options).unwrap()
    }

    #[test]
    fn test_runs_of_flat_circle() {
        let k = kernel::averaging_kernel((3, 3), false).mapv(f64::from);
        let runs = kernel_runs(&k);
        // one run per non-empty row
        let non_empty = k.outer_iter().filter(|r| r.iter().any(|&v| v != 0.0)).count();
        assert_eq!(runs.len(), non_empty);
        let covered: usize = runs.iter().map(|r| r.len).sum();
        assert_eq!(covered, k.iter().filter(|&&v| v != 0.0).count());
    }

    #[test]
    fn test_runs_split_on_weight_change() {
        let k = arr2(&[[1.0, 1.0, 2.0]]);
        let runs = kernel_runs(&k);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0], KernelRun { dy: 0, dx_start: 0, len: 2, weight: 1.0 });
        assert_eq!(runs[1], KernelRun { dy: 0, dx_start: -1, len: 1, weight: 2.0 });
    }

    #[test]
    fn test_matches_brute_force_asymmetric_kernel() {
        let signal = Array2::from_shape_fn((9, 11), |(i, j)| ((i * 31 + j * 17) % 13) as f64);
        let k = arr2(&[[0.0, 1.0, 2.0], [3.0, 0.5, 0.5], [1.0, 0.0, 4.0], [2.0, 2.0, 2.0]]);
        let expected = brute_force(&signal, &k);
        let actual = whole(&signal, &k, &ConvolveOptions::default());
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!((a - e).abs() < 1e-9, "{} vs {}", a, e);
        }
    }

    #[test]
    fn test_summing_kernel_counts_neighbours() {
        let signal = Array2::from_elem((20, 20), 1.0);
        let k = kernel::averaging_kernel((2, 2), false).mapv(f64::from);
        let out = whole(&signal, &k, &ConvolveOptions::default());
        // interior pixel sees the full kernel
        assert!((out[[10, 10]] - k.sum()).abs() < 1e-9);
        // corner sees less of it
        assert!(out[[0, 0]] < out[[10, 10]]);
    }

    #[test]
    fn test_ignore_nodata_averages_valid_cells() {
        let signal = arr2(&[[2.0, -1.0, 4.0], [2.0, 2.0, 4.0], [-1.0, 4.0, 4.0]]);
        let valid = signal.mapv(|v| v != -1.0);
        let k = Array2::from_elem((3, 3), 1.0);
        let options = ConvolveOptions {
            ignore_nodata: true,
            ..Default::default()
        };
        let out = convolve_block(&signal, &valid, &kernel_runs(&k), (0, 0), (3, 3), &options).unwrap();

        // centre: valid cells 2,4,2,2,4,4,4 -> mean 22/7
        assert!((out[[1, 1]] - 22.0 / 7.0).abs() < 1e-12);
        assert_eq!(out[[0, 1]], options.target_nodata);
        assert_eq!(out[[2, 0]], options.target_nodata);
    }

    #[test]
    fn test_padded_block_matches_whole() {
        let signal = Array2::from_shape_fn((12, 12), |(i, j)| (i * 12 + j) as f64);
        let k = kernel::averaging_kernel((2, 2), false).mapv(f64::from);
        let expected = whole(&signal, &k, &ConvolveOptions::default());

        let grid = ChunkGrid::new(12, 12, 5, 4).unwrap();
        let runs = kernel_runs(&k);
        for bounds in grid.iter() {
            let r = bounds.read;
            let block = signal.slice(ndarray::s![r.y..r.y_end(), r.x..r.x_end()]).to_owned();
            let valid = block.mapv(|_| true);
            let out = convolve_block(
                &block,
                &valid,
                &runs,
                (bounds.pad_top(), bounds.pad_left()),
                (bounds.output.height, bounds.output.width),
                &ConvolveOptions::default(),
            )
            .unwrap();
            for ((y, x), &v) in out.indexed_iter() {
                let e = expected[[bounds.output.y + y, bounds.output.x + x]];
                assert!((v - e).abs() < 1e-9);
            }
        }
    }

    #[test]
    fn test_convolve_rasters_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let signal_path = dir.path().join("pop.tif");
        let kernel_path = dir.path().join("kernel.tif");
        let target_path = dir.path().join("spread.tif");

        let signal = Array2::from_shape_fn((6, 8), |(i, j)| if i == 3 && j == 4 { 10.0f32 } else { 0.0 });
        let gt = [0.0, 1.0, 0.0, 6.0, 0.0, -1.0];
        let info = RasterInfo {
            width: 8,
            height: 6,
            geotransform: gt,
            projection: SpatialRef::from_epsg(4326).unwrap().to_wkt().unwrap(),
            nodata: Some(-1.0),
            pixel_size: (1.0, -1.0),
            bounding_box: io::bounding_box(&gt, 8, 6),
        };
        {
            let mut ds = io::create_raster::<f32, _>(&signal_path, &info, info.nodata, &[]).unwrap();
            io::write_window(&mut ds, &Window { x: 0, y: 0, width: 8, height: 6 }, &signal).unwrap();
        }
        kernel::create_averaging_kernel_raster((1, 1), &kernel_path, false).unwrap();

        let options = ConvolveOptions {
            chunk_size: 3,
            ..Default::default()
        };
        convolve_2d(&signal_path, &kernel_path, &target_path, &options).unwrap();

        let (out, out_info) = io::read_raster::<f64, _>(&target_path).unwrap();
        assert_eq!(out_info.geotransform, gt);
        assert_eq!(out_info.nodata, Some(options.target_nodata));

        let k = kernel::averaging_kernel((1, 1), false).mapv(f64::from);
        let expected = brute_force(&signal.mapv(f64::from), &k);
        assert_eq!(out, expected);
        assert!((out.sum() - 30.0).abs() < 1e-9);
    }
}
