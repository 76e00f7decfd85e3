use crate::cog;
use crate::error::{PnnError, Result};
use crate::io;
use gdal::cpl::CslStringList;
use gdal::Dataset;
use log::{debug, info};
use std::ffi::{c_int, CString};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResampleMethod {
    Near,
    Bilinear,
    Cubic,
    Average,
    Mode,
}

impl ResampleMethod {
    fn as_gdal_str(&self) -> &'static str {
        match self {
            ResampleMethod::Near => "near",
            ResampleMethod::Bilinear => "bilinear",
            ResampleMethod::Cubic => "cubic",
            ResampleMethod::Average => "average",
            ResampleMethod::Mode => "mode",
        }
    }
}

/// How the common extent of an aligned stack is chosen.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BoundingBoxMode {
    Intersection,
    Union,
    /// [xmin, ymin, xmax, ymax]
    Explicit([f64; 4]),
}

/// Combine `[xmin, ymin, xmax, ymax]` boxes according to `mode`.
pub fn merge_bounding_boxes(boxes: &[[f64; 4]], mode: BoundingBoxMode) -> Result<[f64; 4]> {
    let merged = match mode {
        BoundingBoxMode::Explicit(bb) => bb,
        BoundingBoxMode::Intersection => boxes.iter().fold(
            [f64::NEG_INFINITY, f64::NEG_INFINITY, f64::INFINITY, f64::INFINITY],
            |acc, bb| [acc[0].max(bb[0]), acc[1].max(bb[1]), acc[2].min(bb[2]), acc[3].min(bb[3])],
        ),
        BoundingBoxMode::Union => boxes.iter().fold(
            [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY],
            |acc, bb| [acc[0].min(bb[0]), acc[1].min(bb[1]), acc[2].max(bb[2]), acc[3].max(bb[3])],
        ),
    };

    if !(merged[0] < merged[2] && merged[1] < merged[3]) {
        return Err(PnnError::EmptyIntersection(merged));
    }
    Ok(merged)
}

/// gdalwarp-style arguments placing a raster on the target grid. An
/// existing target is replaced.
pub fn warp_arguments(
    resample: ResampleMethod,
    pixel_size: (f64, f64),
    bounding_box: [f64; 4],
) -> Vec<String> {
    let mut args = vec![
        "-overwrite".to_string(),
        "-of".to_string(),
        "GTiff".to_string(),
        "-r".to_string(),
        resample.as_gdal_str().to_string(),
        "-te".to_string(),
    ];
    args.extend(bounding_box.iter().map(|v| format!("{}", v)));
    args.push("-tr".to_string());
    args.push(format!("{}", pixel_size.0.abs()));
    args.push(format!("{}", pixel_size.1.abs()));
    for option in cog::creation_options() {
        args.push("-co".to_string());
        args.push(option);
    }
    args
}

struct WarpAppOptions {
    options: *mut gdal_sys::GDALWarpAppOptions,
}

impl WarpAppOptions {
    fn new(args: &[String]) -> Result<Self> {
        let mut c_args = CslStringList::new();
        for arg in args {
            c_args.add_string(arg)?;
        }
        let options =
            unsafe { gdal_sys::GDALWarpAppOptionsNew(c_args.as_ptr(), std::ptr::null_mut()) };
        if options.is_null() {
            return Err(PnnError::WarpFailed(PathBuf::from(args.join(" "))));
        }
        Ok(Self { options })
    }
}

impl Drop for WarpAppOptions {
    fn drop(&mut self) {
        unsafe {
            gdal_sys::GDALWarpAppOptionsFree(self.options);
        }
    }
}

/// Warp `base_path` onto the grid described by `args`, writing `target_path`.
pub fn warp_raster(base_path: &Path, target_path: &Path, args: &[String]) -> Result<()> {
    debug!("Warping {} -> {} {:?}", base_path.display(), target_path.display(), args);
    let src = Dataset::open(base_path)?;
    let options = WarpAppOptions::new(args)?;
    let dest = CString::new(target_path.to_string_lossy().as_ref())?;

    let mut usage_error: c_int = 0;
    let handle = unsafe {
        let mut src_handle = src.c_dataset();
        gdal_sys::GDALWarp(
            dest.as_ptr(),
            std::ptr::null_mut(),
            1,
            &mut src_handle,
            options.options,
            &mut usage_error,
        )
    };

    if handle.is_null() || usage_error != 0 {
        return Err(PnnError::WarpFailed(target_path.to_path_buf()));
    }
    // closes and flushes the output
    drop(unsafe { Dataset::from_c_dataset(handle) });
    Ok(())
}

/// Resample every raster in `base_paths` onto a shared grid of
/// `pixel_size` over the extent chosen by `mode`.
pub fn align_and_resize_raster_stack(
    base_paths: &[PathBuf],
    target_paths: &[PathBuf],
    resample: &[ResampleMethod],
    pixel_size: (f64, f64),
    mode: BoundingBoxMode,
) -> Result<()> {
    if base_paths.len() != target_paths.len() || base_paths.len() != resample.len() {
        return Err(PnnError::ListLengthMismatch(format!(
            "{} base, {} target, {} resample",
            base_paths.len(),
            target_paths.len(),
            resample.len()
        )));
    }

    let boxes = base_paths
        .iter()
        .map(|path| io::get_raster_info(path).map(|info| info.bounding_box))
        .collect::<Result<Vec<_>>>()?;
    let bounding_box = merge_bounding_boxes(&boxes, mode)?;
    info!(
        "Aligning {} rasters to {:?} at pixel size {:?}",
        base_paths.len(),
        bounding_box,
        pixel_size
    );

    for ((base, target), &method) in base_paths.iter().zip(target_paths).zip(resample) {
        let args = warp_arguments(method, pixel_size, bounding_box);
        warp_raster(base, target, &args)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunking::Window;
    use crate::io::RasterInfo;
    use gdal::spatial_ref::SpatialRef;
    use ndarray::Array2;

    #[test]
    fn test_intersection() {
        let boxes = [[-10.0, -5.0, 10.0, 5.0], [0.0, -20.0, 30.0, 2.0]];
        let bb = merge_bounding_boxes(&boxes, BoundingBoxMode::Intersection).unwrap();
        assert_eq!(bb, [0.0, -5.0, 10.0, 2.0]);
    }

    #[test]
    fn test_union() {
        let boxes = [[-10.0, -5.0, 10.0, 5.0], [0.0, -20.0, 30.0, 2.0]];
        let bb = merge_bounding_boxes(&boxes, BoundingBoxMode::Union).unwrap();
        assert_eq!(bb, [-10.0, -20.0, 30.0, 5.0]);
    }

    #[test]
    fn test_disjoint_intersection_is_error() {
        let boxes = [[0.0, 0.0, 1.0, 1.0], [2.0, 2.0, 3.0, 3.0]];
        assert!(matches!(
            merge_bounding_boxes(&boxes, BoundingBoxMode::Intersection),
            Err(PnnError::EmptyIntersection(_))
        ));
    }

    #[test]
    fn test_warp_arguments() {
        let args = warp_arguments(ResampleMethod::Near, (0.5, -0.25), [0.0, 1.0, 2.0, 3.0]);
        let joined = args.join(" ");
        assert!(joined.starts_with("-overwrite -of GTiff -r near -te 0 1 2 3 -tr 0.5 0.25"));
        assert!(joined.contains("-co TILED=YES"));
    }

    #[test]
    fn test_resample_method_names() {
        let names: Vec<&str> = [
            ResampleMethod::Near,
            ResampleMethod::Bilinear,
            ResampleMethod::Cubic,
            ResampleMethod::Average,
            ResampleMethod::Mode,
        ]
        .iter()
        .map(|m| m.as_gdal_str())
        .collect();
        assert_eq!(names, vec!["near", "bilinear", "cubic", "average", "mode"]);

        let args = warp_arguments(ResampleMethod::Average, (1.0, -1.0), [0.0, 0.0, 1.0, 1.0]);
        assert!(args.join(" ").contains("-r average"));
    }

    fn write_constant(path: &Path, origin: (f64, f64), size: (usize, usize), value: f32) {
        let gt = [origin.0, 1.0, 0.0, origin.1, 0.0, -1.0];
        let info = RasterInfo {
            width: size.0,
            height: size.1,
            geotransform: gt,
            projection: SpatialRef::from_epsg(4326).unwrap().to_wkt().unwrap(),
            nodata: Some(-1.0),
            pixel_size: (1.0, -1.0),
            bounding_box: io::bounding_box(&gt, size.0, size.1),
        };
        let mut ds = io::create_raster::<f32, _>(path, &info, info.nodata, &[]).unwrap();
        let window = Window { x: 0, y: 0, width: size.0, height: size.1 };
        io::write_window(&mut ds, &window, &Array2::from_elem((size.1, size.0), value)).unwrap();
    }

    #[test]
    fn test_align_stack_to_intersection() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        write_constant(&a, (0.0, 10.0), (10, 10), 1.0);
        write_constant(&b, (4.0, 8.0), (10, 10), 2.0);

        let targets = vec![dir.path().join("a_aligned.tif"), dir.path().join("b_aligned.tif")];
        align_and_resize_raster_stack(
            &[a, b],
            &targets,
            &[ResampleMethod::Near, ResampleMethod::Near],
            (1.0, -1.0),
            BoundingBoxMode::Intersection,
        )
        .unwrap();

        for (target, value) in targets.iter().zip([1.0f32, 2.0]) {
            let (data, info) = io::read_raster::<f32, _>(target).unwrap();
            assert_eq!(info.bounding_box, [4.0, 0.0, 10.0, 8.0]);
            assert_eq!(data.dim(), (8, 6));
            assert!(data.iter().all(|&v| v == value));
        }
    }

    #[test]
    fn test_realign_replaces_existing_targets() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.tif");
        let b = dir.path().join("b.tif");
        write_constant(&a, (0.0, 10.0), (10, 10), 1.0);
        write_constant(&b, (4.0, 8.0), (10, 10), 2.0);
        let bases = vec![a.clone(), b];
        let targets = vec![dir.path().join("a_aligned.tif"), dir.path().join("b_aligned.tif")];
        let align = || {
            align_and_resize_raster_stack(
                &bases,
                &targets,
                &[ResampleMethod::Near, ResampleMethod::Bilinear],
                (1.0, -1.0),
                BoundingBoxMode::Intersection,
            )
        };

        align().unwrap();
        write_constant(&a, (0.0, 10.0), (10, 10), 7.0);
        align().unwrap();

        let (data, info) = io::read_raster::<f32, _>(&targets[0]).unwrap();
        assert_eq!(info.bounding_box, [4.0, 0.0, 10.0, 8.0]);
        assert!(data.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_length_mismatch() {
        let err = align_and_resize_raster_stack(
            &[PathBuf::from("a.tif")],
            &[],
            &[ResampleMethod::Near],
            (1.0, -1.0),
            BoundingBoxMode::Intersection,
        );
        assert!(matches!(err, Err(PnnError::ListLengthMismatch(_))));
    }
}
