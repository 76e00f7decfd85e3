use crate::chunking::Window;
use crate::error::{PnnError, Result};
use gdal::cpl::CslStringList;
use gdal::raster::{Buffer, GdalType};
use gdal::{Dataset, DriverManager};
use log::debug;
use ndarray::Array2;
use std::path::Path;

/// Georeferencing and band-1 properties of a raster on disk.
#[derive(Debug, Clone, PartialEq)]
pub struct RasterInfo {
    pub width: usize,
    pub height: usize,
    pub geotransform: [f64; 6],
    pub projection: String,
    pub nodata: Option<f64>,
    /// Signed (x, y) pixel size; y is negative for north-up rasters.
    pub pixel_size: (f64, f64),
    /// [xmin, ymin, xmax, ymax]
    pub bounding_box: [f64; 4],
}

impl RasterInfo {
    pub fn from_dataset(dataset: &Dataset) -> Result<Self> {
        let band = dataset.rasterband(1)?;
        let width = band.x_size();
        let height = band.y_size();
        if width == 0 || height == 0 {
            return Err(PnnError::InvalidDimensions(width, height));
        }

        let geotransform = dataset.geo_transform()?;
        if geotransform[1] == 0.0 || geotransform[5] == 0.0 {
            return Err(PnnError::InvalidPixelSize);
        }

        Ok(Self {
            width,
            height,
            geotransform,
            projection: dataset.projection(),
            nodata: band.no_data_value(),
            pixel_size: (geotransform[1], geotransform[5]),
            bounding_box: bounding_box(&geotransform, width, height),
        })
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.height, self.width)
    }
}

/// Axis-aligned extent of a raster with the given geotransform.
pub fn bounding_box(geotransform: &[f64; 6], width: usize, height: usize) -> [f64; 4] {
    let corner = |col: f64, row: f64| {
        (
            geotransform[0] + col * geotransform[1] + row * geotransform[2],
            geotransform[3] + col * geotransform[4] + row * geotransform[5],
        )
    };
    let corners = [
        corner(0.0, 0.0),
        corner(width as f64, 0.0),
        corner(0.0, height as f64),
        corner(width as f64, height as f64),
    ];

    let mut bb = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
    for (x, y) in corners {
        bb[0] = bb[0].min(x);
        bb[1] = bb[1].min(y);
        bb[2] = bb[2].max(x);
        bb[3] = bb[3].max(y);
    }
    bb
}

pub fn get_raster_info<P: AsRef<Path>>(path: P) -> Result<RasterInfo> {
    let dataset = Dataset::open(path.as_ref())?;
    RasterInfo::from_dataset(&dataset)
}

/// Read a window of band 1 into a row-major array.
pub fn read_window<T: GdalType + Copy>(dataset: &Dataset, window: &Window) -> Result<Array2<T>> {
    let band = dataset.rasterband(1)?;
    debug!(
        "Reading window: offset=({},{}), size=({},{})",
        window.x, window.y, window.width, window.height
    );

    let buffer = band.read_as::<T>(window.offset(), window.size(), window.size(), None)?;
    let data = Array2::from_shape_vec((window.height, window.width), buffer.data().to_vec())?;
    Ok(data)
}

/// Read all of band 1.
pub fn read_raster<T: GdalType + Copy, P: AsRef<Path>>(path: P) -> Result<(Array2<T>, RasterInfo)> {
    let dataset = Dataset::open(path.as_ref())?;
    let info = RasterInfo::from_dataset(&dataset)?;
    let window = Window {
        x: 0,
        y: 0,
        width: info.width,
        height: info.height,
    };
    let data = read_window(&dataset, &window)?;
    Ok((data, info))
}

/// Write `data` into band 1 at `window`.
pub fn write_window<T: GdalType + Copy>(
    dataset: &mut Dataset,
    window: &Window,
    data: &Array2<T>,
) -> Result<()> {
    let (rows, cols) = data.dim();
    if rows != window.height || cols != window.width {
        return Err(PnnError::ShapeMismatch((rows, cols), (window.height, window.width)));
    }

    let mut band = dataset.rasterband(1)?;
    let mut buffer = Buffer::new(window.size(), data.iter().copied().collect());
    band.write(window.offset(), window.size(), &mut buffer)?;
    Ok(())
}

/// Create a single-band GeoTIFF shaped and georeferenced like `template`.
pub fn create_raster<T: GdalType, P: AsRef<Path>>(
    path: P,
    template: &RasterInfo,
    nodata: Option<f64>,
    options: &[String],
) -> Result<Dataset> {
    let path = path.as_ref();
    debug!("Creating raster: {}", path.display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let mut creation_options = CslStringList::new();
    for option in options {
        creation_options.add_string(option)?;
    }

    let mut dataset = driver.create_with_band_type_with_options::<T, _>(
        path,
        template.width,
        template.height,
        1,
        &creation_options,
    )?;
    dataset.set_geo_transform(&template.geotransform)?;
    dataset.set_projection(&template.projection)?;
    if nodata.is_some() {
        dataset.rasterband(1)?.set_no_data_value(nodata)?;
    }
    Ok(dataset)
}
