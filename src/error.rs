use std::path::PathBuf;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PnnError {
    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Array shape error: {0}")]
    ShapeError(#[from] ndarray::ShapeError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Task ledger error: {0}")]
    Ledger(#[from] serde_json::Error),

    #[error("Path contains an interior nul byte: {0}")]
    Nul(#[from] std::ffi::NulError),

    #[error("Raster has invalid dimensions: {0}x{1}")]
    InvalidDimensions(usize, usize),

    #[error("Pixel size is zero, non-finite or too small for the kernel radius")]
    InvalidPixelSize,

    #[error("Shape mismatch: {0:?} vs {1:?}")]
    ShapeMismatch((usize, usize), (usize, usize)),

    #[error("Invalid chunk size: {0} (must be positive)")]
    InvalidChunkSize(usize),

    #[error("Raster bounding boxes do not intersect: {0:?}")]
    EmptyIntersection([f64; 4]),

    #[error("Raster list lengths differ: {0}")]
    ListLengthMismatch(String),

    #[error("Warp of {0} failed")]
    WarpFailed(PathBuf),

    #[error("Overview build failed: {0}")]
    OverviewFailed(String),

    #[error("\"{key}\" is already a registered ecoshard as {url}")]
    DuplicateKey { key: String, url: String },

    #[error("{0} not a valid key")]
    UnknownKey(String),

    #[error("Request to gunzip but {0} does not end in .gz extension")]
    NotGzip(String),

    #[error("Cannot derive a file name from url {0}")]
    InvalidUrl(String),

    #[error("Zip entry escapes target directory: {0}")]
    ZipTraversal(String),

    #[error("{0} does not exist on disk")]
    MissingPath(PathBuf),

    #[error("Task '{task}' did not produce declared target {}", path.display())]
    MissingTarget { task: String, path: PathBuf },

    #[error("Unknown task id {0}")]
    UnknownTask(usize),

    #[error("Task '{0}' cannot run: a task it depends on failed")]
    UpstreamFailed(String),

    #[error("Task '{0}' failed: {1}")]
    TaskFailed(String, Box<PnnError>),

    #[error("Failed to build worker pool: {0}")]
    WorkerPool(String),
}

pub type Result<T> = std::result::Result<T, PnnError>;
