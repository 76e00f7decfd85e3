// Library exports for testing and reuse

pub mod align;
pub mod chunking;
pub mod cli;
pub mod cog;
pub mod crs;
pub mod download;
pub mod error;
pub mod io;
pub mod kernel;
pub mod mask;
pub mod pipeline;
pub mod spread;
pub mod taskgraph;

// Re-export commonly used types
pub use error::{PnnError, Result};
pub use kernel::create_averaging_kernel_raster;
pub use mask::build_overviews_raster_calculator;
pub use pipeline::{PipelineConfig, PipelineInputs};
pub use spread::{convolve_2d, ConvolveOptions};
