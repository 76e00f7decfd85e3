use clap::Parser;
use std::path::PathBuf;

use crate::pipeline;

#[derive(Parser, Debug)]
#[command(name = "people-near-nature")]
#[command(about = "Spread population over a radius and mask it to natural habitat")]
#[command(version)]
pub struct Args {
    /// Workspace directory for downloads, intermediates and outputs
    #[arg(short, long, value_name = "DIR", default_value = pipeline::DEFAULT_WORKSPACE)]
    pub workspace: PathBuf,

    /// Number of task graph workers (0 runs tasks on the calling thread)
    #[arg(short = 'n', long, value_name = "N", default_value_t = pipeline::DEFAULT_WORKERS)]
    pub workers: usize,

    /// Spread radius in kilometres; repeat for several radii
    #[arg(short, long = "radius-km", value_name = "KM", default_values_t = pipeline::DEFAULT_RADII_KM)]
    pub radius_km: Vec<u32>,

    /// Block edge length used when streaming rasters
    #[arg(long, value_name = "PIXELS", default_value_t = pipeline::DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,

    /// Natural habitat mask raster; skips downloads when given with the population rasters
    #[arg(long, value_name = "FILE", requires_all = ["total_pop", "poor_pop"])]
    pub hab_mask: Option<PathBuf>,

    /// Total population raster
    #[arg(long, value_name = "FILE", requires_all = ["hab_mask", "poor_pop"])]
    pub total_pop: Option<PathBuf>,

    /// Poor population raster
    #[arg(long, value_name = "FILE", requires_all = ["hab_mask", "total_pop"])]
    pub poor_pop: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn pipeline_config(&self) -> pipeline::PipelineConfig {
        pipeline::PipelineConfig {
            workspace: self.workspace.clone(),
            n_workers: self.workers,
            radii_km: self.radius_km.clone(),
            chunk_size: self.chunk_size,
        }
    }

    /// The three local rasters, when all were supplied.
    pub fn local_inputs(&self) -> Option<(PathBuf, PathBuf, PathBuf)> {
        match (&self.hab_mask, &self.total_pop, &self.poor_pop) {
            (Some(hab), Some(total), Some(poor)) => Some((hab.clone(), total.clone(), poor.clone())),
            _ => None,
        }
    }
}
