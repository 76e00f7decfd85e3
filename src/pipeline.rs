//! The people-near-nature task graph: download, align, spread, mask.

use crate::align::{self, BoundingBoxMode, ResampleMethod};
use crate::crs;
use crate::download::{Decompress, EcoshardDownloader, Fetcher};
use crate::error::Result;
use crate::io;
use crate::kernel;
use crate::mask;
use crate::spread::{self, ConvolveOptions};
use crate::taskgraph::{TaskGraph, TaskId, TaskSpec};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const ECOSHARD_BASE_URL: &str = "https://storage.googleapis.com/critical-natural-capital-ecoshards/";
pub const POPULATION_ECOSHARD: &str = "lspop2017_md5_faaad64d15d0857894566199f62d422c.zip";
pub const HAB_MASK_ECOSHARD: &str = "masked_nathab_esa_nodata_md5_7c9acfe052cb7bdad319f011e9389fb1.tif";
pub const POOR_POP_ECOSHARD: &str =
    "rural_plus_urban_poor_pop_compressed_md5_e325640eb0ca7fdfaa5e6b3b31d2dc51.tif";
/// Directory inside the population zip holding the raster.
pub const POPULATION_LOCAL_PATH: &str = "lspop2017";

pub const HAB_MASK_KEY: &str = "hab_mask";
pub const TOTAL_POP_KEY: &str = "total_pop";
pub const POOR_POP_KEY: &str = "poor_pop";

pub const DEFAULT_WORKSPACE: &str = "people_near_nature_workspace";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_RADII_KM: [u32; 2] = [10, 100];
pub const DEFAULT_CHUNK_SIZE: usize = 2048;

/// Nodata of the masked outputs.
pub const MASKED_NODATA: f64 = -1.0;

/// Fixed directory tree under the workspace root.
#[derive(Debug, Clone)]
pub struct WorkspaceLayout {
    pub root: PathBuf,
    pub churn: PathBuf,
    pub aligned: PathBuf,
    pub ecoshard: PathBuf,
    pub taskgraph: PathBuf,
}

impl WorkspaceLayout {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        let root = root.into();
        Self {
            churn: root.join("churn"),
            aligned: root.join("aligned"),
            ecoshard: root.join("ecoshard"),
            taskgraph: root.join("taskgraph"),
            root,
        }
    }

    /// Create every directory; existing ones are fine.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.root, &self.churn, &self.ecoshard, &self.taskgraph, &self.aligned] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }

    pub fn kernel_path(&self, km: u32) -> PathBuf {
        self.churn.join(format!("{}_kernel.tif", km))
    }

    pub fn spread_path(&self, population_key: &str, km: u32) -> PathBuf {
        self.churn.join(format!("pop_spread_{}_{}.tif", population_key, km))
    }

    pub fn output_path(&self, population_key: &str, km: u32) -> PathBuf {
        self.root.join(format!("{}_{}.tif", population_key, km))
    }

    pub fn aligned_path(&self, base: &Path) -> PathBuf {
        match base.file_name() {
            Some(name) => self.aligned.join(name),
            None => self.aligned.join(base),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace: PathBuf,
    pub n_workers: usize,
    pub radii_km: Vec<u32>,
    pub chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace: PathBuf::from(DEFAULT_WORKSPACE),
            n_workers: DEFAULT_WORKERS,
            radii_km: DEFAULT_RADII_KM.to_vec(),
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Where the three base rasters come from.
pub enum PipelineInputs {
    /// Download the published ecoshards.
    Remote(Arc<dyn Fetcher>),
    /// Use rasters already on disk.
    Local {
        hab_mask: PathBuf,
        total_pop: PathBuf,
        poor_pop: PathBuf,
    },
}

/// Base raster paths in the order [hab_mask, total_pop, poor_pop], plus
/// the download tasks that produced them.
fn resolve_inputs(
    inputs: PipelineInputs,
    layout: &WorkspaceLayout,
    graph: &mut TaskGraph,
) -> Result<([PathBuf; 3], Vec<TaskId>)> {
    match inputs {
        PipelineInputs::Local {
            hab_mask,
            total_pop,
            poor_pop,
        } => Ok(([hab_mask, total_pop, poor_pop], Vec::new())),
        PipelineInputs::Remote(fetcher) => {
            let mut downloader = EcoshardDownloader::new(&layout.ecoshard, &layout.taskgraph, fetcher)?;
            for (name, key) in [(POOR_POP_ECOSHARD, POOR_POP_KEY), (HAB_MASK_ECOSHARD, HAB_MASK_KEY)] {
                let url = format!("{}{}", ECOSHARD_BASE_URL, name);
                downloader.download_ecoshard(graph, &url, key, Decompress::None, None)?;
            }
            let url = format!("{}{}", ECOSHARD_BASE_URL, POPULATION_ECOSHARD);
            downloader.download_ecoshard(
                graph,
                &url,
                TOTAL_POP_KEY,
                Decompress::Unzip,
                Some(POPULATION_LOCAL_PATH),
            )?;

            let keys = [HAB_MASK_KEY, TOTAL_POP_KEY, POOR_POP_KEY];
            let paths = [
                downloader.get_path(graph, keys[0])?,
                downloader.get_path(graph, keys[1])?,
                downloader.get_path(graph, keys[2])?,
            ];
            let tasks = keys
                .iter()
                .map(|key| downloader.task(key))
                .collect::<Result<Vec<_>>>()?;
            Ok((paths, tasks))
        }
    }
}

/// Build and run the whole graph. Returns the masked output rasters in
/// (radius, population) order.
pub fn run(config: &PipelineConfig, inputs: PipelineInputs) -> Result<Vec<PathBuf>> {
    let layout = WorkspaceLayout::new(&config.workspace);
    layout.ensure_dirs()?;
    let mut graph = TaskGraph::new(&layout.taskgraph, config.n_workers)?;

    let (base_paths, download_tasks) = resolve_inputs(inputs, &layout, &mut graph)?;
    let base_paths = base_paths.to_vec();
    let aligned_paths: Vec<PathBuf> = base_paths.iter().map(|p| layout.aligned_path(p)).collect();

    let population_info = io::get_raster_info(&base_paths[1])?;
    crs::check_geographic(&population_info.projection);
    let target_pixel_size = population_info.pixel_size;
    info!("Target pixel size: {:?}", target_pixel_size);

    let align_task = {
        let base = base_paths.clone();
        let targets = aligned_paths.clone();
        graph.add_task(
            TaskSpec::new("align rasters")
                .args(format!("{:?} {:?} near intersection", base_paths, target_pixel_size))
                .inputs(base_paths.iter())
                .targets(aligned_paths.iter())
                .dependencies(&download_tasks),
            move || {
                align::align_and_resize_raster_stack(
                    &base,
                    &targets,
                    &[ResampleMethod::Near; 3],
                    target_pixel_size,
                    BoundingBoxMode::Intersection,
                )
            },
        )?
    };

    let hab_mask_aligned = aligned_paths[0].clone();
    let aligned_population = [
        (TOTAL_POP_KEY, aligned_paths[1].clone()),
        (POOR_POP_KEY, aligned_paths[2].clone()),
    ];

    let mut outputs = Vec::new();
    for &km in &config.radii_km {
        let pixels = crs::radius_in_pixels(km, target_pixel_size.0)?;
        let kernel_radius = (pixels, pixels);
        let kernel_path = layout.kernel_path(km);

        let kernel_task = {
            let path = kernel_path.clone();
            graph.add_task(
                TaskSpec::new(format!("create {} kernel", km))
                    .args(format!("{:?} normalize=false", kernel_radius))
                    .targets([&kernel_path]),
                move || kernel::create_averaging_kernel_raster(kernel_radius, &path, false),
            )?
        };

        for (population_key, aligned_population_path) in &aligned_population {
            let spread_path = layout.spread_path(population_key, km);
            let options = ConvolveOptions {
                ignore_nodata: true,
                chunk_size: config.chunk_size,
                ..Default::default()
            };

            let spread_task = {
                let signal = aligned_population_path.clone();
                let kernel = kernel_path.clone();
                let target = spread_path.clone();
                graph.add_task(
                    TaskSpec::new(format!("spread {} to {}", population_key, km))
                        .args(format!("{} {} {:?}", signal.display(), kernel.display(), options))
                        .inputs([&signal, &kernel])
                        .targets([&spread_path])
                        .dependencies(&[kernel_task, align_task]),
                    move || spread::convolve_2d(&signal, &kernel, &target, &options),
                )?
            };

            let output_path = layout.output_path(population_key, km);
            {
                let signal = spread_path.clone();
                let hab_mask = hab_mask_aligned.clone();
                let target = output_path.clone();
                let chunk_size = config.chunk_size;
                graph.add_task(
                    TaskSpec::new(format!("mask {} {}", population_key, km))
                        .args(format!("{} {} {}", signal.display(), hab_mask.display(), MASKED_NODATA))
                        .inputs([&signal, &hab_mask])
                        .targets([&output_path])
                        .dependencies(&[spread_task]),
                    move || {
                        mask::build_overviews_raster_calculator(
                            &signal,
                            &hab_mask,
                            &target,
                            MASKED_NODATA,
                            chunk_size,
                        )
                    },
                )?;
            }
            outputs.push(output_path);
        }
    }

    graph.join()?;
    graph.close()?;
    Ok(outputs)
}
