use clap::Parser;
use env_logger::Env;
use log::info;
use std::sync::Arc;

use people_near_nature::cli::Args;
use people_near_nature::download::HttpFetcher;
use people_near_nature::pipeline::{self, PipelineInputs};
use people_near_nature::Result;

fn main() -> Result<()> {
    let args = Args::parse();

    // Task graph bookkeeping is noisy below warn
    let log_level = if args.verbose { "debug" } else { "info" };
    let filter = format!("{},people_near_nature::taskgraph=warn", log_level);
    env_logger::Builder::from_env(Env::default().default_filter_or(filter)).init();

    info!("=== People Near Nature ===");

    let config = args.pipeline_config();
    info!("Workspace: {}", config.workspace.display());
    info!("Radii (km): {:?}, workers: {}", config.radii_km, config.n_workers);

    let inputs = match args.local_inputs() {
        Some((hab_mask, total_pop, poor_pop)) => {
            info!("Using local rasters, skipping downloads");
            PipelineInputs::Local {
                hab_mask,
                total_pop,
                poor_pop,
            }
        }
        None => PipelineInputs::Remote(Arc::new(HttpFetcher::new()?)),
    };

    let outputs = pipeline::run(&config, inputs)?;
    for output in &outputs {
        info!("Wrote {}", output.display());
    }

    info!("=== Done! ===");
    Ok(())
}
