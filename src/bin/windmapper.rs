//! Command line entry point: `windmapper <config.yaml>`

use anyhow::{bail, Context, Result};
use clap::Parser;
use env_logger::Env;
use std::path::PathBuf;
use windmapper::core::dispatch::available_workers;
use windmapper::io::dem::utm_epsg_for;
use windmapper::io::windninja::write_default_solver_config;
use windmapper::io::OutputLayout;
use windmapper::{ExistingDem, GeoTiffStore, WindMapper, WindMapperConfig, WindNinjaCli};

#[derive(Parser, Debug)]
#[command(name = "windmapper")]
#[command(about = "Build wind-direction maps from WindNinja runs over a DEM")]
struct Args {
    /// YAML configuration file
    config: PathBuf,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::from_env(Env::default().default_filter_or(args.log_level.as_str()))
        .format_timestamp_secs()
        .init();

    let config = WindMapperConfig::load(&args.config)
        .with_context(|| format!("Loading {}", args.config.display()))?;
    config.check_external_paths()?;

    let dem_path = match (&config.dem_filename, config.use_existing_dem) {
        (Some(path), true) if path.is_file() => path.clone(),
        _ => {
            let hint = config
                .bounding_box()
                .map(|bbox| format!(" (EPSG:{} for this bounding box)", utm_epsg_for(&bbox)))
                .unwrap_or_default();
            bail!(
                "An existing projected DEM is required; reproject one to UTM{} and set dem_filename",
                hint
            );
        }
    };

    let output_dir = config.output_dir(&args.config)?;
    log::info!("Output directory: {}", output_dir.display());
    let layout = OutputLayout::new(&output_dir, &config);
    layout.reset()?;

    let workers = available_workers();
    let solver_config = match &config.fic_config_wn {
        Some(path) => path.clone(),
        None => write_default_solver_config(&layout, workers, config.input_speed)?,
    };

    let simulator = WindNinjaCli::new(config.resolve_wn_exe()?, solver_config, layout.clone())
        .with_timeout(config.simulation_timeout());
    let store = GeoTiffStore::new(layout);

    let outcome = WindMapper::new(&config, &simulator, &store)
        .with_workers(workers)
        .run(&ExistingDem::new(&dem_path))?;

    let report = &outcome.report;
    log::info!(
        "{} of {} work items completed, {} mosaics written",
        report.completed_items,
        report.work_items,
        report.mosaics.iter().filter(|m| m.path.is_some()).count()
    );
    if !report.is_complete() {
        for failure in &report.failures {
            log::error!(
                "Tile {} direction {}: {}",
                failure.tile,
                failure.direction,
                failure.message
            );
        }
        bail!("{} work item(s) failed; mosaics have holes", report.failures.len());
    }
    Ok(())
}
