//! End-to-end run: plan tiles, dispatch simulations, build mosaics.

use crate::config::WindMapperConfig;
use crate::core::dispatch::{DispatchOptions, DispatchReport, WorkDispatcher};
use crate::core::mosaic::{Mosaic, MosaicBuilder};
use crate::core::tiling::{TileId, TilePlan, TilePlanner};
use crate::core::wind_transform::WindTransform;
use crate::io::dem::ElevationSource;
use crate::io::store::RasterStore;
use crate::io::windninja::Simulator;
use crate::types::{Direction, Raster, WindResult, WindVariable};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Manifest entry for a failed work item
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub tile: TileId,
    pub direction: u32,
    pub attempts: u32,
    pub message: String,
}

/// Manifest entry for one mosaic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MosaicRecord {
    pub direction: u32,
    pub variable: WindVariable,
    pub path: Option<PathBuf>,
    pub contributors: usize,
    pub missing_tiles: Vec<TileId>,
}

/// Machine-readable summary of a run, written as `windmapper_manifest.json`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub nopt_x: usize,
    pub nopt_y: usize,
    pub directions: Vec<u32>,
    pub workers: usize,
    pub work_items: usize,
    pub completed_items: usize,
    pub failures: Vec<FailureRecord>,
    pub mosaics: Vec<MosaicRecord>,
}

impl RunReport {
    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn write_json<P: AsRef<Path>>(&self, path: P) -> WindResult<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)?;
        log::info!("Wrote run manifest: {}", path.as_ref().display());
        Ok(())
    }
}

/// Everything a run produced
#[derive(Debug)]
pub struct RunOutcome {
    pub report: RunReport,
    pub dispatch: DispatchReport,
    pub plan: TilePlan,
    pub mosaics: Vec<Mosaic>,
}

/// Drives a full wind-map computation
pub struct WindMapper<'a, S: Simulator + ?Sized, R: RasterStore + ?Sized> {
    config: &'a WindMapperConfig,
    simulator: &'a S,
    store: &'a R,
    workers: Option<usize>,
}

impl<'a, S: Simulator + ?Sized, R: RasterStore + ?Sized> WindMapper<'a, S, R> {
    pub fn new(config: &'a WindMapperConfig, simulator: &'a S, store: &'a R) -> Self {
        Self {
            config,
            simulator,
            store,
            workers: None,
        }
    }

    /// Override the worker count (defaults to the available CPUs)
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers);
        self
    }

    /// Prepare the reference DEM, then run on it
    pub fn run(&self, source: &dyn ElevationSource) -> WindResult<RunOutcome> {
        let dem = source.prepare(self.store.layout())?;
        self.run_with_elevation(&dem)
    }

    pub fn run_with_elevation(&self, dem: &Raster) -> WindResult<RunOutcome> {
        self.config.validate()?;
        let started_at = Utc::now();
        let started = Instant::now();

        let plan = TilePlanner::new(self.config.tiling_params()).plan_for(dem)?;
        log::info!(
            "Domain split into {} x {} sub-areas ({} tiles)",
            plan.nopt_x,
            plan.nopt_y,
            plan.tiles.len()
        );

        let directions = Direction::all(self.config.ncat)?;
        let mut options = DispatchOptions::new(self.config.res_wind);
        options.max_attempts = self.config.max_attempts.max(1);
        options.policy = self.config.failure_policy;
        if let Some(workers) = self.workers {
            options.workers = workers;
        }

        let transform = WindTransform::new(self.config.normalization());
        let dispatcher = WorkDispatcher::new(&plan, self.simulator, self.store, transform, options);
        let inputs = dispatcher.prepare_inputs(dem)?;
        let dispatch = dispatcher.run(&inputs, &directions)?;

        log::info!("Building mosaics");
        let mosaics = MosaicBuilder::new(plan.clone()).build_all(&directions, &dispatch.results)?;

        let layout = self.store.layout();
        let mut records = Vec::with_capacity(mosaics.len());
        for mosaic in &mosaics {
            let path = if self.store.writes_files() {
                let path = layout.mosaic_path(mosaic.direction, mosaic.variable);
                mosaic.write_vrt(&path)?;
                Some(path)
            } else {
                None
            };
            records.push(MosaicRecord {
                direction: mosaic.direction.label(),
                variable: mosaic.variable,
                path,
                contributors: mosaic.contributors().count(),
                missing_tiles: mosaic.missing_tiles(),
            });
        }

        let report = RunReport {
            started_at,
            finished_at: Utc::now(),
            nopt_x: plan.nopt_x,
            nopt_y: plan.nopt_y,
            directions: directions.iter().map(Direction::label).collect(),
            workers: dispatch.workers,
            work_items: dispatch.work_items,
            completed_items: dispatch.completed_items(),
            failures: dispatch
                .failures
                .iter()
                .map(|f| FailureRecord {
                    tile: f.item.tile,
                    direction: f.item.direction.label(),
                    attempts: f.attempts,
                    message: f.error.to_string(),
                })
                .collect(),
            mosaics: records,
        };
        if self.store.writes_files() {
            report.write_json(layout.manifest_path())?;
        }

        log::info!(
            "Run finished in {:.1?}: {}/{} work items, {} mosaics",
            started.elapsed(),
            report.completed_items,
            report.work_items,
            mosaics.len()
        );

        Ok(RunOutcome {
            report,
            dispatch,
            plan,
            mosaics,
        })
    }
}
