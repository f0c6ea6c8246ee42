use crate::config::FailurePolicy;
use crate::core::tiling::{Tile, TileId, TilePlan};
use crate::core::wind_transform::WindTransform;
use crate::io::store::{RasterHandle, RasterKey, RasterStore};
use crate::io::windninja::{SimulationRequest, Simulator};
use crate::types::{Direction, Extent, Raster, WindError, WindResult, WindVariable};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Instant;

/// One unit of simulation work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct WorkItem {
    pub tile: TileId,
    pub direction: Direction,
}

impl std::fmt::Display for WorkItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tile {} direction {}", self.tile, self.direction.label())
    }
}

/// Every (tile, direction) pair, tile-major
pub fn work_items(plan: &TilePlan, directions: &[Direction]) -> Vec<WorkItem> {
    plan.tiles
        .iter()
        .flat_map(|tile| {
            directions.iter().map(move |&direction| WorkItem {
                tile: tile.id,
                direction,
            })
        })
        .collect()
}

/// Worker count: CPUs available to this process (honours affinity masks)
pub fn available_workers() -> usize {
    num_cpus::get().max(1)
}

/// One variable of a finished work item, restricted to the tile core
#[derive(Debug, Clone, Serialize)]
pub struct CroppedResult {
    pub tile: TileId,
    pub direction: Direction,
    pub variable: WindVariable,
    pub core_extent: Extent,
    pub handle: RasterHandle,
}

/// A work item that could not be completed
#[derive(Debug)]
pub struct WorkFailure {
    pub item: WorkItem,
    pub attempts: u32,
    pub error: WindError,
}

/// Outcome of a dispatch
#[derive(Debug)]
pub struct DispatchReport {
    /// Sorted by direction, variable, then tile
    pub results: Vec<CroppedResult>,
    pub failures: Vec<WorkFailure>,
    pub work_items: usize,
    pub workers: usize,
}

impl DispatchReport {
    pub fn completed_items(&self) -> usize {
        self.work_items - self.failures.len()
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Dispatch options
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    pub workers: usize,
    pub max_attempts: u32,
    pub policy: FailurePolicy,
    pub mesh_resolution: f64,
}

impl DispatchOptions {
    pub fn new(mesh_resolution: f64) -> Self {
        Self {
            workers: available_workers(),
            max_attempts: 1,
            policy: FailurePolicy::BestEffort,
            mesh_resolution,
        }
    }
}

/// Runs work items against a simulator and stores cropped results
pub struct WorkDispatcher<'a, S: Simulator + ?Sized, R: RasterStore + ?Sized> {
    plan: &'a TilePlan,
    simulator: &'a S,
    store: &'a R,
    transform: WindTransform,
    options: DispatchOptions,
}

impl<'a, S: Simulator + ?Sized, R: RasterStore + ?Sized> WorkDispatcher<'a, S, R> {
    pub fn new(
        plan: &'a TilePlan,
        simulator: &'a S,
        store: &'a R,
        transform: WindTransform,
        options: DispatchOptions,
    ) -> Self {
        Self {
            plan,
            simulator,
            store,
            transform,
            options,
        }
    }

    /// Crop the DEM to every padded tile extent and store the tile inputs.
    ///
    /// Written once per tile so that the directions of a tile never race
    /// on the same input file.
    pub fn prepare_inputs(&self, dem: &Raster) -> WindResult<HashMap<TileId, RasterHandle>> {
        if dem.width() != self.plan.width || dem.height() != self.plan.height {
            return Err(WindError::InvalidGeometry(format!(
                "DEM is {}x{} but the tile plan was made for {}x{}",
                dem.width(),
                dem.height(),
                self.plan.width,
                self.plan.height
            )));
        }

        let mut inputs = HashMap::with_capacity(self.plan.tiles.len());
        for tile in &self.plan.tiles {
            let cropped = if self.plan.is_single_tile() {
                dem.clone()
            } else {
                dem.window(&tile.padded)?
            };
            let handle = self.store.put(RasterKey::TileElevation(tile.id), &cropped)?;
            log::debug!("Tile {} input: {}", tile.id, handle.path.display());
            inputs.insert(tile.id, handle);
        }
        log::info!("Prepared {} tile inputs", inputs.len());
        Ok(inputs)
    }

    /// Run every (tile, direction) work item
    pub fn run(
        &self,
        inputs: &HashMap<TileId, RasterHandle>,
        directions: &[Direction],
    ) -> WindResult<DispatchReport> {
        let items = work_items(self.plan, directions);
        let workers = self.options.workers.max(1);
        log::info!(
            "Running {} combinations of direction and sub-area on {} workers",
            items.len(),
            workers
        );
        let started = Instant::now();

        let outcomes = self.execute_all(&items, inputs, workers)?;

        let mut results = Vec::with_capacity(items.len() * WindVariable::ALL.len());
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(cropped) => results.extend(cropped),
                Err(failure) => {
                    log::warn!(
                        "Work item {} failed after {} attempt(s): {}",
                        failure.item,
                        failure.attempts,
                        failure.error
                    );
                    failures.push(failure);
                }
            }
        }
        results.sort_by_key(|r| (r.direction, r.variable, r.tile));
        failures.sort_by_key(|f| f.item);

        log::info!(
            "Dispatch finished in {:.1?}: {} succeeded, {} failed",
            started.elapsed(),
            items.len() - failures.len(),
            failures.len()
        );

        Ok(DispatchReport {
            results,
            failures,
            work_items: items.len(),
            workers,
        })
    }

    #[cfg(feature = "parallel")]
    fn execute_all(
        &self,
        items: &[WorkItem],
        inputs: &HashMap<TileId, RasterHandle>,
        workers: usize,
    ) -> WindResult<Vec<Result<Vec<CroppedResult>, WorkFailure>>> {
        use rayon::prelude::*;

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("windmapper-worker-{}", i))
            .build()
            .map_err(|e| WindError::Processing(format!("Failed to build worker pool: {}", e)))?;

        pool.install(|| match self.options.policy {
            FailurePolicy::BestEffort => Ok(items
                .par_iter()
                .map(|&item| self.execute(item, inputs))
                .collect()),
            FailurePolicy::FailFast => items
                .par_iter()
                .map(|&item| -> WindResult<Result<Vec<CroppedResult>, WorkFailure>> {
                    self.execute(item, inputs).map(Ok).map_err(Self::abort)
                })
                .collect(),
        })
    }

    #[cfg(not(feature = "parallel"))]
    fn execute_all(
        &self,
        items: &[WorkItem],
        inputs: &HashMap<TileId, RasterHandle>,
        _workers: usize,
    ) -> WindResult<Vec<Result<Vec<CroppedResult>, WorkFailure>>> {
        let mut outcomes = Vec::with_capacity(items.len());
        for &item in items {
            let outcome = self.execute(item, inputs);
            if self.options.policy == FailurePolicy::FailFast {
                outcomes.push(Ok(outcome.map_err(Self::abort)?));
            } else {
                outcomes.push(outcome);
            }
        }
        Ok(outcomes)
    }

    fn abort(failure: WorkFailure) -> WindError {
        log::error!("Aborting run: work item {} failed: {}", failure.item, failure.error);
        failure.error
    }

    /// Run one work item, retrying collaborator failures up to `max_attempts`
    pub fn execute(
        &self,
        item: WorkItem,
        inputs: &HashMap<TileId, RasterHandle>,
    ) -> Result<Vec<CroppedResult>, WorkFailure> {
        let fail = |attempts, error| WorkFailure { item, attempts, error };

        let tile = match self.plan.tile(item.tile) {
            Some(tile) => tile,
            None => return Err(fail(0, WindError::InvalidGeometry(format!("Unknown tile {}", item.tile)))),
        };
        let input = match inputs.get(&item.tile) {
            Some(input) => input,
            None => return Err(fail(0, WindError::Processing(format!("No input prepared for tile {}", item.tile)))),
        };

        let max_attempts = self.options.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.attempt(tile, item.direction, input) {
                Ok(results) => {
                    log::debug!("Work item {} done", item);
                    return Ok(results);
                }
                Err(error) => {
                    let retryable = matches!(error, WindError::Collaborator(_) | WindError::Io(_));
                    if !retryable || attempt >= max_attempts {
                        return Err(fail(attempt, error));
                    }
                    log::warn!(
                        "Work item {} attempt {} of {} failed, retrying: {}",
                        item,
                        attempt,
                        max_attempts,
                        error
                    );
                    attempt += 1;
                }
            }
        }
    }

    /// Simulate, transform, crop and store one work item
    fn attempt(&self, tile: &Tile, direction: Direction, input: &RasterHandle) -> WindResult<Vec<CroppedResult>> {
        let request = SimulationRequest {
            tile,
            direction,
            elevation: input,
            mesh_resolution: self.options.mesh_resolution,
            output_dir: self.store.layout().tile_dir(tile.id),
        };
        let simulated = self.simulator.simulate(&request)?;
        let transformed = self.transform.apply(&simulated.speed, &simulated.direction)?;

        WindVariable::ALL
            .iter()
            .map(|&variable| -> WindResult<CroppedResult> {
                let padded = transformed.get(variable);
                let cropped = if self.plan.is_single_tile() {
                    padded.clone()
                } else {
                    padded.crop(&tile.core_extent)?
                };
                let key = RasterKey::Result {
                    tile: tile.id,
                    direction,
                    variable,
                };
                let handle = self.store.put(key, &cropped)?;
                Ok(CroppedResult {
                    tile: tile.id,
                    direction,
                    variable,
                    core_extent: tile.core_extent,
                    handle,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindMapperConfig;
    use crate::core::tiling::{TilePlanner, TilingParams};
    use crate::core::wind_transform::NormalizationPolicy;
    use crate::io::layout::OutputLayout;
    use crate::io::store::MemoryStore;
    use crate::io::windninja::SimulationResult;
    use crate::types::GeoTransform;
    use ndarray::Array2;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Returns uniform wind over the request's padded extent at mesh resolution
    struct UniformWind {
        speed: f32,
        fail_tile: Option<TileId>,
        transient_failures: Mutex<usize>,
        calls: AtomicUsize,
    }

    impl UniformWind {
        fn new(speed: f32) -> Self {
            Self {
                speed,
                fail_tile: None,
                transient_failures: Mutex::new(0),
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl Simulator for UniformWind {
        fn simulate(&self, request: &SimulationRequest<'_>) -> WindResult<SimulationResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_tile == Some(request.tile.id) {
                return Err(WindError::Collaborator("solver diverged".to_string()));
            }
            {
                let mut transient = self.transient_failures.lock().unwrap();
                if *transient > 0 {
                    *transient -= 1;
                    return Err(WindError::Collaborator("license server busy".to_string()));
                }
            }
            let extent = request.tile.padded_extent;
            let res = request.mesh_resolution;
            let cols = (extent.width() / res).round() as usize;
            let rows = (extent.height() / res).round() as usize;
            let transform = GeoTransform::north_up(extent.xmin, extent.ymax, res, res);
            let speed = Raster::new(Array2::from_elem((rows, cols), self.speed), transform, "");
            let direction = speed.with_data(Array2::from_elem((rows, cols), request.direction.degrees() as f32));
            Ok(SimulationResult { speed, direction })
        }
    }

    fn setup(width: usize, height: usize) -> (TilePlan, Raster, MemoryStore) {
        let transform = GeoTransform::north_up(0.0, height as f64 * 10.0, 10.0, 10.0);
        let dem = Raster::new(Array2::from_elem((height, width), 100.0f32), transform, "");
        let plan = TilePlanner::new(TilingParams {
            res_wind: 10.0,
            nres: 40.0,
            nadd: 5,
        })
        .plan_for(&dem)
        .unwrap();
        let layout = OutputLayout::new("/mem", &WindMapperConfig::new(10.0, "dem.tif"));
        (plan, dem, MemoryStore::new(layout))
    }

    fn options(policy: FailurePolicy, max_attempts: u32) -> DispatchOptions {
        DispatchOptions {
            workers: 2,
            max_attempts,
            policy,
            mesh_resolution: 10.0,
        }
    }

    #[test]
    fn test_work_items_cross_product() {
        let (plan, _, _) = setup(100, 100);
        let directions = Direction::all(4).unwrap();
        let items = work_items(&plan, &directions);
        assert_eq!(items.len(), plan.nopt_x * plan.nopt_y * 4);

        let mut unique = items.clone();
        unique.sort();
        unique.dedup();
        assert_eq!(unique.len(), items.len());
    }

    #[test]
    fn test_dispatch_crops_to_core() {
        let (plan, dem, store) = setup(100, 100);
        let sim = UniformWind::new(5.0);
        let dispatcher = WorkDispatcher::new(
            &plan,
            &sim,
            &store,
            WindTransform::new(NormalizationPolicy::TileMean),
            options(FailurePolicy::BestEffort, 1),
        );
        let inputs = dispatcher.prepare_inputs(&dem).unwrap();
        let directions = Direction::all(2).unwrap();
        let report = dispatcher.run(&inputs, &directions).unwrap();

        assert!(report.is_complete());
        assert_eq!(report.results.len(), plan.tiles.len() * 2 * 3);
        for result in &report.results {
            let tile = plan.tile(result.tile).unwrap();
            assert_eq!(result.handle.width, tile.core.cols);
            assert_eq!(result.handle.height, tile.core.rows);
        }
    }

    #[test]
    fn test_best_effort_records_failure() {
        let (plan, dem, store) = setup(100, 100);
        let mut sim = UniformWind::new(5.0);
        sim.fail_tile = Some(TileId::new(1, 1));
        let dispatcher = WorkDispatcher::new(
            &plan,
            &sim,
            &store,
            WindTransform::new(NormalizationPolicy::TileMean),
            options(FailurePolicy::BestEffort, 1),
        );
        let inputs = dispatcher.prepare_inputs(&dem).unwrap();
        let report = dispatcher.run(&inputs, &Direction::all(2).unwrap()).unwrap();

        assert_eq!(report.failures.len(), 2);
        assert!(report.failures.iter().all(|f| f.item.tile == TileId::new(1, 1)));
        assert_eq!(report.completed_items(), plan.tiles.len() * 2 - 2);
        assert!(report.results.iter().all(|r| r.tile != TileId::new(1, 1)));
    }

    #[test]
    fn test_fail_fast_aborts() {
        let (plan, dem, store) = setup(100, 100);
        let mut sim = UniformWind::new(5.0);
        sim.fail_tile = Some(TileId::new(0, 0));
        let dispatcher = WorkDispatcher::new(
            &plan,
            &sim,
            &store,
            WindTransform::new(NormalizationPolicy::TileMean),
            options(FailurePolicy::FailFast, 1),
        );
        let inputs = dispatcher.prepare_inputs(&dem).unwrap();
        let result = dispatcher.run(&inputs, &Direction::all(2).unwrap());
        assert!(matches!(result, Err(WindError::Collaborator(_))));
    }

    #[test]
    fn test_transient_failure_retried() {
        let (plan, dem, store) = setup(30, 30);
        assert!(plan.is_single_tile());
        let sim = UniformWind::new(5.0);
        *sim.transient_failures.lock().unwrap() = 1;
        let dispatcher = WorkDispatcher::new(
            &plan,
            &sim,
            &store,
            WindTransform::new(NormalizationPolicy::TileMean),
            DispatchOptions {
                workers: 1,
                ..options(FailurePolicy::BestEffort, 2)
            },
        );
        let inputs = dispatcher.prepare_inputs(&dem).unwrap();
        let report = dispatcher.run(&inputs, &Direction::all(1).unwrap()).unwrap();

        assert!(report.is_complete());
        assert_eq!(sim.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_degenerate_normalization_not_retried() {
        let (plan, dem, store) = setup(30, 30);
        let sim = UniformWind::new(0.0);
        let dispatcher = WorkDispatcher::new(
            &plan,
            &sim,
            &store,
            WindTransform::new(NormalizationPolicy::TileMean),
            options(FailurePolicy::BestEffort, 3),
        );
        let inputs = dispatcher.prepare_inputs(&dem).unwrap();
        let report = dispatcher.run(&inputs, &Direction::all(1).unwrap()).unwrap();

        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].attempts, 1);
        assert!(matches!(report.failures[0].error, WindError::DegenerateNormalization(_)));
        assert_eq!(sim.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_prepare_inputs_padded_windows() {
        let (plan, dem, store) = setup(100, 100);
        let sim = UniformWind::new(5.0);
        let dispatcher = WorkDispatcher::new(
            &plan,
            &sim,
            &store,
            WindTransform::new(NormalizationPolicy::TileMean),
            options(FailurePolicy::BestEffort, 1),
        );
        let inputs = dispatcher.prepare_inputs(&dem).unwrap();
        for tile in &plan.tiles {
            let handle = &inputs[&tile.id];
            assert_eq!((handle.width, handle.height), (tile.padded.cols, tile.padded.rows));
        }
    }
}
