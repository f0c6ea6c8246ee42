//! WindNinja command line collaborator.
//!
//! The simulator is reached through the [`Simulator`] trait so the
//! dispatcher can be driven by a scripted double in tests.

use crate::core::tiling::Tile;
use crate::io::layout::OutputLayout;
use crate::io::raster_io::read_raster;
use crate::io::store::RasterHandle;
use crate::types::{Direction, Raster, WindError, WindResult};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Lines of the simulator log quoted in failure messages
const LOG_TAIL_LINES: usize = 20;

/// Everything one simulation run needs
#[derive(Debug)]
pub struct SimulationRequest<'a> {
    pub tile: &'a Tile,
    pub direction: Direction,
    /// Tile DEM, cropped to the padded extent
    pub elevation: &'a RasterHandle,
    pub mesh_resolution: f64,
    pub output_dir: PathBuf,
}

/// Raw simulator output over the tile's padded extent
#[derive(Debug, Clone)]
pub struct SimulationResult {
    pub speed: Raster,
    /// Direction the wind blows from, in degrees
    pub direction: Raster,
}

/// A per-tile wind simulation
pub trait Simulator: Send + Sync {
    fn simulate(&self, request: &SimulationRequest<'_>) -> WindResult<SimulationResult>;
}

/// Default WindNinja mass-solver configuration
pub fn default_solver_config(num_threads: usize, input_speed: f64) -> String {
    let entries = [
        ("num_threads", num_threads.to_string()),
        ("initialization_method", "domainAverageInitialization".to_string()),
        ("units_mesh_resolution", "m".to_string()),
        ("input_speed", format!("{:.1}", input_speed)),
        ("input_speed_units", "mps".to_string()),
        ("input_wind_height", "40.0".to_string()),
        ("units_input_wind_height", "m".to_string()),
        ("output_wind_height", "40.0".to_string()),
        ("units_output_wind_height", "m".to_string()),
        ("output_speed_units", "mps".to_string()),
        ("vegetation", "grass".to_string()),
        ("diurnal_winds", "false".to_string()),
        ("write_goog_output", "false".to_string()),
        ("write_shapefile_output", "false".to_string()),
        ("write_ascii_output", "true".to_string()),
        ("write_farsite_atm", "false".to_string()),
    ];
    entries
        .iter()
        .map(|(key, value)| format!("{} = {}\n", key, value))
        .collect()
}

/// Write the default solver configuration into the output directory
pub fn write_default_solver_config(layout: &OutputLayout, num_threads: usize, input_speed: f64) -> WindResult<PathBuf> {
    let path = layout.solver_config_path();
    std::fs::write(&path, default_solver_config(num_threads, input_speed))?;
    log::info!("Wrote default WindNinja configuration: {}", path.display());
    Ok(path)
}

/// Runs `WindNinja_cli` as a child process
pub struct WindNinjaCli {
    exe: PathBuf,
    solver_config: PathBuf,
    data_dir: PathBuf,
    layout: OutputLayout,
    timeout: Option<Duration>,
}

impl WindNinjaCli {
    pub fn new(exe: impl Into<PathBuf>, solver_config: impl Into<PathBuf>, layout: OutputLayout) -> Self {
        let exe = exe.into();
        // WindNinja expects its data files in <prefix>/share/windninja
        let data_dir = exe
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("..")
            .join("share")
            .join("windninja");
        Self {
            exe,
            solver_config: solver_config.into(),
            data_dir,
            layout,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    fn build_command(&self, request: &SimulationRequest<'_>) -> Command {
        let mut command = Command::new(&self.exe);
        command
            .arg(&self.solver_config)
            .arg("--elevation_file")
            .arg(&request.elevation.path)
            .arg("--mesh_resolution")
            .arg(request.mesh_resolution.to_string())
            .arg("--input_direction")
            .arg(request.direction.label().to_string())
            .arg("--output_path")
            .arg(&request.output_dir)
            .env("WINDNINJA_DATA", &self.data_dir);
        command
    }

    fn read_output(&self, request: &SimulationRequest<'_>, variable: &str) -> WindResult<Raster> {
        let stem = self.layout.result_stem(request.tile.id, request.direction);
        let asc = request.output_dir.join(format!("{}{}.asc", stem, variable));
        let raster = read_raster(&asc).map_err(|e| {
            WindError::Collaborator(format!("Unreadable WindNinja output {}: {}", asc.display(), e))
        })?;

        remove_exchange_files(&asc);
        Ok(raster)
    }
}

impl Simulator for WindNinjaCli {
    fn simulate(&self, request: &SimulationRequest<'_>) -> WindResult<SimulationResult> {
        std::fs::create_dir_all(&request.output_dir)?;
        let log_path = request
            .output_dir
            .join(format!("windninja_{}.log", request.direction.label()));
        let log_file = File::create(&log_path)?;

        let mut command = self.build_command(request);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::from(log_file.try_clone()?))
            .stderr(Stdio::from(log_file));

        log::debug!("Running {:?}", command);
        let started = Instant::now();
        let mut child = command.spawn().map_err(|e| {
            WindError::Collaborator(format!("Failed to run {}: {}", self.exe.display(), e))
        })?;

        let status = wait_with_timeout(&mut child, self.timeout)?;
        if !status.success() {
            return Err(WindError::Collaborator(format!(
                "WindNinja exited with {} for tile {} direction {}\n{}",
                status,
                request.tile.id,
                request.direction.label(),
                log_tail(&log_path)
            )));
        }
        log::debug!(
            "WindNinja finished tile {} direction {} in {:.1?}",
            request.tile.id,
            request.direction.label(),
            started.elapsed()
        );

        let speed = self.read_output(request, "vel")?;
        let direction = self.read_output(request, "ang")?;
        if speed.data.dim() != direction.data.dim() {
            return Err(WindError::Collaborator(format!(
                "WindNinja speed grid {:?} and direction grid {:?} differ",
                speed.data.dim(),
                direction.data.dim()
            )));
        }
        Ok(SimulationResult { speed, direction })
    }
}

/// Wait for a child, killing it once `timeout` elapses
pub fn wait_with_timeout(child: &mut Child, timeout: Option<Duration>) -> WindResult<ExitStatus> {
    let limit = match timeout {
        Some(limit) => limit,
        None => return Ok(child.wait()?),
    };

    let started = Instant::now();
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(status);
        }
        if started.elapsed() >= limit {
            let _ = child.kill();
            let _ = child.wait();
            return Err(WindError::Collaborator(format!(
                "Simulation timed out after {:?}",
                limit
            )));
        }
        std::thread::sleep(POLL_INTERVAL.min(limit));
    }
}

/// Delete an ASCII grid and its `.prj` once read; returns how many files
/// were removed
fn remove_exchange_files(asc: &Path) -> usize {
    [asc.to_path_buf(), asc.with_extension("prj")]
        .iter()
        .filter(|path| match std::fs::remove_file(path) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Could not remove {}: {}", path.display(), e);
                false
            }
        })
        .count()
}

fn log_tail(path: &Path) -> String {
    match std::fs::read_to_string(path) {
        Ok(contents) => {
            let lines: Vec<&str> = contents.lines().collect();
            let start = lines.len().saturating_sub(LOG_TAIL_LINES);
            lines[start..].join("\n")
        }
        Err(_) => String::new(),
    }
}
