//! Run configuration.
//!
//! A YAML document is parsed once into [`WindMapperConfig`] and validated
//! before any tiling or simulation starts. The validated value is then
//! passed by reference to every pipeline stage.
//!
//! ```yaml
//! res_wind: 150
//! ncat: 4
//! use_existing_dem: true
//! dem_filename: ../data/srtm_snowcast.tif
//! wind_average: grid
//! targ_res: 1000
//! ```

use crate::core::tiling::{TilingParams, DEFAULT_NADD, DEFAULT_NRES};
use crate::core::wind_transform::NormalizationPolicy;
use crate::types::{BoundingBox, WindError, WindResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Reference speed used for the speed-up factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WindAverage {
    /// Mean wind speed of each simulated tile
    #[default]
    #[serde(alias = "mean_tile", alias = "tile_mean")]
    TileMean,
    /// Moving average over a square of `targ_res` meters
    Grid,
}

/// What the dispatcher does when a work item fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Record the failure, keep going, and leave a hole in the mosaics
    #[default]
    #[serde(alias = "best_effort")]
    BestEffort,
    /// Abort the run on the first failed work item
    #[serde(alias = "fail_fast")]
    FailFast,
}

fn default_ncat() -> u32 {
    4
}

fn default_true() -> bool {
    true
}

fn default_nres() -> f64 {
    DEFAULT_NRES
}

fn default_nadd() -> usize {
    DEFAULT_NADD
}

fn default_input_speed() -> f64 {
    10.0
}

fn default_max_attempts() -> u32 {
    1
}

/// Immutable run configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WindMapperConfig {
    /// Simulation mesh resolution in meters
    pub res_wind: f64,
    /// Number of wind directions (every 360/ncat degrees)
    #[serde(default = "default_ncat")]
    pub ncat: u32,
    #[serde(default = "default_true")]
    pub use_existing_dem: bool,
    /// Projected DEM used when `use_existing_dem` is set
    #[serde(default)]
    pub dem_filename: Option<PathBuf>,
    #[serde(default)]
    pub lat_min: Option<f64>,
    #[serde(default)]
    pub lat_max: Option<f64>,
    #[serde(default)]
    pub lon_min: Option<f64>,
    #[serde(default)]
    pub lon_max: Option<f64>,
    #[serde(default)]
    pub wind_average: WindAverage,
    /// Averaging resolution in meters, required for `grid` averaging
    #[serde(default)]
    pub targ_res: Option<f64>,
    /// WindNinja command line executable
    #[serde(default)]
    pub wn_exe: Option<PathBuf>,
    /// WindNinja solver configuration; a default one is generated when absent
    #[serde(default, rename = "fic_config_WN", alias = "fic_config_wn")]
    pub fic_config_wn: Option<PathBuf>,
    #[serde(default)]
    pub user_output_dir: Option<PathBuf>,
    /// Target tile size in simulation cells
    #[serde(default = "default_nres")]
    pub nres: f64,
    /// Tile overlap in DEM pixels
    #[serde(default = "default_nadd")]
    pub nadd: usize,
    /// Domain-average input speed handed to WindNinja (m/s)
    #[serde(default = "default_input_speed")]
    pub input_speed: f64,
    #[serde(default)]
    pub simulation_timeout_secs: Option<u64>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl WindMapperConfig {
    /// Minimal configuration for an existing DEM
    pub fn new(res_wind: f64, dem_filename: impl Into<PathBuf>) -> Self {
        Self {
            res_wind,
            ncat: default_ncat(),
            use_existing_dem: true,
            dem_filename: Some(dem_filename.into()),
            lat_min: None,
            lat_max: None,
            lon_min: None,
            lon_max: None,
            wind_average: WindAverage::default(),
            targ_res: None,
            wn_exe: None,
            fic_config_wn: None,
            user_output_dir: None,
            nres: default_nres(),
            nadd: default_nadd(),
            input_speed: default_input_speed(),
            simulation_timeout_secs: None,
            max_attempts: default_max_attempts(),
            failure_policy: FailurePolicy::default(),
        }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(contents: &str) -> WindResult<Self> {
        let config: WindMapperConfig = serde_yaml::from_str(contents)
            .map_err(|e| WindError::Configuration(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a YAML configuration file
    pub fn load<P: AsRef<Path>>(path: P) -> WindResult<Self> {
        log::info!("Loading configuration from: {}", path.as_ref().display());
        let contents = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            WindError::Configuration(format!("Cannot read {}: {}", path.as_ref().display(), e))
        })?;
        let config = Self::from_yaml_str(&contents)?;
        log::debug!("Configuration: {:?}", config);
        Ok(config)
    }

    /// Check option values and combinations.
    ///
    /// Paths to external files are checked separately by
    /// [`check_external_paths`](Self::check_external_paths).
    pub fn validate(&self) -> WindResult<()> {
        let bad = |msg: String| Err(WindError::Configuration(msg));

        if !(self.res_wind.is_finite() && self.res_wind > 0.0) {
            return bad(format!("res_wind must be > 0, got {}", self.res_wind));
        }
        if self.ncat == 0 {
            return bad("ncat must be > 0".to_string());
        }
        if self.ncat > 360 {
            return bad(format!("ncat must be at most 360 so direction labels stay unique, got {}", self.ncat));
        }

        if self.use_existing_dem {
            if self.dem_filename.is_none() {
                return bad("dem_filename is required when use_existing_dem is true".to_string());
            }
        } else {
            let bbox = match self.bounding_box() {
                Some(bbox) => bbox,
                None => {
                    return bad(
                        "Coordinates of the bounding box (lat_min, lat_max, lon_min, lon_max) must be specified to download a DEM"
                            .to_string(),
                    )
                }
            };
            if bbox.min_lat >= bbox.max_lat || bbox.min_lon >= bbox.max_lon {
                return bad(format!("Bounding box is empty: {:?}", bbox));
            }
        }

        match (self.wind_average, self.targ_res) {
            (WindAverage::Grid, None) => {
                return bad("targ_res is required when wind_average is grid".to_string());
            }
            (WindAverage::Grid, Some(targ_res)) => {
                if !(targ_res.is_finite() && targ_res > 0.0) {
                    return bad(format!("Target resolution must be > 0, got {}", targ_res));
                }
                if targ_res < self.res_wind {
                    return bad(format!(
                        "targ_res ({}) must not be finer than res_wind ({})",
                        targ_res, self.res_wind
                    ));
                }
            }
            (WindAverage::TileMean, Some(targ_res)) => {
                log::warn!("targ_res = {} is ignored with tile-mean averaging", targ_res);
            }
            (WindAverage::TileMean, None) => {}
        }

        if !(self.nres.is_finite() && self.nres > 0.0) {
            return bad(format!("nres must be > 0, got {}", self.nres));
        }
        if !(self.input_speed.is_finite() && self.input_speed > 0.0) {
            return bad(format!("input_speed must be > 0, got {}", self.input_speed));
        }
        if self.max_attempts == 0 {
            return bad("max_attempts must be at least 1".to_string());
        }
        if self.simulation_timeout_secs == Some(0) {
            return bad("simulation_timeout_secs must be > 0 when set".to_string());
        }
        Ok(())
    }

    /// Verify the files the real simulator needs are present
    pub fn check_external_paths(&self) -> WindResult<()> {
        let exe = self.resolve_wn_exe()?;
        if !exe.exists() {
            return Err(WindError::Configuration(format!(
                "Invalid path for WindNinja_cli: {}. Consider specifying a `wn_exe` config option",
                exe.display()
            )));
        }
        if let Some(cfg) = &self.fic_config_wn {
            if !cfg.exists() {
                return Err(WindError::Configuration(format!(
                    "Invalid path for the WindNinja configuration given in `fic_config_WN`: {}",
                    cfg.display()
                )));
            }
        }
        if let Some(dem) = self.dem_filename.as_ref().filter(|_| self.use_existing_dem) {
            if !dem.exists() {
                return Err(WindError::Configuration(format!("DEM file not found: {}", dem.display())));
            }
        }
        Ok(())
    }

    /// Configured executable, or `bin/WindNinja_cli` next to the running binary
    pub fn resolve_wn_exe(&self) -> WindResult<PathBuf> {
        if let Some(exe) = &self.wn_exe {
            return Ok(exe.clone());
        }
        let current = std::env::current_exe()?;
        let dir = current
            .parent()
            .ok_or_else(|| WindError::Configuration("Cannot locate the windmapper binary directory".to_string()))?;
        Ok(dir.join("bin").join("WindNinja_cli"))
    }

    /// Output directory: `user_output_dir`, else a directory named after the
    /// configuration file in the current working directory
    pub fn output_dir<P: AsRef<Path>>(&self, config_path: P) -> WindResult<PathBuf> {
        if let Some(dir) = &self.user_output_dir {
            return Ok(dir.clone());
        }
        let stem = config_path.as_ref().file_stem().ok_or_else(|| {
            WindError::Configuration(format!(
                "Cannot derive an output directory from {}",
                config_path.as_ref().display()
            ))
        })?;
        Ok(std::env::current_dir()?.join(stem))
    }

    pub fn bounding_box(&self) -> Option<BoundingBox> {
        Some(BoundingBox {
            min_lon: self.lon_min?,
            max_lon: self.lon_max?,
            min_lat: self.lat_min?,
            max_lat: self.lat_max?,
        })
    }

    pub fn tiling_params(&self) -> TilingParams {
        TilingParams {
            res_wind: self.res_wind,
            nres: self.nres,
            nadd: self.nadd,
        }
    }

    pub fn normalization(&self) -> NormalizationPolicy {
        match (self.wind_average, self.targ_res) {
            (WindAverage::Grid, Some(targ_res)) => NormalizationPolicy::grid(targ_res, self.res_wind),
            _ => NormalizationPolicy::TileMean,
        }
    }

    /// File-name label of the speed-up variable
    pub fn speed_up_label(&self) -> String {
        match (self.wind_average, self.targ_res) {
            (WindAverage::Grid, Some(targ_res)) => format!("spd_up_{}", targ_res),
            _ => "spd_up_tile".to_string(),
        }
    }

    pub fn simulation_timeout(&self) -> Option<Duration> {
        self.simulation_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WindMapperConfig::from_yaml_str("res_wind: 150\ndem_filename: dem.tif\n").unwrap();
        assert_eq!(config.ncat, 4);
        assert!(config.use_existing_dem);
        assert_eq!(config.wind_average, WindAverage::TileMean);
        assert_eq!(config.failure_policy, FailurePolicy::BestEffort);
        assert_eq!(config.nadd, 25);
        assert_eq!(config.tiling_params().tile_length(), 90_000.0);
        assert_eq!(config.speed_up_label(), "spd_up_tile");
    }

    #[test]
    fn test_grid_averaging() {
        let yaml = "res_wind: 150\ndem_filename: dem.tif\nwind_average: grid\ntarg_res: 1000\n";
        let config = WindMapperConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.normalization(), NormalizationPolicy::MovingAverage { window: 7 });
        assert_eq!(config.speed_up_label(), "spd_up_1000");
    }

    #[test]
    fn test_legacy_names_accepted() {
        let yaml = "res_wind: 150\ndem_filename: dem.tif\nwind_average: mean_tile\nfic_config_WN: solver.cfg\n";
        let config = WindMapperConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(config.wind_average, WindAverage::TileMean);
        assert_eq!(config.fic_config_wn, Some(PathBuf::from("solver.cfg")));
    }

    #[test]
    fn test_invalid_combinations_rejected() {
        let cases = [
            "res_wind: 150\ndem_filename: dem.tif\nncat: 0\n",
            "res_wind: 150\ndem_filename: dem.tif\nncat: 361\n",
            "res_wind: 0\ndem_filename: dem.tif\n",
            "res_wind: 150\n",
            "res_wind: 150\nuse_existing_dem: false\nlat_min: 46.5\nlat_max: 46.7\n",
            "res_wind: 150\ndem_filename: dem.tif\nwind_average: grid\n",
            "res_wind: 150\ndem_filename: dem.tif\nwind_average: grid\ntarg_res: 100\n",
            "res_wind: 150\ndem_filename: dem.tif\nwind_average: grid\ntarg_res: -5\n",
            "res_wind: 150\ndem_filename: dem.tif\nwind_average: median\n",
            "res_wind: 150\ndem_filename: dem.tif\nmax_attempts: 0\n",
            "res_wind: 150\ndem_filename: dem.tif\nunknown_option: 3\n",
        ];
        for yaml in cases {
            let result = WindMapperConfig::from_yaml_str(yaml);
            assert!(
                matches!(result, Err(WindError::Configuration(_))),
                "expected rejection for {:?}",
                yaml
            );
        }
    }

    #[test]
    fn test_download_mode_needs_bounding_box() {
        let yaml = "res_wind: 150\nuse_existing_dem: false\nlat_min: 46.5\nlat_max: 46.7\nlon_min: 5.8\nlon_max: 6.15\n";
        let config = WindMapperConfig::from_yaml_str(yaml).unwrap();
        let bbox = config.bounding_box().unwrap();
        assert_eq!(bbox.min_lon, 5.8);
        assert_eq!(bbox.max_lat, 46.7);
    }

    #[test]
    fn test_output_dir_defaults_to_config_stem() {
        let config = WindMapperConfig::new(150.0, "dem.tif");
        let dir = config.output_dir("configs/param_existing_DEM.yaml").unwrap();
        assert!(dir.ends_with("param_existing_DEM"));

        let mut explicit = config.clone();
        explicit.user_output_dir = Some(PathBuf::from("/tmp/wind"));
        assert_eq!(explicit.output_dir("x.yaml").unwrap(), PathBuf::from("/tmp/wind"));
    }
}
