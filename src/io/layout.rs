//! File naming for a run's output directory.
//!
//! ```text
//! <root>/ref-DEM-utm.tif                                  reference DEM
//! <root>/tmp_<i>_<j>.tif                                  tile inputs
//! <root>/tmp_dir_<i>_<j>/tmp_<i>_<j>_<dir>_<spd>_<res>m_<var>.tif
//! <root>/ref-DEM-utm_<dir>_<var>.vrt                      mosaics
//! <root>/windmapper_manifest.json
//! ```

use crate::config::WindMapperConfig;
use crate::core::tiling::TileId;
use crate::types::{Direction, WindResult, WindVariable};
use std::path::{Path, PathBuf};

const DEM_NAME: &str = "ref-DEM-utm";

#[derive(Debug, Clone)]
pub struct OutputLayout {
    root: PathBuf,
    res_wind: f64,
    input_speed: f64,
    speed_up_label: String,
}

impl OutputLayout {
    pub fn new(root: impl Into<PathBuf>, config: &WindMapperConfig) -> Self {
        Self {
            root: root.into(),
            res_wind: config.res_wind,
            input_speed: config.input_speed,
            speed_up_label: config.speed_up_label(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Delete any previous run and recreate an empty root directory
    pub fn reset(&self) -> WindResult<()> {
        if self.root.is_dir() {
            log::info!("Removing previous output directory: {}", self.root.display());
            std::fs::remove_dir_all(&self.root)?;
        }
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }

    pub fn dem_path(&self) -> PathBuf {
        self.root.join(format!("{}.tif", DEM_NAME))
    }

    pub fn solver_config_path(&self) -> PathBuf {
        self.root.join("default_cli_massSolver.cfg")
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.root.join("windmapper_manifest.json")
    }

    pub fn tile_input_path(&self, tile: TileId) -> PathBuf {
        self.root.join(format!("tmp_{}.tif", tile))
    }

    /// Working directory of one tile, shared by all its directions
    pub fn tile_dir(&self, tile: TileId) -> PathBuf {
        self.root.join(format!("tmp_dir_{}", tile))
    }

    /// Common file-name prefix of one work item's outputs, as WindNinja
    /// names them: `<dem stem>_<dir>_<speed>_<res>m_`
    pub fn result_stem(&self, tile: TileId, direction: Direction) -> String {
        format!(
            "tmp_{}_{}_{}_{}m_",
            tile,
            direction.label(),
            self.input_speed,
            self.res_wind
        )
    }

    pub fn variable_label(&self, variable: WindVariable) -> &str {
        match variable {
            WindVariable::U => "U",
            WindVariable::V => "V",
            WindVariable::SpeedUp => &self.speed_up_label,
        }
    }

    pub fn result_path(&self, tile: TileId, direction: Direction, variable: WindVariable) -> PathBuf {
        self.tile_dir(tile).join(format!(
            "{}{}.tif",
            self.result_stem(tile, direction),
            self.variable_label(variable)
        ))
    }

    pub fn mosaic_path(&self, direction: Direction, variable: WindVariable) -> PathBuf {
        self.root.join(format!(
            "{}_{}_{}.vrt",
            DEM_NAME,
            direction.label(),
            self.variable_label(variable)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_follow_tile_and_direction() {
        let mut config = WindMapperConfig::new(150.0, "dem.tif");
        config.ncat = 4;
        let layout = OutputLayout::new("/out", &config);
        let east = Direction::all(4).unwrap()[1];

        assert_eq!(layout.tile_input_path(TileId::new(1, 2)), PathBuf::from("/out/tmp_1_2.tif"));
        assert_eq!(
            layout.result_path(TileId::new(1, 2), east, WindVariable::SpeedUp),
            PathBuf::from("/out/tmp_dir_1_2/tmp_1_2_90_10_150m_spd_up_tile.tif")
        );
        assert_eq!(
            layout.mosaic_path(east, WindVariable::U),
            PathBuf::from("/out/ref-DEM-utm_90_U.vrt")
        );
    }

    #[test]
    fn test_reset_clears_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("run");
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("stale.tif"), b"old").unwrap();

        let layout = OutputLayout::new(&root, &WindMapperConfig::new(150.0, "dem.tif"));
        layout.reset().unwrap();
        assert!(root.is_dir());
        assert!(!root.join("stale.tif").exists());
    }
}
