use crate::core::geometry::nearest_pixel;
use crate::core::tiling::TileId;
use crate::io::layout::OutputLayout;
use crate::io::raster_io::{read_pixel, read_raster, write_geotiff};
use crate::types::{Direction, GeoTransform, Raster, WindError, WindResult, WindVariable};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// What a stored raster is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum RasterKey {
    /// DEM cropped to a tile's padded extent
    TileElevation(TileId),
    /// One variable of a work item, cropped to the tile's core extent
    Result {
        tile: TileId,
        direction: Direction,
        variable: WindVariable,
    },
}

/// Reference to a stored raster plus the georeferencing needed to place it
/// in a mosaic without reading its samples
#[derive(Debug, Clone, Serialize)]
pub struct RasterHandle {
    pub key: RasterKey,
    pub path: PathBuf,
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
    #[serde(skip)]
    pub projection: String,
}

impl RasterHandle {
    fn describe(key: RasterKey, path: PathBuf, raster: &Raster) -> Self {
        Self {
            key,
            path,
            transform: raster.transform,
            width: raster.width(),
            height: raster.height(),
            projection: raster.projection.clone(),
        }
    }
}

/// Persistence for the rasters a run produces.
///
/// Implementations must tolerate concurrent `put` calls for distinct keys.
pub trait RasterStore: Send + Sync {
    fn layout(&self) -> &OutputLayout;

    fn put(&self, key: RasterKey, raster: &Raster) -> WindResult<RasterHandle>;

    fn get(&self, handle: &RasterHandle) -> WindResult<Raster>;

    /// Nearest sample at a map coordinate, clamped to the raster edge
    fn sample(&self, handle: &RasterHandle, x: f64, y: f64) -> WindResult<Option<f32>> {
        Ok(self.get(handle)?.sample_nearest(x, y))
    }

    /// Whether handles point at real files that GDAL can open
    fn writes_files(&self) -> bool {
        true
    }

    fn path_for(&self, key: RasterKey) -> PathBuf {
        let layout = self.layout();
        match key {
            RasterKey::TileElevation(tile) => layout.tile_input_path(tile),
            RasterKey::Result {
                tile,
                direction,
                variable,
            } => layout.result_path(tile, direction, variable),
        }
    }
}

/// GeoTIFF files under the output layout
pub struct GeoTiffStore {
    layout: OutputLayout,
}

impl GeoTiffStore {
    pub fn new(layout: OutputLayout) -> Self {
        Self { layout }
    }
}

impl RasterStore for GeoTiffStore {
    fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    fn put(&self, key: RasterKey, raster: &Raster) -> WindResult<RasterHandle> {
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        write_geotiff(raster, &path)?;
        Ok(RasterHandle::describe(key, path, raster))
    }

    fn get(&self, handle: &RasterHandle) -> WindResult<Raster> {
        read_raster(&handle.path)
    }

    fn sample(&self, handle: &RasterHandle, x: f64, y: f64) -> WindResult<Option<f32>> {
        match nearest_pixel(&handle.transform, handle.width, handle.height, x, y) {
            Some((col, row)) => read_pixel(&handle.path, col, row).map(Some),
            None => Ok(None),
        }
    }
}

/// In-memory store; paths in handles are nominal
pub struct MemoryStore {
    layout: OutputLayout,
    rasters: Mutex<HashMap<RasterKey, Raster>>,
}

impl MemoryStore {
    pub fn new(layout: OutputLayout) -> Self {
        Self {
            layout,
            rasters: Mutex::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.rasters.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: RasterKey) -> bool {
        self.rasters.lock().map(|r| r.contains_key(&key)).unwrap_or(false)
    }
}

impl RasterStore for MemoryStore {
    fn layout(&self) -> &OutputLayout {
        &self.layout
    }

    fn put(&self, key: RasterKey, raster: &Raster) -> WindResult<RasterHandle> {
        let mut rasters = self
            .rasters
            .lock()
            .map_err(|_| WindError::Processing("Raster store lock poisoned".to_string()))?;
        rasters.insert(key, raster.clone());
        Ok(RasterHandle::describe(key, self.path_for(key), raster))
    }

    fn get(&self, handle: &RasterHandle) -> WindResult<Raster> {
        let rasters = self
            .rasters
            .lock()
            .map_err(|_| WindError::Processing("Raster store lock poisoned".to_string()))?;
        rasters
            .get(&handle.key)
            .cloned()
            .ok_or_else(|| WindError::Processing(format!("No raster stored for {:?}", handle.key)))
    }

    fn sample(&self, handle: &RasterHandle, x: f64, y: f64) -> WindResult<Option<f32>> {
        let rasters = self
            .rasters
            .lock()
            .map_err(|_| WindError::Processing("Raster store lock poisoned".to_string()))?;
        rasters
            .get(&handle.key)
            .map(|raster| raster.sample_nearest(x, y))
            .ok_or_else(|| WindError::Processing(format!("No raster stored for {:?}", handle.key)))
    }

    fn writes_files(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WindMapperConfig;
    use ndarray::Array2;

    #[test]
    fn test_memory_store_round_trip() {
        let layout = OutputLayout::new("/nowhere", &WindMapperConfig::new(150.0, "dem.tif"));
        let store = MemoryStore::new(layout);
        let raster = Raster::new(
            Array2::from_elem((3, 4), 2.5f32),
            GeoTransform::north_up(10.0, 20.0, 5.0, 5.0),
            "",
        );

        let key = RasterKey::TileElevation(TileId::new(0, 1));
        let handle = store.put(key, &raster).unwrap();
        assert_eq!(handle.width, 4);
        assert_eq!(handle.height, 3);
        assert_eq!(handle.path, PathBuf::from("/nowhere/tmp_0_1.tif"));
        assert!(store.contains(key));

        let back = store.get(&handle).unwrap();
        assert_eq!(back.data, raster.data);
        assert!(!store.writes_files());
    }

    #[test]
    fn test_geotiff_store_samples_one_pixel() {
        let dir = tempfile::tempdir().unwrap();
        let layout = OutputLayout::new(dir.path(), &WindMapperConfig::new(150.0, "dem.tif"));
        let store = GeoTiffStore::new(layout);
        let raster = Raster::new(
            Array2::from_shape_fn((3, 4), |(r, c)| (r * 4 + c) as f32),
            GeoTransform::north_up(10.0, 20.0, 5.0, 5.0),
            "",
        );

        let handle = store.put(RasterKey::TileElevation(TileId::new(0, 0)), &raster).unwrap();
        // row 1, col 2
        assert_eq!(store.sample(&handle, 22.0, 12.0).unwrap(), Some(6.0));
        // clamped to the south-east corner
        assert_eq!(store.sample(&handle, 100.0, -100.0).unwrap(), Some(11.0));
    }
}
