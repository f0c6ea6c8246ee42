//! windmapper: terrain-aware wind maps from a DEM.
//!
//! The domain is split into overlapping sub-areas, WindNinja is run once per
//! sub-area and wind direction, and the results are turned into U/V wind
//! components and a normalized speed-up factor. Cropped tile outputs are
//! stitched into one virtual mosaic (GDAL VRT) per direction and variable.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    BoundingBox, Direction, Extent, GeoTransform, Raster, WindError, WindResult, WindVariable,
};

pub use config::{FailurePolicy, WindAverage, WindMapperConfig};
pub use core::{MosaicBuilder, TilePlanner, WindMapper, WindTransform, WorkDispatcher};
pub use io::{ElevationSource, ExistingDem, GeoTiffStore, MemoryStore, RasterStore, Simulator, WindNinjaCli};
