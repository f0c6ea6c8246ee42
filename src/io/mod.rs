//! I/O modules for rasters, run outputs and the WindNinja solver

pub mod raster_io;
pub mod layout;
pub mod store;
pub mod dem;
pub mod windninja;

pub use layout::OutputLayout;
pub use store::{GeoTiffStore, MemoryStore, RasterHandle, RasterKey, RasterStore};
pub use dem::{ElevationSource, ExistingDem};
pub use windninja::{SimulationRequest, SimulationResult, Simulator, WindNinjaCli};
