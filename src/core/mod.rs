//! Core wind-mapping modules

pub mod geometry;
pub mod tiling;
pub mod wind_transform;
pub mod dispatch;
pub mod mosaic;
pub mod pipeline;

// Re-export main types
pub use geometry::PixelWindow;
pub use tiling::{Tile, TileId, TilePlan, TilePlanner, TilingParams};
pub use wind_transform::{NormalizationPolicy, TransformedResult, WindTransform};
pub use dispatch::{CroppedResult, DispatchOptions, DispatchReport, WorkDispatcher, WorkFailure, WorkItem};
pub use mosaic::{Mosaic, MosaicBuilder, MosaicEntry, MosaicGrid, MosaicSample, SourcePlacement};
pub use pipeline::{RunOutcome, RunReport, WindMapper};
