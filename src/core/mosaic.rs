//! Virtual mosaics of cropped tile results.
//!
//! A [`Mosaic`] is an index over the cropped rasters of one (direction,
//! variable) pair. It never copies pixel data: a coordinate is resolved to
//! the tile whose core extent holds it and only that tile's raster is read.
//!
//! The same index is serialized as a GDAL VRT on one output grid at the
//! simulation resolution, anchored at the domain's top-left corner. Every
//! tile core is snapped to that grid, so neighbouring tiles meet on a shared
//! cell boundary and the sources cover the grid without gaps or overlaps.
//! Each tile raster was simulated on its own grid; its pixels are placed on
//! whole output cells, nearest pixel first.

use crate::core::dispatch::CroppedResult;
use crate::core::geometry::{coord_to_index, pixel_size, PixelWindow};
use crate::core::tiling::{TileId, TilePlan};
use crate::io::store::{RasterHandle, RasterStore};
use crate::types::{Direction, Extent, GeoTransform, WindError, WindResult, WindVariable, NODATA_VALUE};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Relative slack when comparing cell counts and resolutions
const GRID_TOLERANCE: f64 = 1e-6;

/// Value of a mosaic at one coordinate
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MosaicSample {
    Value(f32),
    /// The tile covering the coordinate has no result
    Missing(TileId),
    /// The coordinate is outside the domain
    Outside,
}

/// One tile slot of a mosaic
#[derive(Debug, Clone)]
pub struct MosaicEntry {
    pub tile: TileId,
    pub core_extent: Extent,
    pub source: Option<RasterHandle>,
}

/// Output grid of a mosaic
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MosaicGrid {
    pub transform: GeoTransform,
    pub width: usize,
    pub height: usize,
}

/// Where pixels of one contributor land on the mosaic grid.
///
/// `src` and `dst` have the same size, except for a single edge row or
/// column of `src` repeated over cells its raster does not reach.
#[derive(Debug, Clone, PartialEq)]
pub struct SourcePlacement {
    pub tile: TileId,
    pub path: PathBuf,
    pub src: PixelWindow,
    pub dst: PixelWindow,
}

/// Full-domain virtual raster for one direction and variable
#[derive(Debug, Clone)]
pub struct Mosaic {
    pub direction: Direction,
    pub variable: WindVariable,
    plan: Arc<TilePlan>,
    entries: BTreeMap<TileId, MosaicEntry>,
}

impl Mosaic {
    pub fn domain(&self) -> Extent {
        self.plan.domain
    }

    pub fn contributors(&self) -> impl Iterator<Item = &RasterHandle> {
        self.entries.values().filter_map(|e| e.source.as_ref())
    }

    /// Tiles without a result, i.e. holes in the mosaic
    pub fn missing_tiles(&self) -> Vec<TileId> {
        self.entries
            .values()
            .filter(|e| e.source.is_none())
            .map(|e| e.tile)
            .collect()
    }

    pub fn is_complete(&self) -> bool {
        self.entries.values().all(|e| e.source.is_some())
    }

    /// Slot whose core extent holds a coordinate
    pub fn locate(&self, x: f64, y: f64) -> Option<&MosaicEntry> {
        let tile = self.plan.tile_at(x, y)?;
        self.entries.get(&tile.id)
    }

    /// Resolve one coordinate, reading a single pixel of the contributing
    /// raster
    pub fn sample<R: RasterStore + ?Sized>(&self, store: &R, x: f64, y: f64) -> WindResult<MosaicSample> {
        let entry = match self.locate(x, y) {
            Some(entry) => entry,
            None => return Ok(MosaicSample::Outside),
        };
        let handle = match &entry.source {
            Some(handle) => handle,
            None => return Ok(MosaicSample::Missing(entry.tile)),
        };
        store
            .sample(handle, x, y)?
            .map(MosaicSample::Value)
            .ok_or_else(|| WindError::InvalidGeometry(format!("Empty raster for tile {}", entry.tile)))
    }

    /// Grid at the contributors' resolution spanning the whole domain.
    /// A partial cell at the east or south edge is kept.
    pub fn grid(&self) -> MosaicGrid {
        let domain = self.domain();
        let (res_x, res_y) = match self.contributors().next() {
            Some(handle) => pixel_size(&handle.transform),
            None => pixel_size(&self.plan.transform),
        };
        let cells = |len: f64, res: f64| ((len / res - GRID_TOLERANCE).ceil() as usize).max(1);
        MosaicGrid {
            transform: GeoTransform::north_up(domain.xmin, domain.ymax, res_x, res_y),
            width: cells(domain.width(), res_x),
            height: cells(domain.height(), res_y),
        }
    }

    /// Placement of every contributor on [`grid`](Self::grid)
    pub fn placements(&self) -> WindResult<Vec<SourcePlacement>> {
        let grid = self.grid();
        let domain = self.domain();
        let (res_x, res_y) = pixel_size(&grid.transform);
        let to_col = |x: f64| (((x - domain.xmin) / res_x).round().max(0.0) as usize).min(grid.width);
        let to_row = |y: f64| (((domain.ymax - y) / res_y).round().max(0.0) as usize).min(grid.height);

        let mut placements = Vec::new();
        for entry in self.entries.values() {
            let handle = match &entry.source {
                Some(handle) => handle,
                None => continue,
            };
            let tile = self
                .plan
                .tile(entry.tile)
                .ok_or_else(|| WindError::InvalidGeometry(format!("Unknown tile {}", entry.tile)))?;

            let (pw, ph) = pixel_size(&handle.transform);
            if (pw - res_x).abs() > GRID_TOLERANCE * res_x || (ph - res_y).abs() > GRID_TOLERANCE * res_y {
                return Err(WindError::InvalidGeometry(format!(
                    "Tile {} is at {}x{} m but the mosaic grid is {}x{} m",
                    entry.tile, pw, ph, res_x, res_y
                )));
            }

            // outer domain edges map to the grid edges, inner ones to the
            // nearest shared cell boundary
            let core = tile.core;
            let extent = entry.core_extent;
            let col_start = if core.col_off == 0 { 0 } else { to_col(extent.xmin) };
            let col_end = if core.col_end() == self.plan.width { grid.width } else { to_col(extent.xmax) };
            let row_start = if core.row_off == 0 { 0 } else { to_row(extent.ymax) };
            let row_end = if core.row_end() == self.plan.height { grid.height } else { to_row(extent.ymin) };
            if col_end <= col_start || row_end <= row_start {
                log::debug!("Tile {} core is narrower than one mosaic cell", entry.tile);
                continue;
            }

            // source pixel under the centre of the first destination cell
            let (first_col, first_row) = coord_to_index(
                &handle.transform,
                domain.xmin + (col_start as f64 + 0.5) * res_x,
                domain.ymax - (row_start as f64 + 0.5) * res_y,
            );
            let cols = axis_segments(col_start, col_end, first_col.floor() as i64, handle.width);
            let rows = axis_segments(row_start, row_end, first_row.floor() as i64, handle.height);
            for x in &cols {
                for y in &rows {
                    placements.push(SourcePlacement {
                        tile: entry.tile,
                        path: handle.path.clone(),
                        src: PixelWindow::new(x.src_off, y.src_off, x.src_len, y.src_len),
                        dst: PixelWindow::new(x.dst_off, y.dst_off, x.dst_len, y.dst_len),
                    });
                }
            }
        }
        Ok(placements)
    }

    /// GDAL VRT document referencing every contributor
    pub fn to_vrt(&self) -> WindResult<String> {
        let grid = self.grid();
        let srs = self
            .contributors()
            .next()
            .map(|h| h.projection.clone())
            .filter(|p| !p.is_empty());

        let sources = self
            .placements()?
            .into_iter()
            .map(|placement| VrtSource {
                source_filename: VrtFilename {
                    relative_to_vrt: 0,
                    path: placement.path.display().to_string(),
                },
                source_band: 1,
                src_rect: VrtRect::from(&placement.src),
                dst_rect: VrtRect::from(&placement.dst),
            })
            .collect();

        let dataset = VrtDataset {
            raster_x_size: grid.width,
            raster_y_size: grid.height,
            srs,
            geo_transform: grid
                .transform
                .to_gdal()
                .iter()
                .map(|v| format!("{:.16e}", v))
                .collect::<Vec<_>>()
                .join(", "),
            band: VrtRasterBand {
                data_type: "Float32",
                band: 1,
                no_data_value: NODATA_VALUE,
                sources,
            },
        };

        quick_xml::se::to_string(&dataset).map_err(|e| WindError::Xml(e.to_string()))
    }

    pub fn write_vrt<P: AsRef<Path>>(&self, path: P) -> WindResult<()> {
        let xml = self.to_vrt()?;
        std::fs::write(path.as_ref(), xml)?;
        log::debug!("Wrote mosaic {}", path.as_ref().display());
        Ok(())
    }
}

/// Run of destination cells along one axis and the source pixels feeding it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct AxisSegment {
    dst_off: usize,
    dst_len: usize,
    src_off: usize,
    src_len: usize,
}

/// Map destination cells `start..end` onto source pixels `first..` of a
/// source `len` pixels long. Cells before or past the source repeat its
/// edge pixel.
fn axis_segments(start: usize, end: usize, first: i64, len: usize) -> Vec<AxisSegment> {
    let cells = end.saturating_sub(start) as i64;
    if cells == 0 || len == 0 {
        return Vec::new();
    }
    let lead = (-first).clamp(0, cells);
    let inner_end = (len as i64 - first).clamp(lead, cells);

    let mut segments = Vec::with_capacity(3);
    if lead > 0 {
        segments.push(AxisSegment {
            dst_off: start,
            dst_len: lead as usize,
            src_off: 0,
            src_len: 1,
        });
    }
    if inner_end > lead {
        let run = (inner_end - lead) as usize;
        segments.push(AxisSegment {
            dst_off: start + lead as usize,
            dst_len: run,
            src_off: (first + lead) as usize,
            src_len: run,
        });
    }
    if cells > inner_end {
        segments.push(AxisSegment {
            dst_off: start + inner_end as usize,
            dst_len: (cells - inner_end) as usize,
            src_off: len - 1,
            src_len: 1,
        });
    }
    segments
}

/// Groups cropped results into mosaics
pub struct MosaicBuilder {
    plan: Arc<TilePlan>,
}

impl MosaicBuilder {
    pub fn new(plan: TilePlan) -> Self {
        Self { plan: Arc::new(plan) }
    }

    /// Mosaic of one (direction, variable) pair.
    ///
    /// Tiles without a matching result become holes. Two results for the
    /// same tile would break the one-contributor-per-coordinate rule and
    /// are rejected.
    pub fn build(&self, direction: Direction, variable: WindVariable, results: &[CroppedResult]) -> WindResult<Mosaic> {
        let mut entries: BTreeMap<TileId, MosaicEntry> = self
            .plan
            .tiles
            .iter()
            .map(|tile| {
                (
                    tile.id,
                    MosaicEntry {
                        tile: tile.id,
                        core_extent: tile.core_extent,
                        source: None,
                    },
                )
            })
            .collect();

        for result in results
            .iter()
            .filter(|r| r.direction == direction && r.variable == variable)
        {
            let entry = entries.get_mut(&result.tile).ok_or_else(|| {
                WindError::InvalidGeometry(format!("Result for unknown tile {}", result.tile))
            })?;
            if entry.source.is_some() {
                return Err(WindError::InvalidGeometry(format!(
                    "Tile {} has more than one {} result for direction {}",
                    result.tile,
                    variable,
                    direction.label()
                )));
            }
            entry.source = Some(result.handle.clone());
        }

        let mosaic = Mosaic {
            direction,
            variable,
            plan: Arc::clone(&self.plan),
            entries,
        };
        if !mosaic.is_complete() {
            log::warn!(
                "Mosaic {} {} is missing tiles {:?}",
                direction.label(),
                variable,
                mosaic.missing_tiles()
            );
        }
        Ok(mosaic)
    }

    /// One mosaic per (direction, variable), direction-major
    pub fn build_all(&self, directions: &[Direction], results: &[CroppedResult]) -> WindResult<Vec<Mosaic>> {
        let mut mosaics = Vec::with_capacity(directions.len() * WindVariable::ALL.len());
        for &direction in directions {
            for variable in WindVariable::ALL {
                mosaics.push(self.build(direction, variable, results)?);
            }
        }
        Ok(mosaics)
    }
}

#[derive(Serialize)]
#[serde(rename = "VRTDataset")]
struct VrtDataset {
    #[serde(rename = "@rasterXSize")]
    raster_x_size: usize,
    #[serde(rename = "@rasterYSize")]
    raster_y_size: usize,
    #[serde(rename = "SRS", skip_serializing_if = "Option::is_none")]
    srs: Option<String>,
    #[serde(rename = "GeoTransform")]
    geo_transform: String,
    #[serde(rename = "VRTRasterBand")]
    band: VrtRasterBand,
}

#[derive(Serialize)]
struct VrtRasterBand {
    #[serde(rename = "@dataType")]
    data_type: &'static str,
    #[serde(rename = "@band")]
    band: u32,
    #[serde(rename = "NoDataValue")]
    no_data_value: f64,
    #[serde(rename = "SimpleSource")]
    sources: Vec<VrtSource>,
}

#[derive(Serialize)]
struct VrtSource {
    #[serde(rename = "SourceFilename")]
    source_filename: VrtFilename,
    #[serde(rename = "SourceBand")]
    source_band: u32,
    #[serde(rename = "SrcRect")]
    src_rect: VrtRect,
    #[serde(rename = "DstRect")]
    dst_rect: VrtRect,
}

#[derive(Serialize)]
struct VrtFilename {
    #[serde(rename = "@relativeToVRT")]
    relative_to_vrt: u8,
    #[serde(rename = "$text")]
    path: String,
}

#[derive(Serialize)]
struct VrtRect {
    #[serde(rename = "@xOff")]
    x_off: usize,
    #[serde(rename = "@yOff")]
    y_off: usize,
    #[serde(rename = "@xSize")]
    x_size: usize,
    #[serde(rename = "@ySize")]
    y_size: usize,
}

impl From<&PixelWindow> for VrtRect {
    fn from(window: &PixelWindow) -> Self {
        Self {
            x_off: window.col_off,
            y_off: window.row_off,
            x_size: window.cols,
            y_size: window.rows,
        }
    }
}
