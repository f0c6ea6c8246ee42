use crate::core::geometry::{coord_to_index, pixel_size, validate_transform, window_extent, PixelWindow};
use crate::types::{Extent, GeoTransform, Raster, WindError, WindResult};
use serde::{Deserialize, Serialize};

/// Tile edge length, in simulation cells, that keeps WindNinja runs tractable
pub const DEFAULT_NRES: f64 = 600.0;

/// Extra DEM pixels added on interior tile edges so neighbouring runs overlap
pub const DEFAULT_NADD: usize = 25;

/// Tiling parameters
#[derive(Debug, Clone)]
pub struct TilingParams {
    /// Simulation mesh resolution in meters
    pub res_wind: f64,
    /// Target tile size in simulation cells
    pub nres: f64,
    /// Overlap margin in DEM pixels
    pub nadd: usize,
}

impl TilingParams {
    pub fn new(res_wind: f64) -> Self {
        Self {
            res_wind,
            nres: DEFAULT_NRES,
            nadd: DEFAULT_NADD,
        }
    }

    /// Target tile edge length in map units (`len_wn`)
    pub fn tile_length(&self) -> f64 {
        self.res_wind * self.nres
    }
}

/// Tile grid index: `i` counts west to east, `j` south to north
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileId {
    pub i: usize,
    pub j: usize,
}

impl TileId {
    pub fn new(i: usize, j: usize) -> Self {
        Self { i, j }
    }
}

impl std::fmt::Display for TileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}_{}", self.i, self.j)
    }
}

/// One simulation tile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tile {
    pub id: TileId,
    /// Non-overlapping slice of the domain, in DEM pixels
    pub core: PixelWindow,
    /// Core window grown by the overlap margin toward interior neighbours
    pub padded: PixelWindow,
    pub core_extent: Extent,
    pub padded_extent: Extent,
}

/// Result of planning: the tile grid over one domain
#[derive(Debug, Clone)]
pub struct TilePlan {
    pub nopt_x: usize,
    pub nopt_y: usize,
    pub width: usize,
    pub height: usize,
    pub transform: GeoTransform,
    pub domain: Extent,
    /// Tiles in `i`-major order
    pub tiles: Vec<Tile>,
}

impl TilePlan {
    /// The whole domain fits in one simulation
    pub fn is_single_tile(&self) -> bool {
        self.nopt_x == 1 && self.nopt_y == 1
    }

    pub fn tile(&self, id: TileId) -> Option<&Tile> {
        self.tiles.iter().find(|t| t.id == id)
    }

    /// Tile whose core extent holds a map coordinate.
    ///
    /// Core extents are half-open toward the east and south, except along
    /// the domain's own outer edge which belongs to the last tile.
    pub fn tile_at(&self, x: f64, y: f64) -> Option<&Tile> {
        let (c, r) = coord_to_index(&self.transform, x, y);
        if !(c >= 0.0 && r >= 0.0 && c <= self.width as f64 && r <= self.height as f64) {
            return None;
        }
        let col = (c.floor() as usize).min(self.width - 1);
        let row = (r.floor() as usize).min(self.height - 1);
        self.tiles.iter().find(|t| {
            col >= t.core.col_off && col < t.core.col_end() && row >= t.core.row_off && row < t.core.row_end()
        })
    }
}

/// Splits a DEM grid into simulation tiles
pub struct TilePlanner {
    params: TilingParams,
}

impl TilePlanner {
    pub fn new(params: TilingParams) -> Self {
        Self { params }
    }

    pub fn plan_for(&self, raster: &Raster) -> WindResult<TilePlan> {
        self.plan(&raster.transform, raster.width(), raster.height())
    }

    /// Compute the tile grid for a `width` x `height` raster
    pub fn plan(&self, transform: &GeoTransform, width: usize, height: usize) -> WindResult<TilePlan> {
        validate_transform(transform)?;
        if width == 0 || height == 0 {
            return Err(WindError::InvalidGeometry(format!(
                "Cannot tile an empty {}x{} raster",
                width, height
            )));
        }

        let len_wn = self.params.tile_length();
        if !(len_wn.is_finite() && len_wn > 0.0) {
            return Err(WindError::InvalidGeometry(format!(
                "Tile length must be positive, got {} (res_wind {} x nres {})",
                len_wn, self.params.res_wind, self.params.nres
            )));
        }

        let (pixel_width, pixel_height) = pixel_size(transform);
        let lenx = width as f64 * pixel_width;
        let leny = height as f64 * pixel_height;

        let nopt_x = (lenx / len_wn).floor() as usize + 1;
        let nopt_y = (leny / len_wn).floor() as usize + 1;

        if nopt_x > width || nopt_y > height {
            return Err(WindError::InvalidGeometry(format!(
                "{}x{} tiles requested for a {}x{} pixel raster; tile length {} m is below the pixel size",
                nopt_x, nopt_y, width, height, len_wn
            )));
        }

        log::info!(
            "Tiling {}x{} raster ({:.0} m x {:.0} m) into {}x{} tiles of ~{:.0} m",
            width, height, lenx, leny, nopt_x, nopt_y, len_wn
        );

        let col_bounds = Self::boundaries(width, nopt_x);
        let row_bounds = Self::boundaries(height, nopt_y);
        let nadd = self.params.nadd;

        let mut tiles = Vec::with_capacity(nopt_x * nopt_y);
        for i in 0..nopt_x {
            for j in 0..nopt_y {
                let col_off = col_bounds[i];
                let col_end = col_bounds[i + 1];
                // j counts from the southern edge, rows from the northern one
                let row_off = height - row_bounds[j + 1];
                let row_end = height - row_bounds[j];
                let core = PixelWindow::new(col_off, row_off, col_end - col_off, row_end - row_off);

                let west = if i > 0 { col_off.saturating_sub(nadd) } else { col_off };
                let east = if i + 1 < nopt_x { (col_end + nadd).min(width) } else { col_end };
                let north = if j + 1 < nopt_y { row_off.saturating_sub(nadd) } else { row_off };
                let south = if j > 0 { (row_end + nadd).min(height) } else { row_end };
                let padded = PixelWindow::new(west, north, east - west, south - north);

                let tile = Tile {
                    id: TileId::new(i, j),
                    core,
                    padded,
                    core_extent: window_extent(transform, &core),
                    padded_extent: window_extent(transform, &padded),
                };
                log::debug!("Tile {}: core {:?}, padded {:?}", tile.id, tile.core, tile.padded);
                tiles.push(tile);
            }
        }

        Ok(TilePlan {
            nopt_x,
            nopt_y,
            width,
            height,
            transform: *transform,
            domain: window_extent(transform, &PixelWindow::full(width, height)),
            tiles,
        })
    }

    /// Pixel boundaries of `n` near-equal slices of `len` pixels
    fn boundaries(len: usize, n: usize) -> Vec<usize> {
        (0..=n).map(|k| (k * len + n / 2) / n).collect()
    }
}
