use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Real-valued raster sample
pub type Sample = f32;

/// 2D raster data array (row x column, row 0 is the northern edge)
pub type RasterData = Array2<Sample>;

/// No-data marker written into mosaics and GeoTIFF outputs
pub const NODATA_VALUE: f64 = -9999.0;

/// Geospatial transformation parameters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64, // negative for north-up rasters
}

impl GeoTransform {
    /// North-up transform without rotation terms
    pub fn north_up(top_left_x: f64, top_left_y: f64, pixel_width: f64, pixel_height: f64) -> Self {
        Self {
            top_left_x,
            pixel_width,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -pixel_height.abs(),
        }
    }

    pub fn from_gdal(gt: [f64; 6]) -> Self {
        Self {
            top_left_x: gt[0],
            pixel_width: gt[1],
            rotation_x: gt[2],
            top_left_y: gt[3],
            rotation_y: gt[4],
            pixel_height: gt[5],
        }
    }

    pub fn to_gdal(&self) -> [f64; 6] {
        [
            self.top_left_x,
            self.pixel_width,
            self.rotation_x,
            self.top_left_y,
            self.rotation_y,
            self.pixel_height,
        ]
    }
}

/// Geographic bounding box in degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub max_lon: f64,
    pub min_lat: f64,
    pub max_lat: f64,
}

/// Projected bounding box `(xmin, ymin, xmax, ymax)`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub xmin: f64,
    pub ymin: f64,
    pub xmax: f64,
    pub ymax: f64,
}

impl Extent {
    pub fn new(xmin: f64, ymin: f64, xmax: f64, ymax: f64) -> Self {
        Self { xmin, ymin, xmax, ymax }
    }

    pub fn width(&self) -> f64 {
        self.xmax - self.xmin
    }

    pub fn height(&self) -> f64 {
        self.ymax - self.ymin
    }

    pub fn area(&self) -> f64 {
        self.width().max(0.0) * self.height().max(0.0)
    }

    /// Overlap between two extents, `None` when they only touch or are disjoint
    pub fn intersection(&self, other: &Extent) -> Option<Extent> {
        let xmin = self.xmin.max(other.xmin);
        let ymin = self.ymin.max(other.ymin);
        let xmax = self.xmax.min(other.xmax);
        let ymax = self.ymax.min(other.ymax);
        if xmax > xmin && ymax > ymin {
            Some(Extent::new(xmin, ymin, xmax, ymax))
        } else {
            None
        }
    }

    pub fn contains_extent(&self, other: &Extent) -> bool {
        other.xmin >= self.xmin
            && other.xmax <= self.xmax
            && other.ymin >= self.ymin
            && other.ymax <= self.ymax
    }
}

/// A georeferenced single-band raster.
///
/// Rasters are treated as write-once values: pipeline stages build new
/// rasters instead of mutating their inputs.
#[derive(Debug, Clone)]
pub struct Raster {
    pub data: RasterData,
    pub transform: GeoTransform,
    /// Coordinate reference system as WKT (may be empty)
    pub projection: String,
}

impl Raster {
    pub fn new(data: RasterData, transform: GeoTransform, projection: impl Into<String>) -> Self {
        Self {
            data,
            transform,
            projection: projection.into(),
        }
    }

    /// Number of columns
    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    /// Number of rows
    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// A raster sharing this raster's georeference but carrying other samples
    pub fn with_data(&self, data: RasterData) -> Self {
        Self {
            data,
            transform: self.transform,
            projection: self.projection.clone(),
        }
    }
}

/// Wind direction category.
///
/// Directions are `index * 360 / count` degrees; the integer label handed
/// to the simulator is that bearing truncated toward zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Direction {
    index: u32,
    count: u32,
}

impl Direction {
    /// All `ncat` directions, evenly spaced over `[0, 360)`
    pub fn all(ncat: u32) -> WindResult<Vec<Direction>> {
        if ncat == 0 || ncat > 360 {
            return Err(WindError::Configuration(format!(
                "ncat must be in 1..=360, got {}",
                ncat
            )));
        }
        Ok((0..ncat).map(|index| Direction { index, count: ncat }).collect())
    }

    pub fn step(&self) -> f64 {
        360.0 / self.count as f64
    }

    pub fn degrees(&self) -> f64 {
        self.index as f64 * self.step()
    }

    /// Integer bearing used on the simulator command line and in file names
    pub fn label(&self) -> u32 {
        self.degrees().trunc() as u32
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}°", self.label())
    }
}

/// Output variables produced for every work item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindVariable {
    /// Eastward wind component
    U,
    /// Northward wind component
    V,
    /// Local speed divided by the normalization base
    SpeedUp,
}

impl WindVariable {
    pub const ALL: [WindVariable; 3] = [WindVariable::U, WindVariable::V, WindVariable::SpeedUp];
}

impl std::fmt::Display for WindVariable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WindVariable::U => write!(f, "U"),
            WindVariable::V => write!(f, "V"),
            WindVariable::SpeedUp => write!(f, "speed-up"),
        }
    }
}

/// Error types for wind map processing
#[derive(Debug, thiserror::Error)]
pub enum WindError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Collaborator failure: {0}")]
    Collaborator(String),

    #[error("Degenerate normalization: {0}")]
    DegenerateNormalization(String),

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("XML serialization error: {0}")]
    Xml(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for wind map operations
pub type WindResult<T> = Result<T, WindError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_direction_labels() {
        let dirs = Direction::all(4).unwrap();
        let labels: Vec<u32> = dirs.iter().map(|d| d.label()).collect();
        assert_eq!(labels, vec![0, 90, 180, 270]);

        // 360 / 7 = 51.43, labels truncate
        let dirs = Direction::all(7).unwrap();
        assert_eq!(dirs[1].label(), 51);
        assert_eq!(dirs[6].label(), 308);
    }

    #[test]
    fn test_direction_count_bounds() {
        assert!(Direction::all(0).is_err());
        assert!(Direction::all(361).is_err());

        // unit step keeps labels unique
        let dirs = Direction::all(359).unwrap();
        let mut labels: Vec<u32> = dirs.iter().map(|d| d.label()).collect();
        labels.dedup();
        assert_eq!(labels.len(), 359);
    }

    #[test]
    fn test_extent_intersection() {
        let a = Extent::new(0.0, 0.0, 10.0, 10.0);
        let b = Extent::new(5.0, 5.0, 15.0, 15.0);
        let c = Extent::new(10.0, 0.0, 20.0, 10.0);

        assert_eq!(a.intersection(&b), Some(Extent::new(5.0, 5.0, 10.0, 10.0)));
        assert_eq!(a.intersection(&c), None);
        assert!(a.contains_extent(&Extent::new(1.0, 1.0, 9.0, 9.0)));
    }
}
