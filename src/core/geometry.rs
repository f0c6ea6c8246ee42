//! Raster georeferencing helpers: extents, pixel windows and cropping.
//!
//! Only north-up transforms are supported. Rotated rasters are rejected
//! with [`WindError::InvalidGeometry`] rather than silently mis-tiled.

use crate::types::{Extent, GeoTransform, Raster, WindError, WindResult};
use ndarray::s;
use serde::{Deserialize, Serialize};

/// Integer window into a raster grid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelWindow {
    pub col_off: usize,
    pub row_off: usize,
    pub cols: usize,
    pub rows: usize,
}

impl PixelWindow {
    pub fn new(col_off: usize, row_off: usize, cols: usize, rows: usize) -> Self {
        Self { col_off, row_off, cols, rows }
    }

    /// Window covering a whole `width` x `height` grid
    pub fn full(width: usize, height: usize) -> Self {
        Self::new(0, 0, width, height)
    }

    pub fn col_end(&self) -> usize {
        self.col_off + self.cols
    }

    pub fn row_end(&self) -> usize {
        self.row_off + self.rows
    }

    pub fn is_empty(&self) -> bool {
        self.cols == 0 || self.rows == 0
    }
}

/// Reject transforms the tiler cannot handle
pub fn validate_transform(transform: &GeoTransform) -> WindResult<()> {
    if transform.rotation_x != 0.0 || transform.rotation_y != 0.0 {
        return Err(WindError::InvalidGeometry(format!(
            "Rotated geotransforms are not supported (rotation terms {}, {})",
            transform.rotation_x, transform.rotation_y
        )));
    }
    if !(transform.pixel_width.is_finite() && transform.pixel_width > 0.0) {
        return Err(WindError::InvalidGeometry(format!(
            "Pixel width must be positive, got {}",
            transform.pixel_width
        )));
    }
    if !(transform.pixel_height.is_finite() && transform.pixel_height != 0.0) {
        return Err(WindError::InvalidGeometry(format!(
            "Pixel height must be non-zero, got {}",
            transform.pixel_height
        )));
    }
    Ok(())
}

/// Absolute pixel size `(width, height)` in map units
pub fn pixel_size(transform: &GeoTransform) -> (f64, f64) {
    (transform.pixel_width.abs(), transform.pixel_height.abs())
}

/// Map coordinate of the top-left corner of pixel `(col, row)`
pub fn index_to_coord(transform: &GeoTransform, col: f64, row: f64) -> (f64, f64) {
    (
        transform.top_left_x + col * transform.pixel_width,
        transform.top_left_y + row * transform.pixel_height,
    )
}

/// Fractional `(col, row)` position of a map coordinate
pub fn coord_to_index(transform: &GeoTransform, x: f64, y: f64) -> (f64, f64) {
    (
        (x - transform.top_left_x) / transform.pixel_width,
        (y - transform.top_left_y) / transform.pixel_height,
    )
}

/// Extent covered by a `width` x `height` grid
pub fn extent_of(transform: &GeoTransform, width: usize, height: usize) -> Extent {
    let (x0, y0) = index_to_coord(transform, 0.0, 0.0);
    let (x1, y1) = index_to_coord(transform, width as f64, height as f64);
    Extent::new(x0.min(x1), y0.min(y1), x0.max(x1), y0.max(y1))
}

/// Extent covered by a window of a grid
pub fn window_extent(transform: &GeoTransform, window: &PixelWindow) -> Extent {
    extent_of(&window_transform(transform, window), window.cols, window.rows)
}

/// Geotransform of a window's top-left corner
pub fn window_transform(transform: &GeoTransform, window: &PixelWindow) -> GeoTransform {
    let (x, y) = index_to_coord(transform, window.col_off as f64, window.row_off as f64);
    GeoTransform {
        top_left_x: x,
        top_left_y: y,
        ..*transform
    }
}

/// Tolerance, in pixels, below which an extent edge counts as lying on a
/// pixel boundary
const EDGE_TOLERANCE: f64 = 1e-6;

/// Smallest pixel window of a grid covering a map extent, clamped to the
/// grid.
///
/// An edge that falls inside a pixel takes the whole pixel, so the window
/// may reach up to one pixel past the extent on each side.
pub fn window_for_extent(
    transform: &GeoTransform,
    width: usize,
    height: usize,
    extent: &Extent,
) -> WindResult<PixelWindow> {
    validate_transform(transform)?;

    let (c0, r0) = coord_to_index(transform, extent.xmin, extent.ymax);
    let (c1, r1) = coord_to_index(transform, extent.xmax, extent.ymin);

    let start = |v: f64, max: usize| -> usize { (v + EDGE_TOLERANCE).floor().clamp(0.0, max as f64) as usize };
    let end = |v: f64, max: usize| -> usize { (v - EDGE_TOLERANCE).ceil().clamp(0.0, max as f64) as usize };
    let col_start = start(c0.min(c1), width);
    let col_end = end(c0.max(c1), width).max(col_start);
    let row_start = start(r0.min(r1), height);
    let row_end = end(r0.max(r1), height).max(row_start);

    let window = PixelWindow::new(col_start, row_start, col_end - col_start, row_end - row_start);
    if window.is_empty() {
        return Err(WindError::InvalidGeometry(format!(
            "Extent {:?} does not overlap the {}x{} grid",
            extent, width, height
        )));
    }
    Ok(window)
}

/// Pixel `(col, row)` holding a map coordinate, clamped to a
/// `width` x `height` grid. `None` for an empty grid.
pub fn nearest_pixel(transform: &GeoTransform, width: usize, height: usize, x: f64, y: f64) -> Option<(usize, usize)> {
    if width == 0 || height == 0 {
        return None;
    }
    let (col, row) = coord_to_index(transform, x, y);
    let col = col.floor().clamp(0.0, (width - 1) as f64) as usize;
    let row = row.floor().clamp(0.0, (height - 1) as f64) as usize;
    Some((col, row))
}

impl Raster {
    pub fn extent(&self) -> Extent {
        extent_of(&self.transform, self.width(), self.height())
    }

    /// Copy of the samples inside a pixel window
    pub fn window(&self, window: &PixelWindow) -> WindResult<Raster> {
        if window.is_empty() || window.col_end() > self.width() || window.row_end() > self.height() {
            return Err(WindError::InvalidGeometry(format!(
                "Window {:?} exceeds {}x{} raster",
                window,
                self.width(),
                self.height()
            )));
        }
        let data = self
            .data
            .slice(s![window.row_off..window.row_end(), window.col_off..window.col_end()])
            .to_owned();
        Ok(Raster {
            data,
            transform: window_transform(&self.transform, window),
            projection: self.projection.clone(),
        })
    }

    /// New raster covering a map extent (see [`window_for_extent`])
    pub fn crop(&self, extent: &Extent) -> WindResult<Raster> {
        let window = window_for_extent(&self.transform, self.width(), self.height(), extent)?;
        log::debug!("Cropping {}x{} raster to window {:?}", self.width(), self.height(), window);
        self.window(&window)
    }

    /// Nearest sample at a map coordinate, clamped to the raster edge.
    /// Returns `None` for an empty raster.
    pub fn sample_nearest(&self, x: f64, y: f64) -> Option<f32> {
        let (col, row) = nearest_pixel(&self.transform, self.width(), self.height(), x, y)?;
        Some(self.data[[row, col]])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn test_raster(width: usize, height: usize, pixel: f64) -> Raster {
        let data = Array2::from_shape_fn((height, width), |(r, c)| (r * width + c) as f32);
        Raster::new(data, GeoTransform::north_up(500_000.0, 5_000_000.0, pixel, pixel), "")
    }

    #[test]
    fn test_extent_of_north_up() {
        let gt = GeoTransform::north_up(100.0, 1000.0, 30.0, 30.0);
        let extent = extent_of(&gt, 10, 20);
        assert_eq!(extent, Extent::new(100.0, 400.0, 400.0, 1000.0));
    }

    #[test]
    fn test_coord_index_round_trip() {
        let gt = GeoTransform::north_up(100.0, 1000.0, 30.0, 30.0);
        let (x, y) = index_to_coord(&gt, 3.0, 7.0);
        let (c, r) = coord_to_index(&gt, x, y);
        assert!((c - 3.0).abs() < 1e-12);
        assert!((r - 7.0).abs() < 1e-12);
    }

    #[test]
    fn test_rotated_transform_rejected() {
        let mut gt = GeoTransform::north_up(0.0, 0.0, 1.0, 1.0);
        gt.rotation_x = 0.5;
        assert!(matches!(validate_transform(&gt), Err(WindError::InvalidGeometry(_))));

        let zero = GeoTransform::north_up(0.0, 0.0, 0.0, 1.0);
        assert!(validate_transform(&zero).is_err());
    }

    #[test]
    fn test_crop_full_extent_is_identity() {
        let raster = test_raster(12, 8, 30.0);
        let cropped = raster.crop(&raster.extent()).unwrap();
        assert_eq!(cropped.data, raster.data);
        assert_eq!(cropped.transform, raster.transform);
    }

    #[test]
    fn test_crop_subwindow() {
        let raster = test_raster(12, 8, 30.0);
        let gt = raster.transform;
        let wanted = window_extent(&gt, &PixelWindow::new(2, 3, 4, 2));

        let cropped = raster.crop(&wanted).unwrap();
        assert_eq!(cropped.data.dim(), (2, 4));
        assert_eq!(cropped.data[[0, 0]], raster.data[[3, 2]]);
        assert_eq!(cropped.extent(), wanted);
    }

    #[test]
    fn test_crop_covers_unaligned_extent() {
        // 30 m grid starting at x = 280; the extent edges fall mid-pixel
        let raster = Raster::new(
            Array2::from_shape_fn((4, 15), |(_, c)| c as f32),
            GeoTransform::north_up(280.0, 120.0, 30.0, 30.0),
            "",
        );
        let wanted = Extent::new(330.0, 0.0, 670.0, 120.0);
        let cropped = raster.crop(&wanted).unwrap();

        let covered = cropped.extent();
        assert_eq!(covered.xmin, 310.0);
        assert_eq!(covered.xmax, 670.0);
        assert!(covered.contains_extent(&wanted));
        assert_eq!(cropped.data[[0, 0]], 1.0);
    }

    #[test]
    fn test_crop_outside_fails() {
        let raster = test_raster(4, 4, 10.0);
        let far = Extent::new(0.0, 0.0, 10.0, 10.0);
        assert!(raster.crop(&far).is_err());
    }

    #[test]
    fn test_sample_nearest_clamps() {
        let raster = test_raster(4, 4, 10.0);
        let extent = raster.extent();
        assert_eq!(raster.sample_nearest(extent.xmin + 1.0, extent.ymax - 1.0), Some(0.0));
        // the far south-east corner belongs to the last pixel
        assert_eq!(raster.sample_nearest(extent.xmax, extent.ymin), Some(15.0));
    }
}
