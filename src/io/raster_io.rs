use crate::types::{GeoTransform, Raster, WindError, WindResult, NODATA_VALUE};
use gdal::raster::Buffer;
use gdal::{Dataset, DriverManager};
use ndarray::Array2;
use std::path::Path;

/// Read the first band of any GDAL-readable raster as `f32`
pub fn read_raster<P: AsRef<Path>>(path: P) -> WindResult<Raster> {
    log::debug!("Reading raster: {}", path.as_ref().display());

    let dataset = Dataset::open(path.as_ref())?;
    let geo_transform = dataset.geo_transform()?;
    let (width, height) = dataset.raster_size();
    let projection = dataset.projection();

    let rasterband = dataset.rasterband(1)?;
    let band_data = rasterband.read_as::<f32>((0, 0), (width, height), (width, height), None)?;

    let data = Array2::from_shape_vec((height, width), band_data.data).map_err(|e| {
        WindError::Processing(format!(
            "Failed to reshape {} into {}x{}: {}",
            path.as_ref().display(),
            width,
            height,
            e
        ))
    })?;

    Ok(Raster::new(data, GeoTransform::from_gdal(geo_transform), projection))
}

/// Read one pixel of the first band
pub fn read_pixel<P: AsRef<Path>>(path: P, col: usize, row: usize) -> WindResult<f32> {
    let dataset = Dataset::open(path.as_ref())?;
    let rasterband = dataset.rasterband(1)?;
    let buffer = rasterband.read_as::<f32>((col as isize, row as isize), (1, 1), (1, 1), None)?;
    buffer.data.first().copied().ok_or_else(|| {
        WindError::Processing(format!(
            "No sample at ({}, {}) in {}",
            col,
            row,
            path.as_ref().display()
        ))
    })
}

/// Write a raster as a single-band Float32 GeoTIFF
pub fn write_geotiff<P: AsRef<Path>>(raster: &Raster, output_path: P) -> WindResult<()> {
    log::debug!("Writing GeoTIFF: {}", output_path.as_ref().display());

    let driver = DriverManager::get_driver_by_name("GTiff")?;
    let (height, width) = raster.data.dim();

    let mut dataset = driver.create_with_band_type::<f32, _>(
        output_path.as_ref(),
        width as isize,
        height as isize,
        1,
    )?;

    dataset.set_geo_transform(&raster.transform.to_gdal())?;
    if !raster.projection.is_empty() {
        dataset.set_projection(&raster.projection)?;
    }

    let mut rasterband = dataset.rasterband(1)?;
    let flat_data: Vec<f32> = raster.data.iter().cloned().collect();
    let buffer = Buffer::new((width, height), flat_data);
    rasterband.write((0, 0), (width, height), &buffer)?;
    rasterband.set_no_data_value(Some(NODATA_VALUE))?;

    Ok(())
}

/// Whether a WKT definition describes a projected coordinate system.
/// `None` when the raster carries no CRS at all.
pub fn is_projected(wkt: &str) -> WindResult<Option<bool>> {
    if wkt.trim().is_empty() {
        return Ok(None);
    }
    let srs = gdal::spatial_ref::SpatialRef::from_wkt(wkt)?;
    Ok(Some(srs.is_projected()))
}
