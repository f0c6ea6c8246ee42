use crate::core::geometry::validate_transform;
use crate::io::layout::OutputLayout;
use crate::io::raster_io::{is_projected, read_raster, write_geotiff};
use crate::types::{BoundingBox, Raster, WindError, WindResult};
use std::path::{Path, PathBuf};

/// Supplies the projected elevation raster a run is built on
pub trait ElevationSource {
    /// Produce the reference DEM and persist it under the layout
    fn prepare(&self, layout: &OutputLayout) -> WindResult<Raster>;
}

/// A DEM already on disk, in a projected CRS
pub struct ExistingDem {
    path: PathBuf,
}

impl ExistingDem {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl ElevationSource for ExistingDem {
    fn prepare(&self, layout: &OutputLayout) -> WindResult<Raster> {
        log::info!("Reading DEM from: {}", self.path.display());
        let dem = read_raster(&self.path)?;
        log::debug!("DEM size: {}x{}", dem.width(), dem.height());
        log::debug!("DEM geotransform: {:?}", dem.transform);

        check_projected(&dem)?;

        let target = layout.dem_path();
        log::info!("Copying DEM to {}", target.display());
        write_geotiff(&dem, &target)?;
        Ok(dem)
    }
}

/// Reject DEMs WindNinja cannot mesh: rotated or geographic grids
pub fn check_projected(dem: &Raster) -> WindResult<()> {
    validate_transform(&dem.transform)?;
    match is_projected(&dem.projection)? {
        Some(true) => Ok(()),
        Some(false) => Err(WindError::InvalidGeometry(
            "DEM must be in a projected coordinate system (e.g. UTM), not geographic".to_string(),
        )),
        None => {
            log::warn!("DEM has no coordinate system; assuming projected coordinates in meters");
            Ok(())
        }
    }
}

/// UTM zone EPSG code for the centre of a geographic bounding box
/// (326xx north, 327xx south)
pub fn utm_epsg_for(bbox: &BoundingBox) -> u32 {
    let lon_mid = (bbox.min_lon + bbox.max_lon) / 2.0;
    let lat_mid = (bbox.min_lat + bbox.max_lat) / 2.0;
    let hemisphere = ((45.0 + lat_mid) / 90.0).round() as i64;
    let zone = ((183.0 + lon_mid) / 6.0).round() as i64;
    (32700 - hemisphere * 100 + zone) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utm_zone_jura() {
        // Jura, France: centre at 5.975E falls in UTM zone 31N
        let bbox = BoundingBox {
            min_lon: 5.80,
            max_lon: 6.15,
            min_lat: 46.5,
            max_lat: 46.7,
        };
        assert_eq!(utm_epsg_for(&bbox), 32631);
    }

    #[test]
    fn test_utm_zone_southern_hemisphere() {
        // Wellington, NZ
        let bbox = BoundingBox {
            min_lon: 174.7,
            max_lon: 174.9,
            min_lat: -41.4,
            max_lat: -41.2,
        };
        assert_eq!(utm_epsg_for(&bbox), 32760);
    }
}
