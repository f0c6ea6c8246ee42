use crate::types::{Raster, RasterData, WindError, WindResult, WindVariable};
use ndarray::{Array2, ArrayView1, ArrayViewMut1, Zip};
use num_traits::Float;

/// Smallest normalization base accepted before speed-up is considered degenerate
pub const MIN_NORMALIZATION_BASE: f64 = 1e-6;

/// How the reference wind speed for the speed-up factor is computed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizationPolicy {
    /// Scalar mean of the whole tile
    TileMean,
    /// Square moving average of `window` samples per side
    MovingAverage { window: usize },
}

impl NormalizationPolicy {
    /// Moving-average window for a target averaging resolution
    pub fn grid(targ_res: f64, res_wind: f64) -> Self {
        let window = (targ_res / res_wind).round().max(1.0) as usize;
        NormalizationPolicy::MovingAverage { window }
    }
}

/// Transformed simulation output, still on the simulation grid
#[derive(Debug, Clone)]
pub struct TransformedResult {
    pub u: Raster,
    pub v: Raster,
    pub speed_up: Raster,
}

impl TransformedResult {
    pub fn get(&self, variable: WindVariable) -> &Raster {
        match variable {
            WindVariable::U => &self.u,
            WindVariable::V => &self.v,
            WindVariable::SpeedUp => &self.speed_up,
        }
    }
}

/// Converts (speed, direction) rasters into components and speed-up
#[derive(Debug, Clone)]
pub struct WindTransform {
    policy: NormalizationPolicy,
}

impl WindTransform {
    pub fn new(policy: NormalizationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> NormalizationPolicy {
        self.policy
    }

    pub fn apply(&self, speed: &Raster, direction: &Raster) -> WindResult<TransformedResult> {
        if speed.data.dim() != direction.data.dim() {
            return Err(WindError::InvalidGeometry(format!(
                "Speed grid {:?} and direction grid {:?} differ",
                speed.data.dim(),
                direction.data.dim()
            )));
        }

        let (u, v) = wind_components(&speed.data, &direction.data);
        let speed_up = match self.policy {
            NormalizationPolicy::TileMean => speed_up_tile_mean(&speed.data)?,
            NormalizationPolicy::MovingAverage { window } => speed_up_moving_average(&speed.data, window)?,
        };

        Ok(TransformedResult {
            u: speed.with_data(u),
            v: speed.with_data(v),
            speed_up: speed.with_data(speed_up),
        })
    }
}

/// `U = -S sin(D)`, `V = -S cos(D)` with `D` in meteorological degrees
pub fn wind_components(speed: &RasterData, direction: &RasterData) -> (RasterData, RasterData) {
    let mut u = Array2::zeros(speed.dim());
    let mut v = Array2::zeros(speed.dim());
    Zip::from(&mut u)
        .and(&mut v)
        .and(speed)
        .and(direction)
        .for_each(|u, v, &s, &d| {
            let (sin, cos) = (d as f64).to_radians().sin_cos();
            *u = (-(s as f64) * sin) as f32;
            *v = (-(s as f64) * cos) as f32;
        });
    (u, v)
}

/// Arithmetic mean, accumulated in f64
pub fn tile_mean(speed: &RasterData) -> f64 {
    if speed.is_empty() {
        return f64::NAN;
    }
    speed.iter().map(|&s| s as f64).sum::<f64>() / speed.len() as f64
}

fn speed_up_tile_mean(speed: &RasterData) -> WindResult<RasterData> {
    let base = tile_mean(speed);
    if !base.is_finite() || base.abs() < MIN_NORMALIZATION_BASE {
        return Err(WindError::DegenerateNormalization(format!(
            "Tile mean wind speed is {}",
            base
        )));
    }
    log::debug!("Tile mean wind speed: {:.3}", base);
    Ok(speed.mapv(|s| (s as f64 / base) as f32))
}

fn speed_up_moving_average(speed: &RasterData, window: usize) -> WindResult<RasterData> {
    let widened = speed.mapv(|s| s as f64);
    let base = uniform_filter(&widened, window);

    let degenerate = base
        .iter()
        .filter(|b| !b.is_finite() || b.abs() < MIN_NORMALIZATION_BASE)
        .count();
    if degenerate > 0 {
        return Err(WindError::DegenerateNormalization(format!(
            "{} of {} cells have a near-zero {}x{} moving average",
            degenerate,
            base.len(),
            window,
            window
        )));
    }

    let mut out = Array2::zeros(speed.dim());
    Zip::from(&mut out)
        .and(speed)
        .and(&base)
        .for_each(|o, &s, &b| *o = (s as f64 / b) as f32);
    Ok(out)
}

/// Square moving average with `nearest` edge handling.
///
/// Matches `scipy.ndimage.uniform_filter(input, size, mode="nearest")`: the
/// window holds `size / 2` samples before the centre and the rest after it,
/// and out-of-range indices are clamped to the edge.
pub fn uniform_filter<T>(input: &Array2<T>, size: usize) -> Array2<T>
where
    T: Float + Send + Sync,
{
    if size <= 1 || input.is_empty() {
        return input.clone();
    }

    let mut rows_done = Array2::zeros(input.dim());
    let row_pass = Zip::from(rows_done.rows_mut()).and(input.rows());
    #[cfg(feature = "parallel")]
    row_pass.par_for_each(|out, line| filter_line(line, out, size));
    #[cfg(not(feature = "parallel"))]
    row_pass.for_each(|out, line| filter_line(line, out, size));

    let mut filtered = Array2::zeros(input.dim());
    let col_pass = Zip::from(filtered.columns_mut()).and(rows_done.columns());
    #[cfg(feature = "parallel")]
    col_pass.par_for_each(|out, line| filter_line(line, out, size));
    #[cfg(not(feature = "parallel"))]
    col_pass.for_each(|out, line| filter_line(line, out, size));

    filtered
}

/// One-dimensional moving average over a clamped line using a running sum
fn filter_line<T: Float>(input: ArrayView1<T>, mut output: ArrayViewMut1<T>, size: usize) {
    let n = input.len();
    let before = size / 2;
    let at = |k: isize| -> f64 {
        let idx = k.clamp(0, n as isize - 1) as usize;
        input[idx].to_f64().unwrap_or(f64::NAN)
    };

    let mut sum: f64 = (0..size as isize).map(|k| at(k - before as isize)).sum();
    for i in 0..n {
        output[i] = T::from(sum / size as f64).unwrap_or_else(T::nan);
        let leaving = i as isize - before as isize;
        sum += at(leaving + size as isize) - at(leaving);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn raster(data: RasterData) -> Raster {
        Raster::new(data, GeoTransform::north_up(0.0, 0.0, 150.0, 150.0), "")
    }

    #[test]
    fn test_components_cardinal_directions() {
        let speed = array![[10.0f32, 10.0, 10.0, 10.0]];
        let dir = array![[0.0f32, 90.0, 180.0, 270.0]];
        let (u, v) = wind_components(&speed, &dir);

        // northerly wind blows toward the south
        assert_abs_diff_eq!(u[[0, 0]], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(v[[0, 0]], -10.0, epsilon = 1e-5);
        // easterly wind blows toward the west
        assert_abs_diff_eq!(u[[0, 1]], -10.0, epsilon = 1e-5);
        assert_abs_diff_eq!(v[[0, 2]], 10.0, epsilon = 1e-5);
        assert_abs_diff_eq!(u[[0, 3]], 10.0, epsilon = 1e-5);
    }

    #[test]
    fn test_components_recover_speed_and_direction() {
        let speed = Array2::from_shape_fn((6, 7), |(r, c)| 1.0 + (r * 7 + c) as f32 * 0.37);
        let dir = Array2::from_shape_fn((6, 7), |(r, c)| ((r * 7 + c) as f32 * 8.3) % 360.0);
        let (u, v) = wind_components(&speed, &dir);

        for ((idx, &s), &d) in speed.indexed_iter().zip(dir.iter()) {
            let (uu, vv) = (u[idx] as f64, v[idx] as f64);
            assert_abs_diff_eq!((uu * uu + vv * vv).sqrt(), s as f64, epsilon = 1e-4);

            let recovered = (-uu).atan2(-vv).to_degrees().rem_euclid(360.0);
            let diff = (recovered - d as f64).rem_euclid(360.0);
            assert!(diff < 1e-3 || diff > 360.0 - 1e-3, "direction {} recovered as {}", d, recovered);
        }
    }

    #[test]
    fn test_tile_mean_speed_up_averages_one() {
        let speed = Array2::from_shape_fn((10, 12), |(r, c)| 2.0 + ((r + c) % 5) as f32);
        let dir = Array2::zeros((10, 12));
        let result = WindTransform::new(NormalizationPolicy::TileMean)
            .apply(&raster(speed), &raster(dir))
            .unwrap();

        assert_abs_diff_eq!(tile_mean(&result.speed_up.data), 1.0, epsilon = 1e-6);
    }

    #[test]
    fn test_grid_speed_up_matches_moving_average() {
        let speed = Array2::from_shape_fn((9, 11), |(r, c)| 1.0 + ((r * 3 + c * 7) % 11) as f32);
        let dir = Array2::zeros((9, 11));
        let result = WindTransform::new(NormalizationPolicy::MovingAverage { window: 4 })
            .apply(&raster(speed.clone()), &raster(dir))
            .unwrap();

        let base = uniform_filter(&speed.mapv(|s| s as f64), 4);
        for ((idx, &s), &b) in speed.indexed_iter().zip(base.iter()) {
            assert_abs_diff_eq!(result.speed_up.data[idx] as f64, s as f64 / b, epsilon = 1e-5);
        }
    }

    #[test]
    fn test_uniform_filter_nearest_mode() {
        // scipy.ndimage.uniform_filter1d([1, 2, 3, 4], 3, mode="nearest")
        let line = array![[1.0f64, 2.0, 3.0, 4.0]];
        let out = uniform_filter(&line, 3);
        let expected = [4.0 / 3.0, 2.0, 3.0, 11.0 / 3.0];
        for (o, e) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*o, *e, epsilon = 1e-12);
        }

        // even windows lean backward: size 2 averages [i-1, i]
        let out = uniform_filter(&line, 2);
        let expected = [1.0, 1.5, 2.5, 3.5];
        for (o, e) in out.iter().zip(expected.iter()) {
            assert_abs_diff_eq!(*o, *e, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_uniform_filter_brute_force_2d() {
        let input = Array2::from_shape_fn((7, 5), |(r, c)| ((r * 13 + c * 29) % 17) as f64);
        let size = 3usize;
        let out = uniform_filter(&input, size);
        let (h, w) = input.dim();
        for r in 0..h {
            for c in 0..w {
                let mut sum = 0.0;
                for dr in -1isize..=1 {
                    for dc in -1isize..=1 {
                        let rr = (r as isize + dr).clamp(0, h as isize - 1) as usize;
                        let cc = (c as isize + dc).clamp(0, w as isize - 1) as usize;
                        sum += input[[rr, cc]];
                    }
                }
                assert_abs_diff_eq!(out[[r, c]], sum / 9.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn test_window_one_is_identity() {
        let input = array![[1.0f32, 5.0], [2.0, 7.0]];
        assert_eq!(uniform_filter(&input, 1), input);
        assert_eq!(NormalizationPolicy::grid(100.0, 150.0), NormalizationPolicy::MovingAverage { window: 1 });
        assert_eq!(NormalizationPolicy::grid(1000.0, 150.0), NormalizationPolicy::MovingAverage { window: 7 });
    }

    #[test]
    fn test_zero_wind_is_degenerate() {
        let zeros = Array2::<f32>::zeros((4, 4));
        for policy in [NormalizationPolicy::TileMean, NormalizationPolicy::MovingAverage { window: 3 }] {
            let result = WindTransform::new(policy).apply(&raster(zeros.clone()), &raster(zeros.clone()));
            assert!(matches!(result, Err(WindError::DegenerateNormalization(_))));
        }
    }

    #[test]
    fn test_mismatched_grids_rejected() {
        let a = Array2::<f32>::ones((4, 4));
        let b = Array2::<f32>::ones((4, 5));
        let result = WindTransform::new(NormalizationPolicy::TileMean).apply(&raster(a), &raster(b));
        assert!(matches!(result, Err(WindError::InvalidGeometry(_))));
    }
}
