//! Point-level crop regions
//!
//! A crop region either keeps the points inside it (the default) or, with
//! `crop_outside`, keeps the points outside it.
//!
//! Region layout per mode:
//!
//! | Mode        | `region`                                                   |
//! |-------------|------------------------------------------------------------|
//! | `Cartesian` | `[x_min, x_max, y_min, y_max, z_min, z_max]` (meters)      |
//! | `Spherical` | `[az_min, az_max, el_min, el_max, r_min, r_max]` (degrees, meters) |
//!
//! Spherical azimuth runs clockwise from +Y in `[-180, 180]`; an azimuth range
//! whose minimum exceeds its maximum wraps across the seam, so `[170, -170]`
//! covers the 20 degrees behind the sensor.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CropMode {
    #[default]
    None,
    Cartesian,
    Spherical,
    /// Accepted for configuration compatibility, crops nothing
    Cylindric,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CropConfig {
    pub mode: CropMode,
    pub region: [f64; 6],
    pub crop_outside: bool,
}

impl CropConfig {
    pub fn cartesian(region: [f64; 6]) -> Self {
        Self { mode: CropMode::Cartesian, region, crop_outside: false }
    }

    pub fn spherical(region: [f64; 6]) -> Self {
        Self { mode: CropMode::Spherical, region, crop_outside: false }
    }

    pub fn outside(mut self) -> Self {
        self.crop_outside = true;
        self
    }

    /// Returns true when the point at `position` must be discarded.
    pub fn should_crop_out(&self, position: [f64; 3]) -> bool {
        let [x, y, z] = position;
        let r = &self.region;
        let inside = match self.mode {
            CropMode::None | CropMode::Cylindric => return false,
            CropMode::Cartesian => {
                (r[0]..=r[1]).contains(&x) && (r[2]..=r[3]).contains(&y) && (r[4]..=r[5]).contains(&z)
            }
            CropMode::Spherical => {
                let range = (x * x + y * y + z * z).sqrt();
                let azimuth = x.atan2(y).to_degrees();
                let elevation = 90.0 - (z / range).acos().to_degrees();
                inside_interval_mod(azimuth, r[0], r[1], 360.0)
                    && (r[2]..=r[3]).contains(&elevation)
                    && (r[4]..=r[5]).contains(&range)
            }
        };
        inside == self.crop_outside
    }
}

fn place_in_interval(x: f64, modulo: f64) -> f64 {
    if x < 0.0 { x + (-x / modulo).ceil() * modulo } else { x % modulo }
}

/// Membership of `x` in `[a, b]` on a circle of circumference `modulo`.
fn inside_interval_mod(x: f64, a: f64, b: f64, modulo: f64) -> bool {
    let x = place_in_interval(x, modulo);
    let a = place_in_interval(a, modulo);
    let b = place_in_interval(b, modulo);
    if a >= b { x >= a || x <= b } else { x >= a && x <= b }
}
