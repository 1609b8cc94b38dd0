//! Precomputed trigonometry and correction tables

use std::sync::OnceLock;

/// Entries per full turn at 0.01 degree resolution.
pub const CIRCLE: usize = 36_000;

/// Sine and cosine sampled every 0.01 degree.
#[derive(Debug)]
pub struct TrigTable {
    cos: Vec<f64>,
    sin: Vec<f64>,
}

impl TrigTable {
    fn build() -> Self {
        let (cos, sin) = (0..CIRCLE)
            .map(|i| {
                let rad = (i as f64 / 100.0).to_radians();
                (rad.cos(), rad.sin())
            })
            .unzip();
        Self { cos, sin }
    }

    /// Process-wide table, built on first use.
    pub fn shared() -> &'static TrigTable {
        static TABLE: OnceLock<TrigTable> = OnceLock::new();
        TABLE.get_or_init(TrigTable::build)
    }

    /// Table index of an angle in hundredths of a degree, wrapped into one turn.
    pub fn index(centidegrees: i64) -> usize {
        centidegrees.rem_euclid(CIRCLE as i64) as usize
    }

    pub fn cos(&self, index: usize) -> f64 {
        self.cos[index]
    }

    pub fn sin(&self, index: usize) -> f64 {
        self.sin[index]
    }

    /// Cartesian position of a return from its range and angles in hundredths of a degree.
    pub fn to_cartesian(&self, distance: f64, azimuth: i64, elevation: i64) -> [f64; 3] {
        let az = Self::index(azimuth);
        let el = Self::index(elevation);
        let xy = distance * self.cos(el);
        [xy * self.cos(az), xy * self.sin(az), distance * self.sin(el)]
    }
}

/// Per-point correction vectors, multiplied by the measured range.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CorrectionTable {
    vectors: Vec<[f64; 3]>,
}

impl CorrectionTable {
    pub fn new(vectors: Vec<[f64; 3]>) -> Self {
        Self { vectors }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    /// Corrected position of point `index`, if the table covers it.
    pub fn apply(&self, index: usize, distance: f64) -> Option<[f64; 3]> {
        let [x, y, z] = *self.vectors.get(index)?;
        Some([distance * x, distance * y, distance * z])
    }
}

/// Row-major 4x4 rigid transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RtMatrix(pub [[f64; 4]; 4]);

impl RtMatrix {
    pub fn from_row_major(values: &[f64; 16]) -> Self {
        let mut m = [[0.0; 4]; 4];
        for (i, row) in m.iter_mut().enumerate() {
            row.copy_from_slice(&values[i * 4..i * 4 + 4]);
        }
        Self(m)
    }

    pub fn transform(&self, [x, y, z]: [f64; 3]) -> [f64; 3] {
        let m = &self.0;
        [
            m[0][0] * x + m[0][1] * y + m[0][2] * z + m[0][3],
            m[1][0] * x + m[1][1] * y + m[1][2] * z + m[1][3],
            m[2][0] * x + m[2][1] * y + m[2][2] * z + m[2][3],
        ]
    }
}
