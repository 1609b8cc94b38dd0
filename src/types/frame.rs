//! Decoded point-cloud frames

/// One decoded point with its per-point sensor metadata.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Point {
    /// Cartesian position in meters
    pub position: [f64; 3],

    /// Index of the point in the sensor sample stream of its frame
    pub point_id: u32,

    /// Laser (channel) that produced the sample
    pub laser_id: u32,

    /// Reflectivity as reported by the sensor
    pub intensity: u8,

    /// Sample time in seconds (data time base)
    pub timestamp: f64,

    /// Measured range in meters
    pub distance: f64,
}

/// A decoded point cloud stored as parallel attribute arrays.
///
/// A frame is mutable only while the interpreter is filling it. Once a frame
/// boundary seals it, it is shared as `Arc<Frame>` and never modified again.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Frame {
    pub positions: Vec<[f32; 3]>,
    pub point_ids: Vec<u32>,
    pub laser_ids: Vec<u32>,
    pub intensities: Vec<u8>,
    pub timestamps: Vec<f64>,
    pub distances: Vec<f64>,
    reserved: usize,
}

impl Frame {
    /// Create an empty frame with room for `capacity` points.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            positions: Vec::with_capacity(capacity),
            point_ids: Vec::with_capacity(capacity),
            laser_ids: Vec::with_capacity(capacity),
            intensities: Vec::with_capacity(capacity),
            timestamps: Vec::with_capacity(capacity),
            distances: Vec::with_capacity(capacity),
            reserved: capacity,
        }
    }

    /// Number of points actually stored
    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }

    /// Number of points reserved when the frame was allocated
    pub fn reserved_points(&self) -> usize {
        self.reserved
    }

    /// Returns true once the stored points reach the reserved count
    pub fn is_full(&self) -> bool {
        self.reserved > 0 && self.len() >= self.reserved
    }

    /// Append one point to every attribute array.
    pub fn push(&mut self, point: Point) {
        let [x, y, z] = point.position;
        self.positions.push([x as f32, y as f32, z as f32]);
        self.point_ids.push(point.point_id);
        self.laser_ids.push(point.laser_id);
        self.intensities.push(point.intensity);
        self.timestamps.push(point.timestamp);
        self.distances.push(point.distance);
    }

    /// Reassemble the point at `index`, if any.
    pub fn point(&self, index: usize) -> Option<Point> {
        let [x, y, z] = *self.positions.get(index)?;
        Some(Point {
            position: [x as f64, y as f64, z as f64],
            point_id: self.point_ids[index],
            laser_id: self.laser_ids[index],
            intensity: self.intensities[index],
            timestamp: self.timestamps[index],
            distance: self.distances[index],
        })
    }

    /// Earliest point timestamp in the frame
    pub fn first_timestamp(&self) -> Option<f64> {
        self.timestamps.iter().copied().reduce(f64::min)
    }
}
